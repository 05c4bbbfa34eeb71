use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Object identity: an object type plus a per-type object number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Invid {
    pub type_id: u16,
    pub num: u32,
}

impl Invid {
    pub const fn new(type_id: u16, num: u32) -> Self {
        Self { type_id, num }
    }
}

impl fmt::Display for Invid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_id, self.num)
    }
}

impl FromStr for Invid {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (type_part, num_part) = s
            .split_once(':')
            .ok_or_else(|| format!("malformed invid '{}'", s))?;
        let type_id = type_part
            .trim()
            .parse::<u16>()
            .map_err(|e| format!("malformed invid type in '{}': {}", s, e))?;
        let num = num_part
            .trim()
            .parse::<u32>()
            .map_err(|e| format!("malformed invid number in '{}': {}", s, e))?;
        Ok(Self { type_id, num })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldId(pub u16);

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an in-progress (uncommitted) transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

/// Journal-assigned number of a committed transaction.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TxnNumber(pub u64);

impl TxnNumber {
    pub fn next(self) -> Self {
        TxnNumber(self.0 + 1)
    }
}

impl fmt::Display for TxnNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session_{}", self.0)
    }
}

/// An IPv4 or IPv6 address held by value, so that set membership compares
/// the address bytes rather than the allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IpAddress(Box<[u8]>);

impl IpAddress {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        match bytes.len() {
            4 | 16 => Ok(Self(bytes.into())),
            n => Err(format!("IP address must be 4 or 16 bytes, got {}", n)),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_v4(&self) -> bool {
        self.0.len() == 4
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_v4() {
            write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
        } else {
            let groups: Vec<String> = self
                .0
                .chunks(2)
                .map(|pair| format!("{:x}", u16::from_be_bytes([pair[0], pair[1]])))
                .collect();
            write!(f, "{}", groups.join(":"))
        }
    }
}

/// A single element of a vector field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VectorValue {
    Str(String),
    Invid(Invid),
    Ip(IpAddress),
}

impl fmt::Display for VectorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VectorValue::Str(s) => write!(f, "{}", s),
            VectorValue::Invid(i) => write!(f, "{}", i),
            VectorValue::Ip(ip) => write!(f, "{}", ip),
        }
    }
}

/// Value of one object field. The storage layer owns the full type system;
/// this is the subset the commit pipeline needs to diff and replicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Str(String),
    /// Milliseconds since the Unix epoch.
    Date(i64),
    Invid(Invid),
    Ip(IpAddress),
    Vector(Vec<VectorValue>),
}

impl FieldValue {
    pub fn is_vector(&self) -> bool {
        matches!(self, FieldValue::Vector(_))
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Int(i) => write!(f, "{}", i),
            FieldValue::Str(s) => write!(f, "{}", s),
            FieldValue::Date(ms) => write!(f, "{}", ms),
            FieldValue::Invid(i) => write!(f, "{}", i),
            FieldValue::Ip(ip) => write!(f, "{}", ip),
            FieldValue::Vector(values) => {
                let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "{}", parts.join(","))
            }
        }
    }
}

/// Full field-value image of one object, ordered by field id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldImage(BTreeMap<FieldId, FieldValue>);

impl FieldImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: FieldId) -> Option<&FieldValue> {
        self.0.get(&field)
    }

    pub fn set(&mut self, field: FieldId, value: FieldValue) -> Option<FieldValue> {
        self.0.insert(field, value)
    }

    pub fn remove(&mut self, field: FieldId) -> Option<FieldValue> {
        self.0.remove(&field)
    }

    pub fn contains(&self, field: FieldId) -> bool {
        self.0.contains_key(&field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FieldId, &FieldValue)> {
        self.0.iter()
    }

    pub fn field_ids(&self) -> impl Iterator<Item = FieldId> + '_ {
        self.0.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(FieldId, FieldValue)> for FieldImage {
    fn from_iter<T: IntoIterator<Item = (FieldId, FieldValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
