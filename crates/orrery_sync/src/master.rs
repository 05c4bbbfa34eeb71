//! Augmentation hook: lets channel-specific logic pull extra objects and
//! fields into a transaction's sync output.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use orrery_common::types::{FieldId, FieldImage, Invid};
use orrery_txn::delta::ObjectDelta;
use orrery_txn::edit_set::EditedObject;
use orrery_txn::store::ObjectStatus;

/// Fields of one object to include.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSet {
    All,
    Fields(BTreeSet<FieldId>),
}

impl FieldSet {
    pub fn contains(&self, field: FieldId) -> bool {
        match self {
            FieldSet::All => true,
            FieldSet::Fields(fields) => fields.contains(&field),
        }
    }

    /// Union; `All` absorbs any field set.
    pub fn merge(&mut self, other: FieldSet) {
        match (&mut *self, other) {
            (FieldSet::All, _) => {}
            (this, FieldSet::All) => *this = FieldSet::All,
            (FieldSet::Fields(mine), FieldSet::Fields(theirs)) => mine.extend(theirs),
        }
    }
}

/// Object identity → fields to include, one entry per object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldBook(BTreeMap<Invid, FieldSet>);

impl FieldBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, invid: Invid, field: FieldId) {
        self.merge_entry(invid, FieldSet::Fields(BTreeSet::from([field])));
    }

    pub fn add_all(&mut self, invid: Invid) {
        self.merge_entry(invid, FieldSet::All);
    }

    /// Make sure `invid` is present, without naming any field.
    pub fn touch(&mut self, invid: Invid) {
        self.0
            .entry(invid)
            .or_insert_with(|| FieldSet::Fields(BTreeSet::new()));
    }

    fn merge_entry(&mut self, invid: Invid, fields: FieldSet) {
        match self.0.get_mut(&invid) {
            Some(existing) => existing.merge(fields),
            None => {
                self.0.insert(invid, fields);
            }
        }
    }

    pub fn merge(&mut self, other: FieldBook) {
        for (invid, fields) in other.0 {
            self.merge_entry(invid, fields);
        }
    }

    pub fn get(&self, invid: Invid) -> Option<&FieldSet> {
        self.0.get(&invid)
    }

    pub fn has(&self, invid: Invid, field: FieldId) -> bool {
        self.0.get(&invid).is_some_and(|f| f.contains(field))
    }

    pub fn objects(&self) -> impl Iterator<Item = Invid> + '_ {
        self.0.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Invid, &FieldSet)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One object of a transaction being committed, as seen by sync channels.
#[derive(Debug, Clone, Copy)]
pub struct CommittedObject<'a> {
    pub invid: Invid,
    pub status: ObjectStatus,
    pub original: Option<&'a FieldImage>,
    pub image: &'a FieldImage,
    /// Net field changes; `None` if the object did not change.
    pub delta: Option<&'a ObjectDelta>,
}

impl<'a> CommittedObject<'a> {
    /// Pair each checked-out object with its delta. Objects created and
    /// dropped in the same transaction are left out.
    pub fn collect(objects: &'a [EditedObject], deltas: &'a [ObjectDelta]) -> Vec<Self> {
        let by_invid: HashMap<Invid, &ObjectDelta> = deltas.iter().map(|d| (d.invid, d)).collect();
        objects
            .iter()
            .filter(|o| o.status != ObjectStatus::Dropping)
            .map(|o| CommittedObject {
                invid: o.invid,
                status: o.status,
                original: o.original.as_ref(),
                image: &o.fields,
                delta: by_invid.get(&o.invid).copied(),
            })
            .collect()
    }

    pub fn is_deleted(&self) -> bool {
        self.status == ObjectStatus::Deleting
    }
}

/// Channel-specific augmentation strategy.
pub trait SyncMaster: Send + Sync {
    /// Extra objects and fields to send along with `object`.
    fn augment(&self, object: &CommittedObject<'_>) -> FieldBook;
}

/// Adds nothing.
#[derive(Debug, Default)]
pub struct NoopSyncMaster;

impl SyncMaster for NoopSyncMaster {
    fn augment(&self, _object: &CommittedObject<'_>) -> FieldBook {
        FieldBook::new()
    }
}
