use chrono::{DateTime, TimeZone, Utc};
use orrery_common::error::StorageError;
use orrery_common::escape::{join_fields, split_fields};
use orrery_common::types::{now_millis, Invid, TxnNumber};
use serde::{Deserialize, Serialize};

pub const CLASS_START_TRANSACTION: &str = "starttransaction";
pub const CLASS_FINISH_TRANSACTION: &str = "finishtransaction";
pub const CLASS_COMMENT: &str = "comment";
pub const CLASS_EXTERNAL_ERROR: &str = "externalerror";
pub const CLASS_JOURNAL_RESET: &str = "journalreset";

/// Event classes produced by session login/logout.
pub const LOGIN_CLASSES: [&str; 3] = ["normallogin", "normallogout", "abnormallogout"];

const LINE_FIELDS: usize = 9;

/// One audit/history event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub time_ms: i64,
    pub transaction_id: Option<TxnNumber>,
    pub class_token: String,
    pub description: String,
    /// Mail subject; only set for events that are also mailed.
    pub subject: Option<String>,
    pub admin: Option<Invid>,
    pub admin_name: String,
    pub objects: Vec<Invid>,
    pub notify_targets: Vec<String>,
    /// Set once recipient expansion ran; never cleared.
    #[serde(skip)]
    pub augmented: bool,
}

/// Expands an event's recipient list, e.g. with the owners of the objects
/// the event concerns.
pub trait RecipientExpander: Send + Sync {
    fn expand(&self, event: &LogEvent) -> Vec<String>;
}

impl LogEvent {
    pub fn new(class_token: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            time_ms: now_millis(),
            transaction_id: None,
            class_token: class_token.into(),
            description: description.into(),
            subject: None,
            admin: None,
            admin_name: String::new(),
            objects: Vec::new(),
            notify_targets: Vec::new(),
            augmented: false,
        }
    }

    pub fn at(mut self, time_ms: i64) -> Self {
        self.time_ms = time_ms;
        self
    }

    pub fn by(mut self, admin: Option<Invid>, admin_name: impl Into<String>) -> Self {
        self.admin = admin;
        self.admin_name = admin_name.into();
        self
    }

    pub fn with_objects(mut self, objects: Vec<Invid>) -> Self {
        self.objects = objects;
        self
    }

    pub fn with_mail(mut self, subject: impl Into<String>, recipients: Vec<String>) -> Self {
        self.subject = Some(subject.into());
        self.notify_targets = recipients;
        self
    }

    pub fn in_transaction(mut self, txn: TxnNumber) -> Self {
        self.transaction_id = Some(txn);
        self
    }

    /// Recipients joined for message composition, order preserved.
    pub fn recipients(&self) -> String {
        self.notify_targets.join(",")
    }

    pub fn is_login_event(&self) -> bool {
        LOGIN_CLASSES.contains(&self.class_token.as_str())
    }

    pub fn concerns(&self, invid: Invid) -> bool {
        self.objects.contains(&invid)
    }

    /// Run recipient expansion at most once. Returns false if the event
    /// was already augmented.
    pub fn augment(&mut self, expander: &dyn RecipientExpander) -> bool {
        if self.augmented {
            return false;
        }
        for address in expander.expand(self) {
            if !self.notify_targets.contains(&address) {
                self.notify_targets.push(address);
            }
        }
        self.augmented = true;
        true
    }

    pub fn time(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.time_ms)
            .single()
            .unwrap_or_default()
    }

    /// Render as one log file line (no trailing newline).
    ///
    /// `time_ms|date|class|admin|admin name|txn|objects|description|recipients`
    pub fn to_line(&self) -> String {
        let objects: Vec<String> = self.objects.iter().map(|i| i.to_string()).collect();
        join_fields([
            self.time_ms.to_string(),
            self.time().format("%Y-%m-%d %H:%M:%S").to_string(),
            self.class_token.clone(),
            self.admin.map(|a| a.to_string()).unwrap_or_default(),
            self.admin_name.clone(),
            self.transaction_id
                .map(|t| t.to_string())
                .unwrap_or_default(),
            objects.join(","),
            self.description.clone(),
            self.recipients(),
        ])
    }

    pub fn parse(line: &str) -> Result<Self, StorageError> {
        let fields = split_fields(line);
        if fields.len() != LINE_FIELDS {
            return Err(StorageError::MalformedEvent(format!(
                "expected {} fields, got {}",
                LINE_FIELDS,
                fields.len()
            )));
        }
        let malformed = |what: &str, e: String| StorageError::MalformedEvent(format!("{}: {}", what, e));

        let time_ms = fields[0]
            .parse::<i64>()
            .map_err(|e| malformed("time", e.to_string()))?;
        let admin = match fields[3].as_str() {
            "" => None,
            s => Some(s.parse::<Invid>().map_err(|e| malformed("admin", e))?),
        };
        let transaction_id = match fields[5].as_str() {
            "" => None,
            s => Some(TxnNumber(
                s.parse::<u64>()
                    .map_err(|e| malformed("transaction", e.to_string()))?,
            )),
        };
        let objects = fields[6]
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<Invid>().map_err(|e| malformed("objects", e)))
            .collect::<Result<Vec<_>, _>>()?;
        let notify_targets = fields[8]
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            time_ms,
            transaction_id,
            class_token: fields[2].clone(),
            description: fields[7].clone(),
            subject: None,
            admin,
            admin_name: fields[4].clone(),
            objects,
            notify_targets,
            augmented: true,
        })
    }
}
