use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrreryConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Sync channels, one table per channel (`[[sync]]` in orrery.toml).
    #[serde(default)]
    pub sync: Vec<SyncChannelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Directory holding the journal, event logs and dumps.
    pub data_dir: String,
    /// Prometheus listen address (empty = metrics exporter disabled).
    #[serde(default)]
    pub metrics_listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: "./orrery_data".into(),
            metrics_listen_addr: String::new(),
        }
    }
}

/// How hard the journal pushes a finalized transaction to disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalSyncMode {
    /// Flush the userspace buffer only. Tests and throwaway data dirs.
    None,
    FSync,
    #[default]
    FDataSync,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Journal file name, relative to `server.data_dir` unless absolute.
    pub file: String,
    #[serde(default)]
    pub sync_mode: JournalSyncMode,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            file: "orrery.journal".into(),
            sync_mode: JournalSyncMode::default(),
        }
    }
}

/// Event log sinks. The first sink is the one history queries read from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub sinks: Vec<LogSinkConfig>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            sinks: vec![LogSinkConfig {
                path: "orrery.log".into(),
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSinkConfig {
    /// Log file path, relative to `server.data_dir` unless absolute.
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often a running sync program is polled for exit or cancellation.
    pub dispatch_poll_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dispatch_poll_interval_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncChannelMode {
    /// Never dispatched automatically.
    Manual,
    /// One queue file per committed transaction.
    #[default]
    Incremental,
    /// Full dump rebuilt when relevant data changed.
    #[serde(rename = "fullstate")]
    FullState,
}

/// Per-field replication option.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldOption {
    #[default]
    Never,
    /// Sent when the field itself changed.
    Changed,
    /// Sent whenever the object is sent.
    Always,
}

/// One row of a channel's type/field option matrix. `field_id = None`
/// applies to the object type as a whole.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldOptionConfig {
    pub type_id: u16,
    #[serde(default)]
    pub field_id: Option<u16>,
    pub option: FieldOption,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncChannelConfig {
    pub name: String,
    /// Queue directory for incremental channels.
    #[serde(default)]
    pub directory: String,
    /// External program run on dispatch.
    #[serde(default)]
    pub service_program: String,
    /// Dump target for full-state channels.
    #[serde(default)]
    pub full_state_file: String,
    #[serde(default)]
    pub mode: SyncChannelMode,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Empty matrix = every type and field is sent when changed.
    #[serde(default)]
    pub field_options: Vec<FieldOptionConfig>,
}

fn default_true() -> bool {
    true
}

impl SyncChannelConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            directory: String::new(),
            service_program: String::new(),
            full_state_file: String::new(),
            mode: SyncChannelMode::Incremental,
            active: true,
            field_options: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("sync channel name must not be empty".into());
        }
        match self.mode {
            SyncChannelMode::Incremental if self.directory.is_empty() => Err(format!(
                "sync channel '{}': incremental channels need a directory",
                self.name
            )),
            SyncChannelMode::FullState if self.full_state_file.is_empty() => Err(format!(
                "sync channel '{}': full-state channels need full_state_file",
                self.name
            )),
            _ => Ok(()),
        }
    }
}

impl OrreryConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.server.data_dir.is_empty() {
            return Err("server.data_dir must be set".into());
        }
        if self.journal.file.is_empty() {
            return Err("journal.file must be set".into());
        }
        if self.log.sinks.iter().any(|s| s.path.is_empty()) {
            return Err("log sink path must not be empty".into());
        }
        if self.scheduler.dispatch_poll_interval_ms == 0 {
            return Err("scheduler.dispatch_poll_interval_ms must be >= 1".into());
        }

        let mut names = HashSet::new();
        for channel in &self.sync {
            channel.validate()?;
            if !names.insert(channel.name.as_str()) {
                return Err(format!("duplicate sync channel name '{}'", channel.name));
            }
        }
        Ok(())
    }
}
