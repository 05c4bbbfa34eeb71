//! Per-channel cursor state and the type/field option filter.

use std::collections::HashMap;
use std::path::PathBuf;

use orrery_common::config::{FieldOption, SyncChannelConfig};
use orrery_common::error::SyncError;
use orrery_common::types::{FieldId, TxnNumber};
use orrery_txn::delta::ObjectDelta;

/// Durable bookkeeping of one sync channel.
///
/// `last_processed` only moves forward; an attempt to move it back is
/// refused and leaves the state untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncChannelState {
    pub channel_id: u32,
    pub name: String,
    pub output_directory: PathBuf,
    pub service_program: PathBuf,
    last_processed: TxnNumber,
}

impl SyncChannelState {
    pub fn new(channel_id: u32, config: &SyncChannelConfig, last_processed: TxnNumber) -> Self {
        Self {
            channel_id,
            name: config.name.clone(),
            output_directory: PathBuf::from(&config.directory),
            service_program: PathBuf::from(&config.service_program),
            last_processed,
        }
    }

    pub fn last_processed(&self) -> TxnNumber {
        self.last_processed
    }

    pub fn set_last_processed(&mut self, number: TxnNumber) -> Result<(), SyncError> {
        if number < self.last_processed {
            return Err(SyncError::CursorRegression {
                channel: self.name.clone(),
                current: self.last_processed,
                attempted: number,
            });
        }
        self.last_processed = number;
        Ok(())
    }

    /// Refresh name, directory and program. The cursor is kept.
    pub fn update_config(&mut self, config: &SyncChannelConfig) {
        self.name = config.name.clone();
        self.output_directory = PathBuf::from(&config.directory);
        self.service_program = PathBuf::from(&config.service_program);
    }
}

/// Which object types and fields a channel replicates.
///
/// A type row (`field_id = None`) other than `Never` admits the type; field
/// rows say when a field is sent. With an empty matrix every type is
/// admitted and every field is sent when it changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncFilter {
    types: HashMap<u16, FieldOption>,
    fields: HashMap<(u16, u16), FieldOption>,
}

impl SyncFilter {
    pub fn from_config(config: &SyncChannelConfig) -> Self {
        let mut filter = Self::default();
        for row in &config.field_options {
            match row.field_id {
                None => {
                    filter.types.insert(row.type_id, row.option);
                }
                Some(field) => {
                    filter.fields.insert((row.type_id, field), row.option);
                }
            }
        }
        filter
    }

    pub fn is_unrestricted(&self) -> bool {
        self.types.is_empty() && self.fields.is_empty()
    }

    pub fn includes_type(&self, type_id: u16) -> bool {
        if self.is_unrestricted() {
            return true;
        }
        matches!(
            self.types.get(&type_id),
            Some(FieldOption::Changed | FieldOption::Always)
        )
    }

    pub fn field_option(&self, type_id: u16, field: FieldId) -> FieldOption {
        if self.is_unrestricted() {
            return FieldOption::Changed;
        }
        if !self.includes_type(type_id) {
            return FieldOption::Never;
        }
        self.fields
            .get(&(type_id, field.0))
            .copied()
            .unwrap_or(FieldOption::Never)
    }

    pub fn should_sync_field(&self, type_id: u16, field: FieldId, changed: bool) -> bool {
        match self.field_option(type_id, field) {
            FieldOption::Never => false,
            FieldOption::Changed => changed,
            FieldOption::Always => true,
        }
    }

    /// True if the delta touches a field this channel cares about.
    pub fn object_relevant(&self, delta: &ObjectDelta) -> bool {
        let type_id = delta.invid.type_id;
        self.includes_type(type_id)
            && delta
                .changed_fields()
                .any(|f| self.field_option(type_id, f) != FieldOption::Never)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orrery_common::config::FieldOptionConfig;

    fn config_with(rows: Vec<(u16, Option<u16>, FieldOption)>) -> SyncChannelConfig {
        let mut config = SyncChannelConfig::new("ldap");
        config.directory = "/tmp/q".into();
        config.field_options = rows
            .into_iter()
            .map(|(type_id, field_id, option)| FieldOptionConfig {
                type_id,
                field_id,
                option,
            })
            .collect();
        config
    }

    #[test]
    fn test_cursor_is_monotonic() {
        let mut state = SyncChannelState::new(1, &config_with(vec![]), TxnNumber(10));
        state.set_last_processed(TxnNumber(10)).unwrap();
        state.set_last_processed(TxnNumber(12)).unwrap();
        let err = state.set_last_processed(TxnNumber(11)).unwrap_err();
        assert!(matches!(
            err,
            SyncError::CursorRegression {
                current: TxnNumber(12),
                attempted: TxnNumber(11),
                ..
            }
        ));
        assert_eq!(state.last_processed(), TxnNumber(12));
    }

    #[test]
    fn test_update_config_keeps_cursor() {
        let mut state = SyncChannelState::new(1, &config_with(vec![]), TxnNumber(7));
        let mut renamed = config_with(vec![]);
        renamed.name = "ldap2".into();
        renamed.service_program = "/usr/bin/true".into();
        state.update_config(&renamed);
        assert_eq!(state.name, "ldap2");
        assert_eq!(state.service_program, PathBuf::from("/usr/bin/true"));
        assert_eq!(state.last_processed(), TxnNumber(7));
    }

    #[test]
    fn test_empty_filter_sends_changed_fields() {
        let filter = SyncFilter::default();
        assert!(filter.includes_type(99));
        assert!(filter.should_sync_field(99, FieldId(1), true));
        assert!(!filter.should_sync_field(99, FieldId(1), false));
    }

    #[test]
    fn test_filter_matrix() {
        let filter = SyncFilter::from_config(&config_with(vec![
            (3, None, FieldOption::Changed),
            (3, Some(100), FieldOption::Always),
            (3, Some(101), FieldOption::Changed),
            (4, None, FieldOption::Never),
            (4, Some(100), FieldOption::Always),
        ]));
        assert!(filter.includes_type(3));
        assert!(!filter.includes_type(4));
        assert!(!filter.includes_type(5));
        assert!(filter.should_sync_field(3, FieldId(100), false));
        assert!(filter.should_sync_field(3, FieldId(101), true));
        assert!(!filter.should_sync_field(3, FieldId(101), false));
        assert!(!filter.should_sync_field(3, FieldId(102), true));
        // excluded type wins over its field rows
        assert!(!filter.should_sync_field(4, FieldId(100), true));
    }
}
