//! Tabular dump output: `|`-delimited rows using the shared field escaping.

use std::fs;
use std::io::Write;
use std::path::Path;

use orrery_common::error::StorageError;
use orrery_common::escape::join_fields;

/// Builds a dump one row at a time.
///
/// A row whose encoded value comes back empty is abandoned with a warning
/// and the sweep continues with the next row.
#[derive(Debug, Default)]
pub struct DumpWriter {
    out: String,
    rows_written: usize,
    rows_abandoned: usize,
}

impl DumpWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the dump with a header row.
    pub fn with_header<S: AsRef<str>>(columns: &[S]) -> Self {
        let mut writer = Self::new();
        writer.out.push_str(&join_fields(columns.iter().map(|c| c.as_ref())));
        writer.out.push('\n');
        writer
    }

    /// Append a row keyed by `key`. Returns false if the row was abandoned.
    pub fn write_row<S: AsRef<str>>(&mut self, key: &str, values: &[S]) -> bool {
        if let Some(pos) = values.iter().position(|v| v.as_ref().is_empty()) {
            tracing::warn!(
                "dump row {}: column {} encoded to an empty value, skipping row",
                key,
                pos + 1
            );
            self.rows_abandoned += 1;
            return false;
        }
        let line = join_fields(std::iter::once(key).chain(values.iter().map(|v| v.as_ref())));
        self.out.push_str(&line);
        self.out.push('\n');
        self.rows_written += 1;
        true
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    pub fn rows_abandoned(&self) -> usize {
        self.rows_abandoned
    }

    pub fn as_str(&self) -> &str {
        &self.out
    }

    /// Write the dump to `path` via a temp file and rename.
    pub fn write_to(&self, path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(self.out.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
