//! On-disk document for the error monitor.

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::MonitorError;
use super::types::{AlertConfig, AlertThresholdState, ErrorCategory, ErrorEvent};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct MonitorDocument {
    #[serde(default)]
    pub events: Vec<ErrorEvent>,
    #[serde(default)]
    pub thresholds: BTreeMap<ErrorCategory, AlertThresholdState>,
    #[serde(default)]
    pub alerts_sent: BTreeMap<ErrorCategory, u64>,
    #[serde(default)]
    pub config: AlertConfig,
}

impl MonitorDocument {
    pub fn write(&self, path: &Path) -> Result<(), MonitorError> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;
        let data = serde_json::to_vec_pretty(self)?;

        // Uniquely named sibling, renamed over the target once fully written.
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|err| err.error)?;
        Ok(())
    }

    /// Reads the document; `Ok(None)` when the file does not exist.
    pub fn read(path: &Path) -> Result<Option<Self>, MonitorError> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_slice(&data)?))
    }
}
