//! Run artefacts written next to the checkpoint.
//!
//! - `config.json`: the run's arguments, once at startup
//! - `log.txt`: one JSON object per epoch, appended
//!
//! Both are written by the coordinator only.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use action_core::{Result, Role};

use crate::evaluator::ValidationStats;
use crate::trainer::EpochStats;

pub const CONFIG_FILE: &str = "config.json";
pub const LOG_FILE: &str = "log.txt";

/// Pretty-print `args` into `<dir>/config.json`.
pub fn write_config_json<T: Serialize>(role: Role, dir: &Path, args: &T) -> Result<()> {
    if !role.is_coordinator() {
        return Ok(());
    }
    fs::create_dir_all(dir)?;
    fs::write(dir.join(CONFIG_FILE), serde_json::to_string_pretty(args)?)?;
    Ok(())
}

/// One `log.txt` line: `train_<meter>`, `epoch`, then `test_<stat>` when
/// validation ran this epoch.
pub fn epoch_log_entry(epoch: usize, train: &EpochStats, test: Option<&ValidationStats>) -> Value {
    let mut entry = Map::new();
    for (name, value) in train {
        entry.insert(format!("train_{name}"), Value::from(*value));
    }
    entry.insert("epoch".into(), Value::from(epoch));
    if let Some(test) = test {
        entry.insert("test_loss".into(), Value::from(test.loss));
        entry.insert("test_acc1".into(), Value::from(test.acc1));
        entry.insert("test_samples".into(), Value::from(test.samples));
    }
    Value::Object(entry)
}

/// Append-only epoch log
#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(LOG_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, role: Role, entry: &Value) -> Result<()> {
        if !role.is_coordinator() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(entry)?)?;
        debug!("Appended epoch log to {:?}", self.path);
        Ok(())
    }
}
