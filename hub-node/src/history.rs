//! Per-room JSON chat log.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use hub_core::config::HISTORY_REPLAY_LIMIT;
use hub_core::{ChatRecord, HistoryStore};
use tracing::{debug, warn};

/// Keeps the last `HISTORY_REPLAY_LIMIT` records of the hosted room in
/// `<dir>/chat_log_<code>.json`, rewritten on every append.
pub struct JsonHistory {
    dir: PathBuf,
    file: Option<PathBuf>,
    records: VecDeque<ChatRecord>,
}

impl JsonHistory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            file: None,
            records: VecDeque::new(),
        }
    }

    pub fn log_path(&self, room_code: &str) -> PathBuf {
        self.dir.join(format!("chat_log_{room_code}.json"))
    }

    fn save(&self) -> Result<()> {
        let Some(path) = &self.file else {
            return Ok(());
        };
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let json = serde_json::to_string_pretty(&self.records).context("serializing chat log")?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

fn read_log(path: &Path) -> Result<VecDeque<ChatRecord>> {
    let text = std::fs::read_to_string(path)?;
    let mut records: VecDeque<ChatRecord> =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    while records.len() > HISTORY_REPLAY_LIMIT {
        records.pop_front();
    }
    Ok(records)
}

impl HistoryStore for JsonHistory {
    fn open_room(&mut self, room_code: &str) {
        let path = self.log_path(room_code);
        self.records = if path.exists() {
            read_log(&path).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "ignoring unreadable chat log");
                VecDeque::new()
            })
        } else {
            VecDeque::new()
        };
        debug!(path = %path.display(), records = self.records.len(), "chat log opened");
        self.file = Some(path);
    }

    fn append(&mut self, record: ChatRecord) {
        self.records.push_back(record);
        while self.records.len() > HISTORY_REPLAY_LIMIT {
            self.records.pop_front();
        }
        if let Err(e) = self.save() {
            warn!(error = %e, "chat log not saved");
        }
    }

    fn replay(&self) -> Vec<ChatRecord> {
        self.records.iter().cloned().collect()
    }
}
