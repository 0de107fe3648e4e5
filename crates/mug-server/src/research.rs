//! Research data export: per-scene match logs and per-game reconnection
//! telemetry, written under the configured data directory.
//!
//! Layout:
//! - `<data_dir>/match_logs/<scene_id>.jsonl`, one [`MatchRecord`] per line
//! - `<data_dir>/reconnection/<game_id>.json`, one [`TelemetryRecord`] each

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use mug_proto::messages::reconnect::{GameEndReason, ReconnectionData};
use mug_proto::{GameId, SubjectId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::game::GameSession;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("I/O error writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize record: {0}")]
    Json(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ExportError + '_ {
    move |source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// One formed group, as appended to the scene's match log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MatchRecord {
    pub timestamp_ms: u64,
    pub scene_id: String,
    pub game_id: GameId,
    pub players: Vec<SubjectId>,
    pub rtt_ms: Vec<Option<u32>>,
    pub matchmaker: String,
    /// 1 for the first match, higher for validation re-matches.
    pub validation_attempt: u32,
}

/// Append-only JSON lines log of matches.
#[derive(Debug, Clone)]
pub struct MatchLog {
    dir: PathBuf,
}

impl MatchLog {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join("match_logs"),
        }
    }

    pub fn path_for(&self, scene_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", sanitize(scene_id)))
    }

    pub fn append(&self, record: &MatchRecord) -> Result<(), ExportError> {
        fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;
        let path = self.path_for(&record.scene_id);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err(&path))?;
        let mut w = BufWriter::new(file);
        serde_json::to_writer(&mut w, record)?;
        writeln!(w).map_err(io_err(&path))?;
        w.flush().map_err(io_err(&path))?;
        Ok(())
    }
}

/// Final state of one game for reconnection analysis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TelemetryRecord {
    pub game_id: GameId,
    pub scene_id: String,
    pub players: Vec<SubjectId>,
    pub end_reason: Option<GameEndReason>,
    pub frame_number: u32,
    pub episodes_completed: u32,
    pub validation_attempts: u32,
    pub reconnection: ReconnectionData,
}

impl TelemetryRecord {
    pub fn from_session(session: &GameSession) -> Self {
        Self {
            game_id: session.game_id().clone(),
            scene_id: session.scene_id().to_string(),
            players: session
                .players()
                .iter()
                .map(|p| p.subject_id.clone())
                .collect(),
            end_reason: session.end_reason(),
            frame_number: session.frame_number(),
            episodes_completed: session.current_episode(),
            validation_attempts: session.validation_attempt(),
            reconnection: session.reconnection().data().clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelemetryWriter {
    dir: PathBuf,
}

impl TelemetryWriter {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join("reconnection"),
        }
    }

    pub fn path_for(&self, game_id: &GameId) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize(game_id.as_str())))
    }

    pub fn write(&self, record: &TelemetryRecord) -> Result<PathBuf, ExportError> {
        fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;
        let path = self.path_for(&record.game_id);
        let bytes = serde_json::to_vec_pretty(record)?;
        fs::write(&path, bytes).map_err(io_err(&path))?;
        Ok(path)
    }
}

/// Keep ids usable as file names.
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
