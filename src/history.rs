//! Persisted-transcript collaborator.
//!
//! A completed session becomes a [`TranscriptLog`] keyed by room and
//! start time. The store is a directory of JSON files under the platform
//! data dir; listings return [`TranscriptSummary`] rows with a preview
//! derived from the first user turn.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HistoryError;
use crate::session::{Message, Role, SessionReport};

// ── Log types ─────────────────────────────────────────────────────

/// Completed-session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptLog {
    pub room: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: u64,
    pub conversation: Vec<Message>,
}

impl TranscriptLog {
    pub fn from_report(report: &SessionReport) -> Self {
        let start_time = report.started_at.unwrap_or(report.ended_at);
        let duration_seconds = (report.ended_at - start_time).num_seconds().max(0) as u64;
        Self {
            room: report.room.clone(),
            start_time,
            end_time: report.ended_at,
            duration_seconds,
            conversation: report.messages.clone(),
        }
    }

    /// Stable id: sanitized room name plus start timestamp.
    pub fn id(&self) -> String {
        let slug: String = self
            .room
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        format!("{}-{}", slug, self.start_time.format("%Y%m%dT%H%M%S"))
    }
}

/// Listing row for a saved transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSummary {
    pub id: String,
    pub room_name: String,
    pub date: String,
    /// Formatted `m:ss`.
    pub duration: String,
    pub message_count: usize,
    pub preview: String,
}

impl TranscriptSummary {
    fn derive(id: String, log: &TranscriptLog) -> Self {
        Self {
            id,
            room_name: log.room.clone(),
            date: log.start_time.format("%Y-%m-%d").to_string(),
            duration: format_duration(log.duration_seconds),
            message_count: log.conversation.len(),
            preview: preview(&log.conversation),
        }
    }
}

/// `m:ss`, the same rendering the session countdown uses.
pub fn format_duration(seconds: u64) -> String {
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

fn preview(conversation: &[Message]) -> String {
    conversation
        .iter()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.chars().take(100).collect())
        .unwrap_or_else(|| "No messages".to_string())
}

// ── Store ─────────────────────────────────────────────────────────

/// Directory-backed transcript store.
pub struct TranscriptStore {
    dir: PathBuf,
}

impl TranscriptStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store under the platform data directory.
    pub fn open_default() -> Result<Self, HistoryError> {
        let dir = directories::ProjectDirs::from("", "", "parlor")
            .map(|dirs| dirs.data_dir().join("transcripts"))
            .ok_or_else(|| {
                HistoryError::Io(std::io::Error::other("no platform data directory"))
            })?;
        std::fs::create_dir_all(&dir)?;
        Ok(Self::new(dir))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist one completed session. Returns the written path.
    pub fn save(&self, log: &TranscriptLog) -> Result<PathBuf, HistoryError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{}.json", log.id()));
        let text = serde_json::to_string_pretty(log)?;
        std::fs::write(&path, text)?;
        tracing::info!(path = %path.display(), "transcript saved");
        Ok(path)
    }

    /// Summaries of every saved transcript, newest first.
    pub fn list(&self) -> Result<Vec<TranscriptSummary>, HistoryError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut logs = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let id = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            match std::fs::read_to_string(&path)
                .map_err(HistoryError::from)
                .and_then(|text| Ok(serde_json::from_str::<TranscriptLog>(&text)?))
            {
                Ok(log) => logs.push((id, log)),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable transcript");
                }
            }
        }
        logs.sort_by(|a, b| b.1.start_time.cmp(&a.1.start_time));
        Ok(logs
            .into_iter()
            .map(|(id, log)| TranscriptSummary::derive(id, &log))
            .collect())
    }

    /// Load one full transcript by id.
    pub fn load(&self, id: &str) -> Result<TranscriptLog, HistoryError> {
        let path = self.dir.join(format!("{id}.json"));
        if !path.exists() {
            return Err(HistoryError::NotFound(id.to_string()));
        }
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

// ── Tests ─────────────────────────────────────────────────────────
