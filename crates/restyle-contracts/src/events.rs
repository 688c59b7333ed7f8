//! Developer-facing log of a pipeline session, one JSON object per line.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::state::PipelineStage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetRole {
    Subject,
    Style,
}

/// Everything the pipeline reports. The variant name becomes the line's `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    PipelineStarted {
        style_id: String,
        subject: String,
    },
    PipelineRejected {
        style_id: String,
    },
    StyleResolved {
        requested: String,
        style_id: String,
        tier: String,
        fell_back: bool,
        path: String,
    },
    StyleFallback {
        style_id: String,
        fallback: String,
        reason: String,
    },
    AssetUploaded {
        role: AssetRole,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        style_id: Option<String>,
        url: String,
    },
    GenerationAttempt {
        attempt: u32,
        max_attempts: u32,
        provider: String,
    },
    GenerationRetry {
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    ResultMaterialized {
        remote_output_url: String,
        path: String,
    },
    ReceiptFailed {
        path: String,
        error: String,
    },
    PipelineSucceeded {
        style_id: String,
        result: String,
        identity: bool,
    },
    PipelineFailed {
        style_id: String,
        stage: Option<PipelineStage>,
        kind: String,
        message: String,
    },
}

impl PipelineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::PipelineStarted { .. } => "pipeline_started",
            PipelineEvent::PipelineRejected { .. } => "pipeline_rejected",
            PipelineEvent::StyleResolved { .. } => "style_resolved",
            PipelineEvent::StyleFallback { .. } => "style_fallback",
            PipelineEvent::AssetUploaded { .. } => "asset_uploaded",
            PipelineEvent::GenerationAttempt { .. } => "generation_attempt",
            PipelineEvent::GenerationRetry { .. } => "generation_retry",
            PipelineEvent::ResultMaterialized { .. } => "result_materialized",
            PipelineEvent::ReceiptFailed { .. } => "receipt_failed",
            PipelineEvent::PipelineSucceeded { .. } => "pipeline_succeeded",
            PipelineEvent::PipelineFailed { .. } => "pipeline_failed",
        }
    }

    /// Terminal events close one `generate` call.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineEvent::PipelineSucceeded { .. }
                | PipelineEvent::PipelineFailed { .. }
                | PipelineEvent::PipelineRejected { .. }
        )
    }
}

/// A logged line: session, timestamp, then the event's own fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub session_id: String,
    pub ts: String,
    #[serde(flatten)]
    pub event: PipelineEvent,
}

#[derive(Serialize)]
struct Line<'a> {
    session_id: &'a str,
    ts: String,
    #[serde(flatten)]
    event: &'a PipelineEvent,
}

/// Appends [`PipelineEvent`]s to `events.jsonl`. Clones share one file lock.
#[derive(Debug, Clone)]
pub struct EventWriter {
    path: PathBuf,
    session_id: String,
    lock: Arc<Mutex<()>>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            session_id: session_id.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn record(&self, event: &PipelineEvent) -> anyhow::Result<()> {
        let line = serde_json::to_string(&Line {
            session_id: &self.session_id,
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false),
            event,
        })?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Every event in file order, across sessions. Foreign lines are skipped.
    pub fn read_events(&self) -> anyhow::Result<Vec<RecordedEvent>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            if let Ok(recorded) = serde_json::from_str::<RecordedEvent>(&line?) {
                events.push(recorded);
            }
        }
        Ok(events)
    }
}
