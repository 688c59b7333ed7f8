use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Pipeline step an error or state belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    ResolveStyle,
    UploadSubject,
    UploadStyle,
    Generate,
    Download,
}

impl PipelineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStage::ResolveStyle => "resolve_style",
            PipelineStage::UploadSubject => "upload_subject",
            PipelineStage::UploadStyle => "upload_style",
            PipelineStage::Generate => "generate",
            PipelineStage::Download => "download",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable progress of one `generate` invocation.
///
/// While the subject upload and the style branch run side by side, the state
/// reports the most recently started step.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineState {
    #[default]
    Idle,
    ResolvingStyle,
    UploadingSubject,
    UploadingStyle,
    Generating {
        attempt: u32,
        max_attempts: u32,
    },
    Downloading,
    Succeeded {
        result: PathBuf,
    },
    Failed {
        stage: Option<PipelineStage>,
        reason: String,
    },
}

impl PipelineState {
    /// True while an invocation owns the pipeline.
    pub fn is_active(&self) -> bool {
        !matches!(
            self,
            PipelineState::Idle | PipelineState::Succeeded { .. } | PipelineState::Failed { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::ResolvingStyle => "resolving_style",
            PipelineState::UploadingSubject => "uploading_subject",
            PipelineState::UploadingStyle => "uploading_style",
            PipelineState::Generating { .. } => "generating",
            PipelineState::Downloading => "downloading",
            PipelineState::Succeeded { .. } => "succeeded",
            PipelineState::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Generating {
                attempt,
                max_attempts,
            } => write!(f, "generating (attempt {attempt}/{max_attempts})"),
            PipelineState::Succeeded { result } => write!(f, "succeeded: {}", result.display()),
            PipelineState::Failed {
                stage: Some(stage),
                reason,
            } => write!(f, "failed at {stage}: {reason}"),
            PipelineState::Failed {
                stage: None,
                reason,
            } => write!(f, "failed: {reason}"),
            other => f.write_str(other.label()),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn terminal_and_idle_states_are_not_active() {
        assert!(!PipelineState::Idle.is_active());
        assert!(!PipelineState::Succeeded {
            result: PathBuf::from("/tmp/out.jpg")
        }
        .is_active());
        assert!(!PipelineState::Failed {
            stage: None,
            reason: "x".to_string()
        }
        .is_active());
        assert!(PipelineState::ResolvingStyle.is_active());
        assert!(PipelineState::Generating {
            attempt: 1,
            max_attempts: 3
        }
        .is_active());
    }

    #[test]
    fn state_serializes_with_tag() -> anyhow::Result<()> {
        let value = serde_json::to_value(PipelineState::Generating {
            attempt: 2,
            max_attempts: 3,
        })?;
        assert_eq!(
            value,
            json!({"state": "generating", "attempt": 2, "max_attempts": 3})
        );
        Ok(())
    }

    #[test]
    fn display_includes_stage_for_failures() {
        let state = PipelineState::Failed {
            stage: Some(PipelineStage::UploadStyle),
            reason: "status 500".to_string(),
        };
        assert_eq!(state.to_string(), "failed at upload_style: status 500");
    }
}
