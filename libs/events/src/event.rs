//! Progress event type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::EventError;

/// Well-known workflow steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStep {
    Starting,
    PullingImage,
    CreatingContainer,
    RestartingContainer,
    Activated,
    Provisioning,
    Running,
    TearingDown,
    Removed,
    Stopped,
    CleanupFailed,
    Error,
}

impl ProgressStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStep::Starting => "starting",
            ProgressStep::PullingImage => "pulling_image",
            ProgressStep::CreatingContainer => "creating_container",
            ProgressStep::RestartingContainer => "restarting_container",
            ProgressStep::Activated => "activated",
            ProgressStep::Provisioning => "provisioning",
            ProgressStep::Running => "running",
            ProgressStep::TearingDown => "tearing_down",
            ProgressStep::Removed => "removed",
            ProgressStep::Stopped => "stopped",
            ProgressStep::CleanupFailed => "cleanup_failed",
            ProgressStep::Error => "error",
        }
    }
}

impl std::fmt::Display for ProgressStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A human-readable status update about a node or session workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Node the workflow runs against, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,

    /// The node or session id the event is about.
    pub subject: String,

    pub step: String,

    pub message: String,

    pub at: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(subject: impl ToString, step: ProgressStep, message: impl Into<String>) -> Self {
        Self {
            node_id: None,
            subject: subject.to_string(),
            step: step.as_str().to_string(),
            message: message.into(),
            at: Utc::now(),
        }
    }

    /// Shorthand for an event whose subject is the node itself.
    pub fn for_node(node_id: impl ToString, step: ProgressStep, message: impl Into<String>) -> Self {
        let node_id = node_id.to_string();
        Self::new(&node_id, step, message).with_node(node_id)
    }

    pub fn with_node(mut self, node_id: impl ToString) -> Self {
        self.node_id = Some(node_id.to_string());
        self
    }

    pub fn is_error(&self) -> bool {
        self.step == ProgressStep::Error.as_str()
    }

    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_node_sets_subject_and_node() {
        let event = ProgressEvent::for_node("node_1", ProgressStep::Activated, "node is active");
        assert_eq!(event.subject, "node_1");
        assert_eq!(event.node_id.as_deref(), Some("node_1"));
        assert_eq!(event.step, "activated");
    }

    #[test]
    fn test_json_omits_missing_node() {
        let event = ProgressEvent::new("ses_1", ProgressStep::Error, "boom");
        let json: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert!(json.get("node_id").is_none());
        assert_eq!(json["step"], "error");
        assert_eq!(json["message"], "boom");
        assert!(event.is_error());
    }

    #[test]
    fn test_step_serde_matches_as_str() {
        for step in [
            ProgressStep::PullingImage,
            ProgressStep::RestartingContainer,
            ProgressStep::CleanupFailed,
        ] {
            let json = serde_json::to_string(&step).unwrap();
            assert_eq!(json, format!("\"{}\"", step.as_str()));
        }
    }
}
