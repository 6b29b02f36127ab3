//! # Pipeline Events
//!
//! Typed progress events emitted by the coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Phase;

/// Kind of pipeline event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineEventKind {
    RunStarted,
    PhaseStarted,
    PhasePassed,
    PhaseSkipped,
    PhaseFailed,
    WorkerDispatched,
    WorkerFinished,
    // === Disposition events ===
    /// Coordinator is blocked until the caller answers
    DispositionRequired,
    DispositionResolved,
    // === Scoped resources ===
    WorkspaceAcquired,
    WorkspaceReleased,
    ResourceDeployed,
    RunCompleted,
    RunFailed,
}

/// An event in a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: PipelineEventKind,
    /// Phase the event belongs to, if any
    #[serde(default)]
    pub phase: Option<Phase>,
    /// Associated data (JSON)
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl PipelineEvent {
    pub fn new(kind: PipelineEventKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            phase: None,
            data: None,
        }
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    /// Add data to the event
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let event = PipelineEvent::new(PipelineEventKind::PhasePassed)
            .with_phase(Phase::Build)
            .with_data(serde_json::json!({ "target": "kubernetes-security" }));

        assert_eq!(event.phase, Some(Phase::Build));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "phase_passed");
        assert_eq!(json["data"]["target"], "kubernetes-security");
    }
}
