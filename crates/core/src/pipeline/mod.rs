//! # Pipeline Orchestration
//!
//! Runs a request through the six gated phases.
//!
//! ## Pipeline Flow
//!
//! ```text
//! Input Analysis → Route Selection → Prompt Preparation → Delegation → Build → Deploy
//! ```
//!
//! - `phase` - Forward-only state machine over the run
//! - `delegation` - Worker dispatch with per-invocation deadlines
//! - `deploy` - Validate, publish and record as one unit
//! - `report` - Completion report on every exit path
//! - `coordinator` - Ties the phases together

pub mod coordinator;
pub mod delegation;
pub mod deploy;
pub mod events;
pub mod phase;
pub mod report;

pub use coordinator::{Coordinator, DispositionAnswer, DispositionRequest, DispositionSender};
pub use delegation::{DelegationEngine, InvocationStatus, WorkerInvocation};
pub use deploy::{Deployed, Deployer};
pub use events::{PipelineEvent, PipelineEventKind};
pub use phase::{PhaseGate, PhaseOutcome, PhaseRecord};
pub use report::{CompletionReport, PhaseStatus};
