//! # Phase Gate
//!
//! The run's state machine. Phases advance strictly forward, one at a
//! time; the only permitted skip is Prompt Preparation on the
//! `InternalRepo` route. The first failure is terminal and no phase is
//! ever re-entered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FailureKind, PipelineError, PipelineResult};
use crate::models::{Phase, PipelineRun, Route, RunStatus};

/// How a phase ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseOutcome {
    Passed,
    Skipped,
    Failed,
}

/// Audit record for one phase the run reached
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub outcome: PhaseOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default)]
    pub failure_kind: Option<FailureKind>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Owns the [`PipelineRun`] and enforces phase ordering
#[derive(Debug)]
pub struct PhaseGate {
    run: PipelineRun,
    records: Vec<PhaseRecord>,
    phase_started: DateTime<Utc>,
}

fn violation(detail: String) -> PipelineError {
    PipelineError::internal(format!("phase gate violation: {}", detail))
}

impl PhaseGate {
    pub fn new(run: PipelineRun) -> Self {
        Self {
            run,
            records: Vec::new(),
            phase_started: Utc::now(),
        }
    }

    pub fn run(&self) -> &PipelineRun {
        &self.run
    }

    pub fn current(&self) -> Phase {
        self.run.current_phase
    }

    pub fn records(&self) -> &[PhaseRecord] {
        &self.records
    }

    pub fn is_terminal(&self) -> bool {
        self.run.status.is_terminal()
    }

    fn ensure_current(&self, phase: Phase) -> PipelineResult<()> {
        if self.is_terminal() {
            return Err(violation(format!(
                "run is {} and cannot act on {}",
                self.run.status.as_str(),
                phase
            )));
        }
        if phase != self.run.current_phase {
            return Err(violation(format!(
                "{} requested while the run is at {}",
                phase, self.run.current_phase
            )));
        }
        Ok(())
    }

    /// Mark the start of the current phase's work
    pub fn begin(&mut self, phase: Phase) -> PipelineResult<()> {
        self.ensure_current(phase)?;
        self.phase_started = Utc::now();
        Ok(())
    }

    /// Target name may only change while inputs are analysed
    pub fn set_target(&mut self, target_name: &str) -> PipelineResult<()> {
        self.ensure_current(Phase::InputAnalysis)?;
        self.run.target_name = target_name.to_string();
        Ok(())
    }

    /// Route may only be chosen during route selection
    pub fn set_route(&mut self, route: Route) -> PipelineResult<()> {
        self.ensure_current(Phase::RouteSelection)?;
        if route == Route::Unresolved {
            return Err(violation("route selection produced no route".to_string()));
        }
        self.run.route = route;
        Ok(())
    }

    fn record(&mut self, phase: Phase, outcome: PhaseOutcome, err: Option<&PipelineError>) {
        self.records.push(PhaseRecord {
            phase,
            outcome,
            started_at: self.phase_started,
            finished_at: Utc::now(),
            failure_kind: err.map(|e| e.kind()),
            reason: err.map(|e| e.to_string()),
        });
    }

    fn advance(&mut self) {
        match self.run.current_phase.next() {
            Some(next) => {
                self.run.current_phase = next;
                self.phase_started = Utc::now();
            }
            None => {
                self.run.status = RunStatus::Succeeded;
                self.run.ended_at = Some(Utc::now());
            }
        }
    }

    /// The current phase's exit predicate held; move to the next phase
    pub fn pass(&mut self, phase: Phase) -> PipelineResult<()> {
        self.ensure_current(phase)?;
        self.record(phase, PhaseOutcome::Passed, None);
        self.advance();
        Ok(())
    }

    /// Skip the current phase; only Prompt Preparation on InternalRepo
    pub fn skip(&mut self, phase: Phase) -> PipelineResult<()> {
        self.ensure_current(phase)?;
        if phase != Phase::PromptPrep || self.run.route != Route::InternalRepo {
            return Err(violation(format!(
                "{} is not skippable on route {}",
                phase, self.run.route
            )));
        }
        self.record(phase, PhaseOutcome::Skipped, None);
        self.advance();
        Ok(())
    }

    /// Halt the run at the current phase
    pub fn fail(&mut self, err: &PipelineError) {
        if self.is_terminal() {
            return;
        }
        let phase = self.run.current_phase;
        self.record(phase, PhaseOutcome::Failed, Some(err));
        self.run.status = match err {
            PipelineError::Aborted { .. } => RunStatus::Aborted,
            _ => RunStatus::Failed,
        };
        self.run.ended_at = Some(Utc::now());
    }

    /// Consume the gate, yielding the final run record
    pub fn into_run(self) -> PipelineRun {
        self.run
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate_on(route: Route) -> PhaseGate {
        let mut gate = PhaseGate::new(PipelineRun::new());
        gate.pass(Phase::InputAnalysis).unwrap();
        gate.set_route(route).unwrap();
        gate.pass(Phase::RouteSelection).unwrap();
        gate
    }

    #[test]
    fn test_full_forward_run_succeeds() {
        let mut gate = gate_on(Route::WebResearch);
        for phase in &Phase::ALL[2..] {
            gate.begin(*phase).unwrap();
            gate.pass(*phase).unwrap();
        }
        assert_eq!(gate.run().status, RunStatus::Succeeded);
        assert!(gate.run().ended_at.is_some());
        assert_eq!(gate.records().len(), 6);

        let numbers: Vec<u8> = gate.records().iter().map(|r| r.phase.number()).collect();
        assert!(numbers.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_phases_cannot_be_skipped_or_reentered() {
        let mut gate = PhaseGate::new(PipelineRun::new());
        assert!(gate.pass(Phase::RouteSelection).is_err());
        gate.pass(Phase::InputAnalysis).unwrap();
        assert!(gate.pass(Phase::InputAnalysis).is_err());
        assert!(gate.begin(Phase::InputAnalysis).is_err());
        assert_eq!(gate.current(), Phase::RouteSelection);
    }

    #[test]
    fn test_prompt_prep_skip_only_on_internal_repo() {
        let mut gate = gate_on(Route::InternalRepo);
        gate.skip(Phase::PromptPrep).unwrap();
        assert_eq!(gate.current(), Phase::Delegation);
        assert!(gate.skip(Phase::Delegation).is_err());

        for route in [Route::WebResearch, Route::Hybrid] {
            let mut gate = gate_on(route);
            assert!(gate.skip(Phase::PromptPrep).is_err());
            assert_eq!(gate.current(), Phase::PromptPrep);
        }
    }

    #[test]
    fn test_route_and_target_are_phase_bound() {
        let mut gate = PhaseGate::new(PipelineRun::new());
        assert!(gate.set_route(Route::Hybrid).is_err());
        gate.set_target("kubernetes-security").unwrap();
        gate.pass(Phase::InputAnalysis).unwrap();
        assert!(gate.set_target("other").is_err());
        assert!(gate.set_route(Route::Unresolved).is_err());
    }

    #[test]
    fn test_failure_is_terminal() {
        let mut gate = gate_on(Route::WebResearch);
        gate.pass(Phase::PromptPrep).unwrap();
        gate.fail(&PipelineError::WorkerTimedOut {
            worker: crate::workers::WorkerKind::WebResearch,
            timeout_secs: 2400,
        });

        assert_eq!(gate.run().status, RunStatus::Failed);
        assert_eq!(gate.run().current_phase, Phase::Delegation);
        let last = gate.records().last().unwrap();
        assert_eq!(last.outcome, PhaseOutcome::Failed);
        assert_eq!(last.failure_kind, Some(FailureKind::WorkerTimedOut));

        assert!(gate.pass(Phase::Delegation).is_err());
        assert!(gate.begin(Phase::Build).is_err());
    }

    #[test]
    fn test_abort_sets_aborted_status() {
        let mut gate = PhaseGate::new(PipelineRun::new());
        gate.fail(&PipelineError::Aborted {
            phase: Phase::InputAnalysis,
        });
        assert_eq!(gate.run().status, RunStatus::Aborted);
        assert_eq!(gate.records().len(), 1);
    }
}
