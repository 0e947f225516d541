//! Per-step observability hook.
//!
//! The host persists `WorkflowInstance` / `WorkflowStepHistory` rows around
//! each step; the engine only emits the events it needs for that -- step
//! started, step finished (status, outcome data, error, timestamps). The
//! default observer forwards the events to `tracing`.

use chrono::{DateTime, Utc};
use serde_json::Value;
use stepwise_types::definition::StepAction;
use uuid::Uuid;

/// Identifies one step execution within a run.
#[derive(Debug, Clone)]
pub struct StepEvent {
    pub run_id: Uuid,
    pub definition_id: String,
    pub step_id: String,
    pub action: StepAction,
    pub timestamp: DateTime<Utc>,
}

/// How a step execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// The step produced a terminal outcome.
    Completed,
    /// The step matched a condition that chains into another step.
    Chained,
    /// The step aborted the run.
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Completed => "completed",
            StepStatus::Chained => "chained",
            StepStatus::Failed => "failed",
        }
    }
}

/// Receives step lifecycle events from the runner.
pub trait RunObserver: Send + Sync {
    fn step_started(&self, event: &StepEvent);

    fn step_finished(
        &self,
        event: &StepEvent,
        status: StepStatus,
        data: Option<&Value>,
        error: Option<&str>,
    );
}

/// Default observer: structured tracing events, no persistence.
pub struct TracingObserver;

impl RunObserver for TracingObserver {
    fn step_started(&self, event: &StepEvent) {
        tracing::info!(
            run_id = %event.run_id,
            definition = %event.definition_id,
            step = %event.step_id,
            action = event.action.as_str(),
            "step started"
        );
    }

    fn step_finished(
        &self,
        event: &StepEvent,
        status: StepStatus,
        _data: Option<&Value>,
        error: Option<&str>,
    ) {
        match error {
            Some(error) => tracing::warn!(
                run_id = %event.run_id,
                definition = %event.definition_id,
                step = %event.step_id,
                status = status.as_str(),
                error,
                "step failed"
            ),
            None => tracing::info!(
                run_id = %event.run_id,
                definition = %event.definition_id,
                step = %event.step_id,
                status = status.as_str(),
                "step finished"
            ),
        }
    }
}
