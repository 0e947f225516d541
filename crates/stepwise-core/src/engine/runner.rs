//! Workflow runner: the engine's entry point.
//!
//! `run_step` loads a definition, resolves the starting step (an explicit id
//! for resumed runs, the first step otherwise), and drives the executor as
//! an iterative trampoline: a matched condition's `next` feeds the loop
//! instead of recursing, and a bounded depth counter rejects cyclic
//! definitions deterministically.
//!
//! Each run owns a `CancellationToken`, kept in a map keyed by run id so a
//! host can abort a long `poll_db` wait mid-flight.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use stepwise_types::definition::WorkflowDefinition;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::context::ContextStore;
use crate::engine::definition::DefinitionError;
use crate::engine::evaluator::{ExpressionEvaluator, RouteResolver, StaticRoutes};
use crate::engine::executor::{EngineError, StepExecutor, StepOutcome, StepProgress};
use crate::engine::plugin::{BodyPlugin, PluginRegistry};
use crate::gateway::PersistenceGateway;
use crate::http::HttpDispatcher;
use crate::observer::{RunObserver, StepEvent, StepStatus, TracingObserver};
use crate::render::RenderRegistry;
use crate::store::DefinitionStore;

type JsonMap = serde_json::Map<String, Value>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of `next` transitions one run may follow.
    pub max_chain_depth: u32,
    /// Poll cadence for `poll_db` steps without `interval_seconds`.
    pub default_poll_interval_secs: u64,
    /// Poll deadline for `poll_db` steps without `timeout_seconds`.
    pub default_poll_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_chain_depth: 25,
            default_poll_interval_secs: 5,
            default_poll_timeout_secs: 60,
        }
    }
}

/// Optional collaborators for [`WorkflowRunner::with_options`]. The defaults
/// give an empty route table, the `"ui"` render backend, and tracing-only
/// observability.
pub struct RunnerOptions {
    pub routes: Arc<dyn RouteResolver>,
    pub renders: Arc<RenderRegistry>,
    pub observer: Arc<dyn RunObserver>,
    pub config: EngineConfig,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            routes: Arc::new(StaticRoutes::new()),
            renders: Arc::new(RenderRegistry::with_builtins()),
            observer: Arc::new(TracingObserver),
            config: EngineConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// RunOutcome
// ---------------------------------------------------------------------------

/// Result of one `run_step` invocation.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub definition_id: String,
    /// The terminal step of the chain.
    pub last_step: String,
    pub outcome: StepOutcome,
    /// Final context snapshot, for the caller to persist or carry into a
    /// later resume.
    pub context: JsonMap,
}

// ---------------------------------------------------------------------------
// WorkflowRunner
// ---------------------------------------------------------------------------

/// Drives workflow runs over the collaborator traits.
pub struct WorkflowRunner {
    store: Arc<dyn DefinitionStore>,
    executor: StepExecutor,
    plugins: Arc<PluginRegistry>,
    observer: Arc<dyn RunObserver>,
    config: EngineConfig,
    /// Cancellation tokens for in-flight runs, keyed by run id.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
}

impl WorkflowRunner {
    pub fn new(
        store: Arc<dyn DefinitionStore>,
        gateway: Arc<dyn PersistenceGateway>,
        http: Arc<dyn HttpDispatcher>,
    ) -> Self {
        Self::with_options(store, gateway, http, RunnerOptions::default())
    }

    pub fn with_options(
        store: Arc<dyn DefinitionStore>,
        gateway: Arc<dyn PersistenceGateway>,
        http: Arc<dyn HttpDispatcher>,
        options: RunnerOptions,
    ) -> Self {
        let evaluator = Arc::new(ExpressionEvaluator::with_routes(options.routes));
        let plugins = Arc::new(PluginRegistry::with_builtins(evaluator.clone()));
        let executor = StepExecutor::new(
            evaluator,
            plugins.clone(),
            options.renders,
            gateway,
            http,
            &options.config,
        );
        Self {
            store,
            executor,
            plugins,
            observer: options.observer,
            config: options.config,
            cancellation_tokens: DashMap::new(),
        }
    }

    /// Register a custom request body plugin alongside the built-ins.
    pub fn register_plugin(&self, plugin: Arc<dyn BodyPlugin>) {
        self.plugins.register(plugin);
    }

    /// Cancel an in-flight run. Returns `false` when the run id is unknown
    /// or the run already finished.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.cancellation_tokens.get(&run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Execute a workflow from `step_id` (or its first step), threading
    /// `seed` as the initial context. Chains until a terminal step.
    pub async fn run_step(
        &self,
        definition_id: &str,
        step_id: Option<&str>,
        seed: JsonMap,
    ) -> Result<RunOutcome, EngineError> {
        let definition = self.store.load(definition_id).await?;
        let run_id = Uuid::now_v7();
        let token = CancellationToken::new();
        self.cancellation_tokens.insert(run_id, token.clone());

        tracing::info!(
            run_id = %run_id,
            definition = %definition.id,
            start = step_id.unwrap_or("<first>"),
            "workflow run started"
        );
        let result = self.drive(&definition, run_id, step_id, seed, &token).await;
        self.cancellation_tokens.remove(&run_id);

        match &result {
            Ok(outcome) => tracing::info!(
                run_id = %run_id,
                definition = %definition.id,
                last_step = %outcome.last_step,
                "workflow run finished"
            ),
            Err(err) => tracing::warn!(
                run_id = %run_id,
                definition = %definition.id,
                error = %err,
                "workflow run aborted"
            ),
        }
        result
    }

    /// The trampoline: execute, then either stop or follow `next`.
    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        run_id: Uuid,
        step_id: Option<&str>,
        seed: JsonMap,
        token: &CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let mut ctx = ContextStore::seeded(seed);
        let mut current = match step_id {
            Some(id) => id.to_string(),
            None => definition
                .first_step()
                .map(|step| step.id.clone())
                .ok_or_else(|| {
                    EngineError::Definition(DefinitionError::Validation(
                        "workflow has no steps".to_string(),
                    ))
                })?,
        };
        let mut depth = 0u32;

        loop {
            let step = definition
                .step(&current)
                .ok_or_else(|| EngineError::UnknownStep(current.clone()))?;
            let event = StepEvent {
                run_id,
                definition_id: definition.id.clone(),
                step_id: step.id.clone(),
                action: step.action,
                timestamp: Utc::now(),
            };
            self.observer.step_started(&event);

            match self.executor.execute(step, &mut ctx, token).await {
                Ok(StepProgress::Done(outcome)) => {
                    self.observer.step_finished(
                        &event,
                        StepStatus::Completed,
                        Some(&outcome.to_value()),
                        None,
                    );
                    return Ok(RunOutcome {
                        run_id,
                        definition_id: definition.id.clone(),
                        last_step: current,
                        outcome,
                        context: ctx.snapshot().clone(),
                    });
                }
                Ok(StepProgress::Continue { next, seed }) => {
                    self.observer
                        .step_finished(&event, StepStatus::Chained, Some(&seed), None);
                    depth += 1;
                    if depth > self.config.max_chain_depth {
                        return Err(EngineError::ChainDepthExceeded {
                            depth,
                            max: self.config.max_chain_depth,
                        });
                    }
                    ctx.absorb_seed(seed);
                    current = next;
                }
                Err(err) => {
                    self.observer.step_finished(
                        &event,
                        StepStatus::Failed,
                        None,
                        Some(&err.to_string()),
                    );
                    return Err(err);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
