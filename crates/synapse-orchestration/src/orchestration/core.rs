//! # Orchestrator Core
//!
//! The complex-task state machine: plan → staged execution → input mapping →
//! remote dispatch → retries → result collection.
//!
//! Every state transition happens on the command loop in [`Orchestrator::run`];
//! spawned local executors, retry timers, and the federation connector feed it
//! commands and events, so a task sees at most one transition at a time and
//! `step_results` writes are atomic with the step's `Completed` transition.
//! Peer-step timeout deadlines live in the connector's correlation table —
//! the envelope layer is their single owner — and arrive back here as
//! `RequestTimedOut` events.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use synapse_ham::HamStore;
use synapse_hsp::{HspConnector, HspEvent, PeerStatus, ServiceRegistry, TaskResultPayload};
use synapse_shared::config::{HspConfig, OrchestratorConfig};
use synapse_shared::models::{
    FailureKind, LocalStepKind, Stage, StepFailure, StepRuntime, StepSpec, StepStatus,
    StrategyPlan, TaskOutcome, TaskState, TaskStatus,
};
use synapse_shared::{SynapseError, SynapseResult};

use crate::chunker::{chunk_text, ChunkPolicy};
use crate::dispatcher::{ToolDispatcher, ToolResult};
use crate::input_resolver::{resolve_parameters, ResolveContext};

use super::commands::{OrchestratorCommand, TaskAccepted, TaskSubmission};
use super::learning::LearningAdapter;
use super::peer_service::PeerService;
use super::status::OrchestratorStatus;

/// Buffer size for the orchestrator command channel
const COMMAND_BUFFER_SIZE: usize = 256;

/// Upper bound on a peer step's retry backoff
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Awaitable handle returned by `submit_task`
#[derive(Debug)]
pub struct TaskHandle {
    pub task_id: String,
    outcome_rx: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    /// Wait for the task's terminal outcome
    pub async fn outcome(self) -> SynapseResult<TaskOutcome> {
        self.outcome_rx.await.map_err(|_| {
            SynapseError::Orchestration("orchestrator dropped the task before completion".into())
        })
    }
}

/// Cloneable front door to the orchestrator command loop
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    command_tx: mpsc::Sender<OrchestratorCommand>,
}

impl OrchestratorHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<SynapseResult<T>>) -> OrchestratorCommand,
    ) -> SynapseResult<T> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(build(tx))
            .await
            .map_err(|_| SynapseError::Orchestration("orchestrator is not running".into()))?;
        rx.await
            .map_err(|_| SynapseError::Orchestration("orchestrator dropped the request".into()))?
    }

    /// Submit a task for execution
    pub async fn submit_task(&self, submission: TaskSubmission) -> SynapseResult<TaskHandle> {
        let (task_id, outcome_rx): TaskAccepted = self
            .request(|resp| OrchestratorCommand::Submit { submission, resp })
            .await?;
        Ok(TaskHandle {
            task_id,
            outcome_rx,
        })
    }

    /// Stop accepting new tasks; in-flight tasks finish
    pub async fn enter_drain(&self) -> SynapseResult<()> {
        self.request(|resp| OrchestratorCommand::EnterDrain { resp })
            .await
    }

    /// Resume accepting tasks
    pub async fn exit_drain(&self) -> SynapseResult<()> {
        self.request(|resp| OrchestratorCommand::ExitDrain { resp })
            .await
    }

    /// Snapshot orchestrator-owned status fields
    pub async fn status(&self) -> SynapseResult<OrchestratorStatus> {
        self.request(|resp| OrchestratorCommand::GetStatus { resp })
            .await
    }

    /// Stop the command loop
    pub async fn shutdown(&self) -> SynapseResult<()> {
        self.request(|resp| OrchestratorCommand::Shutdown { resp })
            .await
    }
}

struct TaskEntry {
    state: TaskState,
    specs: HashMap<String, StepSpec>,
    outcome_tx: Option<oneshot::Sender<TaskOutcome>>,
}

/// The meta-task orchestrator
pub struct Orchestrator {
    ai_id: String,
    config: OrchestratorConfig,
    hsp_config: HspConfig,
    dispatcher: Arc<ToolDispatcher>,
    connector: Arc<HspConnector>,
    registry: Arc<ServiceRegistry>,
    learning: Option<LearningAdapter>,
    peer_service: Option<Arc<PeerService>>,
    ham: Option<Arc<HamStore>>,
    command_tx: mpsc::Sender<OrchestratorCommand>,
    command_rx: mpsc::Receiver<OrchestratorCommand>,
    hsp_events: mpsc::Receiver<HspEvent>,
    tasks: HashMap<String, TaskEntry>,
    /// Cumulative terminal counts for the admin surface
    terminal_counts: HashMap<TaskStatus, u64>,
    draining: bool,
    /// Bounds concurrently running local steps
    local_slots: Arc<tokio::sync::Semaphore>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("ai_id", &self.ai_id)
            .field("tasks_in_flight", &self.tasks.len())
            .field("draining", &self.draining)
            .finish()
    }
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ai_id: impl Into<String>,
        config: OrchestratorConfig,
        hsp_config: HspConfig,
        dispatcher: Arc<ToolDispatcher>,
        connector: Arc<HspConnector>,
        registry: Arc<ServiceRegistry>,
        hsp_events: mpsc::Receiver<HspEvent>,
        learning: Option<LearningAdapter>,
        peer_service: Option<Arc<PeerService>>,
        ham: Option<Arc<HamStore>>,
    ) -> (Self, OrchestratorHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let handle = OrchestratorHandle {
            command_tx: command_tx.clone(),
        };
        let local_slots = Arc::new(tokio::sync::Semaphore::new(
            config.max_parallel_local_steps.max(1),
        ));
        let orchestrator = Self {
            ai_id: ai_id.into(),
            config,
            hsp_config,
            dispatcher,
            connector,
            registry,
            learning,
            peer_service,
            ham,
            command_tx,
            command_rx,
            hsp_events,
            tasks: HashMap::new(),
            terminal_counts: HashMap::new(),
            draining: false,
            local_slots,
        };
        (orchestrator, handle)
    }

    /// Run the command loop until shutdown
    pub async fn run(mut self) {
        info!(ai_id = %self.ai_id, "Orchestrator command loop started");
        let mut hsp_open = true;
        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        Some(command) => {
                            if !self.handle_command(command).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                event = self.hsp_events.recv(), if hsp_open => {
                    match event {
                        Some(event) => self.handle_hsp_event(event).await,
                        None => hsp_open = false,
                    }
                }
            }
        }
        info!(ai_id = %self.ai_id, "Orchestrator command loop stopped");
    }

    /// Spawn the loop; the returned handle joins it
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn handle_command(&mut self, command: OrchestratorCommand) -> bool {
        match command {
            OrchestratorCommand::Submit { submission, resp } => {
                self.handle_submit(submission, resp).await;
            }
            OrchestratorCommand::LocalStepFinished {
                task_id,
                step_id,
                outcome,
            } => {
                self.handle_local_finished(&task_id, &step_id, outcome).await;
            }
            OrchestratorCommand::PeerResult {
                task_id,
                step_id,
                result,
            } => {
                self.handle_peer_result(&task_id, &step_id, result).await;
            }
            OrchestratorCommand::RetryDue { task_id, step_id } => {
                self.handle_retry_due(&task_id, &step_id).await;
            }
            OrchestratorCommand::TaskDeadline { task_id } => {
                self.handle_task_deadline(&task_id).await;
            }
            OrchestratorCommand::EnterDrain { resp } => {
                self.draining = true;
                info!("Orchestrator entering drain mode");
                let _ = resp.send(Ok(()));
            }
            OrchestratorCommand::ExitDrain { resp } => {
                self.draining = false;
                info!("Orchestrator exiting drain mode");
                let _ = resp.send(Ok(()));
            }
            OrchestratorCommand::GetStatus { resp } => {
                let _ = resp.send(Ok(self.status_snapshot()));
            }
            OrchestratorCommand::Shutdown { resp } => {
                let _ = resp.send(Ok(()));
                return false;
            }
        }
        true
    }

    async fn handle_hsp_event(&mut self, event: HspEvent) {
        match event {
            HspEvent::TaskResult {
                task_id,
                step_id,
                result,
            } => {
                self.handle_peer_result(&task_id, &step_id, result).await;
            }
            HspEvent::RequestTimedOut {
                task_id,
                step_id,
                correlation_id,
            } => {
                self.handle_step_timeout(&task_id, &step_id, correlation_id)
                    .await;
            }
            HspEvent::TaskRequest {
                request,
                correlation_id,
                sender_ai_id,
            } => match &self.peer_service {
                Some(service) => {
                    tokio::spawn(Arc::clone(service).handle_request(
                        request,
                        correlation_id,
                        sender_ai_id,
                    ));
                }
                None => {
                    warn!(
                        capability_id = %request.capability_id,
                        "Dropping peer task request: no peer service configured"
                    );
                }
            },
            HspEvent::Fact(fact) => {
                if let Some(ham) = &self.ham {
                    let ham = Arc::clone(ham);
                    tokio::spawn(async move {
                        let mut metadata = Map::new();
                        metadata.insert("subject".to_string(), Value::String(fact.subject));
                        metadata.insert("predicate".to_string(), Value::String(fact.predicate));
                        metadata.insert(
                            "source_ai_id".to_string(),
                            Value::String(fact.source_ai_id),
                        );
                        metadata
                            .insert("confidence".to_string(), serde_json::json!(fact.confidence));
                        let raw = match &fact.object {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        if let Err(e) = ham.store(&raw, "peer_fact", metadata).await {
                            warn!(error = %e, "Failed to store peer fact");
                        }
                    });
                }
            }
            HspEvent::DeliveryFailed { message_id, topic } => {
                warn!(message_id = %message_id, topic = %topic, "Envelope delivery failed");
            }
        }
    }

    // =========================================================================
    // Submission
    // =========================================================================

    async fn handle_submit(
        &mut self,
        submission: TaskSubmission,
        resp: oneshot::Sender<SynapseResult<TaskAccepted>>,
    ) {
        if self.draining {
            let _ = resp.send(Err(SynapseError::Draining));
            return;
        }

        let task_id = submission
            .task_id
            .clone()
            .unwrap_or_else(|| format!("task-{}", Uuid::new_v4()));
        if self.tasks.contains_key(&task_id) {
            let _ = resp.send(Err(SynapseError::Validation(format!(
                "task id '{task_id}' already in flight"
            ))));
            return;
        }

        let plan = submission
            .plan
            .clone()
            .unwrap_or_else(|| StrategyPlan::trivial_llm_plan(&self.config.default_model_id));

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let _ = resp.send(Ok((task_id.clone(), outcome_rx)));

        let mut specs = HashMap::new();
        let mut steps = HashMap::new();
        for stage in &plan.stages {
            for spec in stage.steps() {
                let retries = match spec {
                    StepSpec::Hsp(peer) => peer.max_retries,
                    StepSpec::Local(_) => 0,
                };
                steps.insert(spec.step_id().to_string(), StepRuntime::new(retries));
                specs.insert(spec.step_id().to_string(), (*spec).clone());
            }
        }

        let state = TaskState {
            task_id: task_id.clone(),
            description: submission.description.clone(),
            input: submission.input.clone(),
            plan: plan.clone(),
            step_results: HashMap::new(),
            steps,
            overall_status: TaskStatus::Planning,
            current_stage_index: 0,
            submitted_at: Utc::now(),
            deadline: submission
                .deadline
                .and_then(|d| chrono::Duration::from_std(d).ok())
                .map(|d| Utc::now() + d),
            learn: submission.learn,
        };

        self.tasks.insert(
            task_id.clone(),
            TaskEntry {
                state,
                specs,
                outcome_tx: Some(outcome_tx),
            },
        );

        info!(
            task_id = %task_id,
            plan_id = %plan.plan_id,
            stages = plan.stages.len(),
            "Task accepted"
        );

        if let Err(failure) = validate_plan(&plan) {
            warn!(task_id = %task_id, error = %failure.message, "Plan validation failed");
            self.fail_task(&task_id, failure).await;
            return;
        }

        if let Some(deadline) = submission.deadline {
            let tx = self.command_tx.clone();
            let deadline_task_id = task_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                let _ = tx
                    .send(OrchestratorCommand::TaskDeadline {
                        task_id: deadline_task_id,
                    })
                    .await;
            });
        }

        self.start_stage(&task_id).await;
    }

    // =========================================================================
    // Stage execution
    // =========================================================================

    /// Launch the current stage, advancing through any stages whose steps all
    /// reach a terminal status synchronously, and finishing the task when the
    /// stages run out.
    async fn start_stage(&mut self, task_id: &str) {
        loop {
            let stage_step_ids = {
                let Some(entry) = self.tasks.get_mut(task_id) else {
                    return;
                };
                if entry.state.overall_status.is_terminal() {
                    return;
                }
                if entry.state.current_stage_index >= entry.state.plan.stages.len() {
                    self.finish_task(task_id).await;
                    return;
                }
                entry.state.overall_status = TaskStatus::Executing;
                entry.state.current_stage_step_ids()
            };

            debug!(
                task_id = %task_id,
                stage = self.tasks[task_id].state.current_stage_index,
                steps = stage_step_ids.len(),
                "Starting stage"
            );

            for step_id in &stage_step_ids {
                self.launch_step(task_id, step_id).await;
                if !self.tasks.contains_key(task_id) {
                    // A plan error failed the task mid-stage
                    return;
                }
            }

            let Some(entry) = self.tasks.get_mut(task_id) else {
                return;
            };
            if entry.state.current_stage_joined() {
                entry.state.current_stage_index += 1;
                continue;
            }

            let any_waiting = entry.state.steps.values().any(|rt| {
                matches!(rt.status, StepStatus::WaitingResult | StepStatus::FailedRetry)
            });
            if any_waiting {
                entry.state.overall_status = TaskStatus::WaitingHsp;
            }
            return;
        }
    }

    async fn launch_step(&mut self, task_id: &str, step_id: &str) {
        let (spec, params) = {
            let Some(entry) = self.tasks.get_mut(task_id) else {
                return;
            };
            let Some(spec) = entry.specs.get(step_id).cloned() else {
                return;
            };

            let ctx = ResolveContext {
                original_input: &entry.state.input,
                task_description: &entry.state.description,
                step_results: &entry.state.step_results,
            };
            let (parameters, mapping) = match &spec {
                StepSpec::Local(s) => (&s.parameters, &s.input_mapping),
                StepSpec::Hsp(s) => (&s.parameters, &s.input_mapping),
            };
            match resolve_parameters(parameters, mapping, &ctx) {
                Ok(params) => (spec, params),
                Err(failure) => {
                    warn!(
                        task_id = %task_id,
                        step_id = %step_id,
                        error = %failure.message,
                        "Input resolution failed"
                    );
                    self.fail_task(task_id, failure).await;
                    return;
                }
            }
        };

        match spec {
            StepSpec::Local(local) => {
                if let Some(entry) = self.tasks.get_mut(task_id) {
                    if let Some(rt) = entry.state.steps.get_mut(step_id) {
                        rt.status = StepStatus::Running;
                    }
                }

                let dispatcher = Arc::clone(&self.dispatcher);
                let slots = Arc::clone(&self.local_slots);
                let tx = self.command_tx.clone();
                let task_id = task_id.to_string();
                let step_id = step_id.to_string();
                tokio::spawn(async move {
                    // Closed only at process teardown
                    let Ok(_permit) = slots.acquire_owned().await else {
                        return;
                    };
                    let outcome =
                        execute_local_step(dispatcher, local.kind, &local.target, params).await;
                    let _ = tx
                        .send(OrchestratorCommand::LocalStepFinished {
                            task_id,
                            step_id,
                            outcome,
                        })
                        .await;
                });
            }
            StepSpec::Hsp(peer) => {
                self.dispatch_peer_step(task_id, step_id, &peer.capability_id, peer.target_ai_id.as_deref(), params)
                    .await;
            }
        }
    }

    async fn dispatch_peer_step(
        &mut self,
        task_id: &str,
        step_id: &str,
        capability_id: &str,
        pinned_target: Option<&str>,
        params: Map<String, Value>,
    ) {
        let target = match pinned_target {
            Some(target) => Some(target.to_string()),
            None => self
                .registry
                .resolve_for_dispatch(capability_id)
                .map(|r| r.advertisement.ai_id),
        };

        let Some(target) = target else {
            warn!(
                task_id = %task_id,
                step_id = %step_id,
                capability_id = %capability_id,
                "No advertised capability matches"
            );
            self.step_terminal_failure(
                task_id,
                step_id,
                StepFailure::new(
                    FailureKind::CapabilityNotFound,
                    format!("no advertised capability matches '{capability_id}'"),
                ),
            )
            .await;
            return;
        };

        if let Some(entry) = self.tasks.get_mut(task_id) {
            if let Some(rt) = entry.state.steps.get_mut(step_id) {
                rt.status = StepStatus::Dispatched;
            }
        }

        let timeout = Duration::from_secs(self.hsp_config.default_timeout_s);
        match self
            .connector
            .dispatch_task_request(
                &target,
                capability_id,
                Value::Object(params),
                task_id,
                step_id,
                timeout,
            )
            .await
        {
            Ok(correlation_id) => {
                // The connector's correlation table owns the deadline; its
                // sweeper surfaces expiry as an event.
                if let Some(entry) = self.tasks.get_mut(task_id) {
                    if let Some(rt) = entry.state.steps.get_mut(step_id) {
                        rt.status = StepStatus::WaitingResult;
                        rt.correlation_id = Some(correlation_id);
                        rt.dispatched_at = Some(Utc::now());
                        rt.dispatch_count += 1;
                    }
                    entry.state.overall_status = TaskStatus::WaitingHsp;
                }
            }
            Err(e) => {
                self.step_retryable_failure(
                    task_id,
                    step_id,
                    StepFailure::new(FailureKind::Dispatch, e.to_string()),
                )
                .await;
            }
        }
    }

    // =========================================================================
    // Step completion paths
    // =========================================================================

    async fn handle_local_finished(
        &mut self,
        task_id: &str,
        step_id: &str,
        outcome: Result<Value, StepFailure>,
    ) {
        {
            let Some(entry) = self.tasks.get_mut(task_id) else {
                debug!(task_id = %task_id, step_id = %step_id, "Discarding result for finished task");
                return;
            };
            let Some(rt) = entry.state.steps.get_mut(step_id) else {
                return;
            };
            if rt.status != StepStatus::Running {
                return;
            }

            match outcome {
                Ok(value) => {
                    rt.result = Some(value.clone());
                    rt.status = StepStatus::Completed;
                    entry
                        .state
                        .step_results
                        .insert(step_id.to_string(), value);
                    debug!(task_id = %task_id, step_id = %step_id, "Local step completed");
                }
                Err(failure) => {
                    warn!(
                        task_id = %task_id,
                        step_id = %step_id,
                        kind = %failure.kind,
                        error = %failure.message,
                        "Local step failed"
                    );
                    rt.failure = Some(failure);
                    rt.status = StepStatus::FailedTerminal;
                }
            }
        }
        self.check_stage_join(task_id).await;
    }

    async fn handle_peer_result(
        &mut self,
        task_id: &str,
        step_id: &str,
        result: TaskResultPayload,
    ) {
        let retryable = {
            let Some(entry) = self.tasks.get_mut(task_id) else {
                debug!(task_id = %task_id, "Discarding peer result for finished task");
                return;
            };
            let Some(rt) = entry.state.steps.get_mut(step_id) else {
                return;
            };
            if rt.status != StepStatus::WaitingResult {
                debug!(
                    task_id = %task_id,
                    step_id = %step_id,
                    status = %rt.status,
                    "Discarding peer result for non-waiting step"
                );
                return;
            }

            match result.status {
                PeerStatus::Success => {
                    let value = result.payload.unwrap_or(Value::Null);
                    rt.result = Some(value.clone());
                    rt.status = StepStatus::Completed;
                    rt.correlation_id = None;
                    entry
                        .state
                        .step_results
                        .insert(step_id.to_string(), value);
                    debug!(task_id = %task_id, step_id = %step_id, "Peer step completed");
                    None
                }
                PeerStatus::Error => {
                    let details = result
                        .error_details
                        .map(|d| format!("{}: {}", d.kind, d.message))
                        .unwrap_or_else(|| "peer reported an unspecified error".to_string());
                    rt.correlation_id = None;
                    Some(StepFailure::new(FailureKind::Peer, details))
                }
            }
        };

        match retryable {
            Some(failure) => {
                self.step_retryable_failure(task_id, step_id, failure).await;
            }
            None => {
                self.check_stage_join(task_id).await;
            }
        }
    }

    /// The connector's sweeper found the step's correlation expired. The
    /// correlation is already removed, so any late result gets discarded at
    /// the envelope layer.
    async fn handle_step_timeout(
        &mut self,
        task_id: &str,
        step_id: &str,
        correlation_id: Uuid,
    ) {
        let timed_out = {
            let Some(entry) = self.tasks.get_mut(task_id) else {
                return;
            };
            let Some(rt) = entry.state.steps.get_mut(step_id) else {
                return;
            };
            if rt.status == StepStatus::WaitingResult
                && rt.correlation_id == Some(correlation_id)
            {
                rt.correlation_id = None;
                true
            } else {
                false
            }
        };

        if timed_out {
            warn!(
                task_id = %task_id,
                step_id = %step_id,
                correlation_id = %correlation_id,
                "Peer step timed out"
            );
            self.step_retryable_failure(
                task_id,
                step_id,
                StepFailure::new(
                    FailureKind::Timeout,
                    format!(
                        "no result within {}s",
                        self.hsp_config.default_timeout_s
                    ),
                ),
            )
            .await;
        }
    }

    async fn handle_retry_due(&mut self, task_id: &str, step_id: &str) {
        let peer_spec = {
            let Some(entry) = self.tasks.get_mut(task_id) else {
                return;
            };
            let Some(rt) = entry.state.steps.get(step_id) else {
                return;
            };
            if rt.status != StepStatus::FailedRetry {
                return;
            }
            match entry.specs.get(step_id) {
                Some(StepSpec::Hsp(peer)) => peer.clone(),
                _ => return,
            }
        };

        debug!(task_id = %task_id, step_id = %step_id, "Re-dispatching peer step");

        // Re-resolve inputs against the same antecedent results
        let params = {
            let Some(entry) = self.tasks.get(task_id) else {
                return;
            };
            let ctx = ResolveContext {
                original_input: &entry.state.input,
                task_description: &entry.state.description,
                step_results: &entry.state.step_results,
            };
            match resolve_parameters(&peer_spec.parameters, &peer_spec.input_mapping, &ctx) {
                Ok(params) => params,
                Err(failure) => {
                    self.fail_task(task_id, failure).await;
                    return;
                }
            }
        };

        if let Some(entry) = self.tasks.get_mut(task_id) {
            if let Some(rt) = entry.state.steps.get_mut(step_id) {
                rt.last_retry_at = Some(Utc::now());
            }
        }

        self.dispatch_peer_step(
            task_id,
            step_id,
            &peer_spec.capability_id,
            peer_spec.target_ai_id.as_deref(),
            params,
        )
        .await;
    }

    /// A peer step failed in a retryable way: burn a retry and schedule the
    /// re-dispatch with exponential backoff, or go terminal.
    async fn step_retryable_failure(
        &mut self,
        task_id: &str,
        step_id: &str,
        failure: StepFailure,
    ) {
        let schedule = {
            let Some(entry) = self.tasks.get_mut(task_id) else {
                return;
            };
            let Some(rt) = entry.state.steps.get_mut(step_id) else {
                return;
            };

            if rt.retries_left > 0 {
                rt.retries_left -= 1;
                rt.status = StepStatus::FailedRetry;
                rt.failure = Some(failure);

                let base = match entry.specs.get(step_id) {
                    Some(StepSpec::Hsp(peer)) => peer.retry_delay_seconds,
                    _ => self.hsp_config.retry_base_delay_s,
                };
                // base * 2^attempt, where attempt counts completed dispatches
                let attempt = rt.dispatch_count.saturating_sub(1).min(6);
                let delay =
                    Duration::from_secs(base.saturating_mul(1 << attempt)).min(MAX_RETRY_DELAY);
                Some(delay)
            } else {
                rt.status = StepStatus::FailedTerminal;
                rt.failure = Some(failure);
                None
            }
        };

        match schedule {
            Some(delay) => {
                debug!(
                    task_id = %task_id,
                    step_id = %step_id,
                    delay_ms = delay.as_millis() as u64,
                    "Peer step retry scheduled"
                );
                let tx = self.command_tx.clone();
                let retry_task_id = task_id.to_string();
                let retry_step_id = step_id.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx
                        .send(OrchestratorCommand::RetryDue {
                            task_id: retry_task_id,
                            step_id: retry_step_id,
                        })
                        .await;
                });
            }
            None => {
                warn!(task_id = %task_id, step_id = %step_id, "Peer step failed terminally");
                self.check_stage_join(task_id).await;
            }
        }
    }

    async fn step_terminal_failure(
        &mut self,
        task_id: &str,
        step_id: &str,
        failure: StepFailure,
    ) {
        if let Some(entry) = self.tasks.get_mut(task_id) {
            if let Some(rt) = entry.state.steps.get_mut(step_id) {
                rt.status = StepStatus::FailedTerminal;
                rt.failure = Some(failure);
            }
        }
        self.check_stage_join(task_id).await;
    }

    // =========================================================================
    // Join, completion, failure
    // =========================================================================

    async fn check_stage_join(&mut self, task_id: &str) {
        let advance = {
            let Some(entry) = self.tasks.get_mut(task_id) else {
                return;
            };
            if entry.state.overall_status.is_terminal() {
                return;
            }
            if entry.state.current_stage_joined() {
                entry.state.current_stage_index += 1;
                true
            } else {
                false
            }
        };

        if advance {
            Box::pin(self.start_stage(task_id)).await;
        }
    }

    async fn finish_task(&mut self, task_id: &str) {
        let result: Result<Value, StepFailure> = {
            let Some(entry) = self.tasks.get_mut(task_id) else {
                return;
            };
            entry.state.overall_status = TaskStatus::Merging;

            let step_outcome = |entry: &TaskEntry, step_id: &str| -> Result<Value, StepFailure> {
                let rt = entry.state.steps.get(step_id).ok_or_else(|| {
                    StepFailure::new(FailureKind::Plan, format!("unknown step '{step_id}'"))
                })?;
                match rt.status {
                    StepStatus::Completed => Ok(rt.result.clone().unwrap_or(Value::Null)),
                    _ => Err(rt.failure.clone().unwrap_or_else(|| {
                        StepFailure::new(FailureKind::Plan, "step never completed")
                    })),
                }
            };

            match entry.state.plan.stages.last() {
                None => Err(StepFailure::new(FailureKind::Plan, "plan has no stages")),
                Some(Stage::Single(step)) => step_outcome(entry, &step.step_id().to_string()),
                Some(Stage::Parallel(steps)) => {
                    match entry.state.plan.output_step_id.clone() {
                        Some(output_step_id) => step_outcome(entry, &output_step_id),
                        None => {
                            // Ordered map of the final steps' completed results
                            let mut map = Map::new();
                            let mut first_failure = None;
                            for step in steps {
                                match step_outcome(entry, step.step_id()) {
                                    Ok(value) => {
                                        map.insert(step.step_id().to_string(), value);
                                    }
                                    Err(failure) => {
                                        first_failure.get_or_insert(failure);
                                    }
                                }
                            }
                            if map.is_empty() {
                                Err(first_failure.unwrap_or_else(|| {
                                    StepFailure::new(FailureKind::Plan, "final stage is empty")
                                }))
                            } else {
                                Ok(Value::Object(map))
                            }
                        }
                    }
                }
            }
        };

        match result {
            Ok(value) => self.complete_task(task_id, value).await,
            Err(failure) => self.fail_task(task_id, failure).await,
        }
    }

    async fn complete_task(&mut self, task_id: &str, result: Value) {
        let Some(mut entry) = self.tasks.remove(task_id) else {
            return;
        };
        entry.state.overall_status = TaskStatus::Completed;
        *self
            .terminal_counts
            .entry(TaskStatus::Completed)
            .or_insert(0) += 1;

        info!(task_id = %task_id, "Task completed");

        if entry.state.learn {
            if let Some(learning) = &self.learning {
                let learning = learning.clone();
                let learn_task_id = task_id.to_string();
                let description = entry.state.description.clone();
                let learn_result = result.clone();
                tokio::spawn(async move {
                    learning
                        .record_outcome(&learn_task_id, &description, &learn_result)
                        .await;
                });
            }
        }

        if let Some(outcome_tx) = entry.outcome_tx.take() {
            let _ = outcome_tx.send(TaskOutcome {
                task_id: task_id.to_string(),
                status: TaskStatus::Completed,
                result: Some(result),
                failure: None,
            });
        }
    }

    async fn fail_task(&mut self, task_id: &str, failure: StepFailure) {
        let Some(mut entry) = self.tasks.remove(task_id) else {
            return;
        };
        entry.state.overall_status = TaskStatus::Failed;
        *self.terminal_counts.entry(TaskStatus::Failed).or_insert(0) += 1;

        // Abandon in-flight peer steps: their correlations are dropped and
        // late results will be discarded by the connector.
        for rt in entry.state.steps.values() {
            if let Some(correlation_id) = rt.correlation_id {
                self.connector.forget_correlation(&correlation_id);
            }
        }

        warn!(
            task_id = %task_id,
            kind = %failure.kind,
            error = %failure.message,
            "Task failed"
        );

        if let Some(outcome_tx) = entry.outcome_tx.take() {
            let _ = outcome_tx.send(TaskOutcome {
                task_id: task_id.to_string(),
                status: TaskStatus::Failed,
                result: None,
                failure: Some(failure),
            });
        }
    }

    async fn handle_task_deadline(&mut self, task_id: &str) {
        if self.tasks.contains_key(task_id) {
            info!(task_id = %task_id, "Task deadline expired");
            self.fail_task(
                task_id,
                StepFailure::new(FailureKind::Deadline, "task deadline exceeded"),
            )
            .await;
        }
    }

    fn status_snapshot(&self) -> OrchestratorStatus {
        let mut tasks_by_state: HashMap<TaskStatus, u64> = self.terminal_counts.clone();
        for entry in self.tasks.values() {
            *tasks_by_state.entry(entry.state.overall_status).or_insert(0) += 1;
        }
        let active_retries = self
            .tasks
            .values()
            .flat_map(|entry| entry.state.steps.values())
            .filter(|rt| rt.status == StepStatus::FailedRetry)
            .count();

        OrchestratorStatus {
            draining: self.draining,
            tasks_in_flight: self.tasks.len(),
            tasks_by_state,
            active_retries,
        }
    }
}

/// Execute one local step through the dispatcher
async fn execute_local_step(
    dispatcher: Arc<ToolDispatcher>,
    kind: LocalStepKind,
    target: &str,
    params: Map<String, Value>,
) -> Result<Value, StepFailure> {
    match kind {
        LocalStepKind::LocalTool => {
            fold_tool_result(dispatcher.invoke(target, Value::Object(params)).await)
        }
        LocalStepKind::LocalLlm => {
            let name = if target.starts_with("llm:") {
                target.to_string()
            } else {
                format!("llm:{target}")
            };
            fold_tool_result(dispatcher.invoke(&name, Value::Object(params)).await)
        }
        LocalStepKind::LocalChunkProcess => {
            let text = params
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    StepFailure::new(
                        FailureKind::Tool,
                        "local_chunk_process requires a 'text' parameter",
                    )
                })?
                .to_string();

            let policy = ChunkPolicy {
                max_chars: params
                    .get("chunk_size")
                    .and_then(Value::as_u64)
                    .map(|v| v as usize)
                    .unwrap_or(ChunkPolicy::default().max_chars),
                overlap_chars: params
                    .get("chunk_overlap")
                    .and_then(Value::as_u64)
                    .map(|v| v as usize)
                    .unwrap_or(ChunkPolicy::default().overlap_chars),
            };

            // The inner operation is the step target: a tool name or an
            // `llm:<model_id>` backend.
            let inner = target.to_string();

            let chunks = chunk_text(&text, &policy);
            let total = chunks.len();
            let mut outputs = Vec::with_capacity(total);
            for chunk in chunks {
                let mut chunk_params = Map::new();
                chunk_params.insert("text".to_string(), Value::String(chunk.text.clone()));
                if inner.starts_with("llm:") {
                    chunk_params.insert("prompt".to_string(), Value::String(chunk.text));
                }
                chunk_params.insert("ordinal".to_string(), serde_json::json!(chunk.ordinal));
                chunk_params.insert("chunk_count".to_string(), serde_json::json!(total));

                let value =
                    fold_tool_result(dispatcher.invoke(&inner, Value::Object(chunk_params)).await)?;
                outputs.push(value);
            }
            Ok(Value::Array(outputs))
        }
    }
}

fn fold_tool_result(result: ToolResult) -> Result<Value, StepFailure> {
    match result {
        ToolResult::Success { payload } => Ok(payload),
        ToolResult::Error { kind, message } => Err(StepFailure::new(
            FailureKind::Tool,
            format!("{kind}: {message}"),
        )),
    }
}

/// Structural plan validation: unique step ids, no forward or intra-stage
/// data dependencies (via `input_sources` or template references), and a
/// designated output step that actually lives in the final stage.
pub fn validate_plan(plan: &StrategyPlan) -> Result<(), StepFailure> {
    if plan.stages.is_empty() {
        return Err(StepFailure::new(FailureKind::Plan, "plan has no stages"));
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for stage in &plan.stages {
        if stage.is_empty() {
            return Err(StepFailure::new(
                FailureKind::Plan,
                "plan contains an empty parallel stage",
            ));
        }
        for step in stage.steps() {
            if !seen.insert(step.step_id()) {
                return Err(StepFailure::new(
                    FailureKind::Plan,
                    format!("duplicate step id '{}'", step.step_id()),
                ));
            }
        }
    }

    let mut earlier: HashSet<&str> = HashSet::new();
    for stage in &plan.stages {
        let stage_steps = stage.steps();
        for step in &stage_steps {
            for source in step.input_sources() {
                if !earlier.contains(source.as_str()) {
                    return Err(StepFailure::new(
                        FailureKind::Plan,
                        format!(
                            "step '{}' reads '{}' which is not in an earlier stage",
                            step.step_id(),
                            source
                        ),
                    ));
                }
            }
            for value in step.input_mapping().values() {
                if let Value::String(template) = value {
                    for referenced in template_step_refs(template) {
                        if !earlier.contains(referenced.as_str()) {
                            return Err(StepFailure::new(
                                FailureKind::Plan,
                                format!(
                                    "step '{}' references '{{$step.{}}}' which is not in an earlier stage",
                                    step.step_id(),
                                    referenced
                                ),
                            ));
                        }
                    }
                }
            }
        }
        for step in &stage_steps {
            earlier.insert(step.step_id());
        }
    }

    if let Some(output_step_id) = &plan.output_step_id {
        let in_last_stage = plan
            .stages
            .last()
            .map(|stage| stage.steps().iter().any(|s| s.step_id() == output_step_id))
            .unwrap_or(false);
        if !in_last_stage {
            return Err(StepFailure::new(
                FailureKind::Plan,
                format!("output step '{output_step_id}' is not in the final stage"),
            ));
        }
    }

    Ok(())
}

/// Step ids referenced by `{$step.<id>}` / `{$step.<id>.<key>}` placeholders
fn template_step_refs(template: &str) -> Vec<String> {
    let mut refs = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("{$step.") {
        let after = &rest[start + 7..];
        match after.find('}') {
            Some(end) => {
                let body = &after[..end];
                let step_id = body.split('.').next().unwrap_or(body);
                if !step_id.is_empty() {
                    refs.push(step_id.to_string());
                }
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    refs
}
