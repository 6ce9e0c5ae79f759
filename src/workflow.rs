use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::actions::{ActionExecutor, ActionOptions, ActionResult};
use crate::driver::{LoadState, PageDriver};
use crate::error::{Error, ErrorKind, Result};
use crate::resolver::ElementDescription;
use crate::retry::RetryPolicy;
use crate::waiter::{AdaptiveWaiter, WaitCondition};

const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);
const PRECONDITION_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_PARALLEL: usize = 4;

/// What a step does when it runs.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepAction {
    Navigate { url: String },
    Click { target: ElementDescription },
    Type { target: ElementDescription, text: String },
    Press { target: ElementDescription, key: String },
    Scroll { dx: f64, dy: f64 },
    Wait { condition: WaitCondition },
    Extract { target: ElementDescription },
    Screenshot,
    Custom {
        name: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
}

impl StepAction {
    fn target_mut(&mut self) -> Option<&mut ElementDescription> {
        match self {
            StepAction::Click { target }
            | StepAction::Type { target, .. }
            | StepAction::Press { target, .. }
            | StepAction::Extract { target } => Some(target),
            _ => None,
        }
    }
}

/// What to do when a step ultimately fails, retries and healing included.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Stop the run; remaining steps are not executed.
    #[default]
    Abort,
    /// Record the failure and keep going. Dependents still run.
    Skip,
    /// Re-run the step once more with a fresh element resolution.
    Retry,
    /// Run a substitute action in the step's place.
    Fallback { action: Box<StepAction> },
}

/// Recovery applied when a step error matches the trigger.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "heal", rename_all = "snake_case")]
pub enum HealingAction {
    /// Reload the page and retry.
    RefreshPage,
    /// Double the step timeout and retry.
    WaitLonger,
    /// Drop cached selector rankings and retry.
    ClearResolutionCache,
    /// Clear caches and retry against an alternative target, when one is
    /// given.
    TryAlternative {
        #[serde(default)]
        target: Option<ElementDescription>,
    },
}

impl HealingAction {
    fn label(&self) -> &'static str {
        match self {
            HealingAction::RefreshPage => "refresh_page",
            HealingAction::WaitLonger => "wait_longer",
            HealingAction::ClearResolutionCache => "clear_resolution_cache",
            HealingAction::TryAlternative { .. } => "try_alternative",
        }
    }
}

/// One configured recovery. Strategies are tried in configuration order;
/// the first whose trigger matches the error is applied first.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HealingStrategy {
    /// Case-insensitive substring matched against the error message. An
    /// empty trigger matches every error.
    pub trigger: String,
    /// Optional classification match, checked in addition to the substring.
    #[serde(default)]
    pub trigger_kind: Option<ErrorKind>,
    pub action: HealingAction,
}

impl HealingStrategy {
    pub fn new(trigger: impl Into<String>, action: HealingAction) -> Self {
        Self {
            trigger: trigger.into(),
            trigger_kind: None,
            action,
        }
    }

    pub fn on_kind(kind: ErrorKind, action: HealingAction) -> Self {
        Self {
            trigger: String::new(),
            trigger_kind: Some(kind),
            action,
        }
    }

    fn matches(&self, error: &Error) -> bool {
        if let Some(kind) = self.trigger_kind {
            if error.kind() == kind {
                return true;
            }
        }
        if self.trigger.is_empty() {
            return self.trigger_kind.is_none();
        }
        error
            .to_string()
            .to_lowercase()
            .contains(&self.trigger.to_lowercase())
    }
}

/// One unit of work in a workflow.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StepSpec {
    pub id: String,
    pub action: StepAction,
    /// Step ids that must succeed before this step runs.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// Action-level retry. Defaults to the executor's policy.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub on_error: ErrorPolicy,
    #[serde(default)]
    pub self_healing: Vec<HealingStrategy>,
    /// Gate: if this does not become true in time, the step is skipped.
    #[serde(default)]
    pub precondition: Option<WaitCondition>,
}

impl StepSpec {
    pub fn new(id: impl Into<String>, action: StepAction) -> Self {
        Self {
            id: id.into(),
            action,
            depends_on: Vec::new(),
            timeout: None,
            retry: None,
            on_error: ErrorPolicy::default(),
            self_healing: Vec::new(),
            precondition: None,
        }
    }

    pub fn after(mut self, dep: impl Into<String>) -> Self {
        self.depends_on.push(dep.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn on_error(mut self, policy: ErrorPolicy) -> Self {
        self.on_error = policy;
        self
    }

    pub fn heal(mut self, strategy: HealingStrategy) -> Self {
        self.self_healing.push(strategy);
        self
    }

    pub fn when(mut self, precondition: WaitCondition) -> Self {
        self.precondition = Some(precondition);
        self
    }
}

/// A named collection of steps with dependencies.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Workflow {
    pub name: String,
    pub steps: Vec<StepSpec>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    /// Check ids and dependencies and return step indices in an order that
    /// respects them. Fails before anything runs.
    pub fn topological_order(&self) -> Result<Vec<usize>> {
        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, step) in self.steps.iter().enumerate() {
            if index.insert(step.id.as_str(), i).is_some() {
                return Err(Error::DuplicateStep(step.id.clone()));
            }
        }
        for step in &self.steps {
            for dep in &step.depends_on {
                if !index.contains_key(dep.as_str()) {
                    return Err(Error::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        // DFS with three colors; a gray-gray edge is a cycle.
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }
        let n = self.steps.len();
        let mut color = vec![Color::White; n];
        let mut order = Vec::with_capacity(n);

        fn visit(
            steps: &[StepSpec],
            index: &HashMap<&str, usize>,
            color: &mut [Color],
            order: &mut Vec<usize>,
            i: usize,
        ) -> Result<()> {
            match color[i] {
                Color::Black => return Ok(()),
                Color::Gray => return Err(Error::CyclicDependency(steps[i].id.clone())),
                Color::White => {}
            }
            color[i] = Color::Gray;
            for dep in &steps[i].depends_on {
                visit(steps, index, color, order, index[dep.as_str()])?;
            }
            color[i] = Color::Black;
            order.push(i);
            Ok(())
        }

        for i in 0..n {
            visit(&self.steps, &index, &mut color, &mut order, i)?;
        }
        Ok(order)
    }

    /// Group steps into dependency levels: everything in level k depends
    /// only on steps in levels < k, so a level can run in parallel.
    pub fn levels(&self) -> Result<Vec<Vec<usize>>> {
        let order = self.topological_order()?;
        let index: HashMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();

        let mut level = vec![0usize; self.steps.len()];
        for &i in &order {
            level[i] = self.steps[i]
                .depends_on
                .iter()
                .map(|d| level[index[d.as_str()]] + 1)
                .max()
                .unwrap_or(0);
        }

        let depth = level.iter().copied().max().map_or(0, |d| d + 1);
        let mut grouped = vec![Vec::new(); depth];
        for &i in &order {
            grouped[level[i]].push(i);
        }
        Ok(grouped)
    }
}

/// Terminal state of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

/// Audit of one healing attempt.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HealingRecord {
    pub strategy: String,
    pub succeeded: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    /// Action-level failed attempts from the last execution. A step whose
    /// action exhausted a budget of n reports n.
    pub retry_count: u32,
    pub healing: Vec<HealingRecord>,
    pub duration: Duration,
    pub value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<Vec<u8>>,
}

impl StepResult {
    fn skipped(step_id: &str, reason: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Skipped,
            error: Some(reason.to_string()),
            error_kind: None,
            retry_count: 0,
            healing: Vec::new(),
            duration: Duration::ZERO,
            value: None,
            screenshot: None,
        }
    }

    fn cancelled(step_id: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Cancelled,
            error: None,
            error_kind: None,
            retry_count: 0,
            healing: Vec::new(),
            duration: Duration::ZERO,
            value: None,
            screenshot: None,
        }
    }
}

/// One unresolvable failure, rolled up from the step it occurred in.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TaskError {
    pub step_id: String,
    pub error: String,
    pub error_kind: Option<ErrorKind>,
}

/// Run-level view of one healing attempt.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HealingAudit {
    pub step_id: String,
    pub strategy: String,
    pub succeeded: bool,
}

/// Result of one workflow run.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TaskResult {
    pub workflow: String,
    pub run_id: String,
    pub success: bool,
    pub cancelled: bool,
    pub steps: Vec<StepResult>,
    /// Failures that could not be resolved, including ones tolerated by a
    /// skip policy.
    pub errors: Vec<TaskError>,
    /// Every healing strategy applied during the run, across all steps.
    pub healing: Vec<HealingAudit>,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration: Duration,
}

impl TaskResult {
    /// Result of a named step, if it ran.
    pub fn step(&self, id: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step_id == id)
    }
}

/// Implementation of a `StepAction::Custom` step.
#[async_trait]
pub trait CustomStepHandler: Send + Sync {
    async fn run(
        &self,
        page: &Arc<dyn PageDriver>,
        payload: &serde_json::Value,
    ) -> Result<Option<serde_json::Value>>;
}

struct StepOutput {
    value: Option<serde_json::Value>,
    screenshot: Option<Vec<u8>>,
    retry_count: u32,
}

/// A failed execution together with how many attempts the action layer
/// burned before giving up.
struct AttemptError {
    error: Error,
    retry_count: u32,
}

impl From<Error> for AttemptError {
    fn from(error: Error) -> Self {
        Self {
            error,
            retry_count: 0,
        }
    }
}

/// Runs workflows against a page: validates the dependency graph, schedules
/// steps sequentially or by dependency level, and applies self-healing and
/// error policies per step.
pub struct WorkflowRunner {
    executor: Arc<ActionExecutor>,
    waiter: Arc<AdaptiveWaiter>,
    handlers: Mutex<HashMap<String, Arc<dyn CustomStepHandler>>>,
    cancellations: Mutex<HashMap<String, Arc<AtomicBool>>>,
    max_parallel: usize,
}

impl WorkflowRunner {
    pub fn new(executor: Arc<ActionExecutor>, waiter: Arc<AdaptiveWaiter>) -> Self {
        Self {
            executor,
            waiter,
            handlers: Mutex::new(HashMap::new()),
            cancellations: Mutex::new(HashMap::new()),
            max_parallel: DEFAULT_MAX_PARALLEL,
        }
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn CustomStepHandler>) {
        self.handlers.lock().insert(name.into(), handler);
    }

    /// Request cancellation of a running workflow. Returns false when no
    /// run with that id is active.
    pub fn cancel(&self, run_id: &str) -> bool {
        match self.cancellations.lock().get(run_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub fn new_run_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Run steps one at a time in dependency order.
    pub async fn run(&self, page: &Arc<dyn PageDriver>, workflow: &Workflow) -> Result<TaskResult> {
        self.run_with_id(page, workflow, Self::new_run_id()).await
    }

    /// Like [`run`](Self::run) with a caller-chosen run id, so the run can
    /// be cancelled from another task.
    pub async fn run_with_id(
        &self,
        page: &Arc<dyn PageDriver>,
        workflow: &Workflow,
        run_id: String,
    ) -> Result<TaskResult> {
        let order = workflow.topological_order()?;
        let cancel = self.register_run(&run_id);
        let started = Instant::now();
        info!(workflow = %workflow.name, run_id = %run_id, steps = order.len(), "workflow started");

        let mut results: Vec<Option<StepResult>> = vec![None; workflow.steps.len()];
        let mut satisfied: HashSet<&str> = HashSet::new();
        let mut aborted = false;
        let mut was_cancelled = false;

        for &i in &order {
            let step = &workflow.steps[i];

            if cancel.load(Ordering::SeqCst) {
                was_cancelled = true;
            }
            if was_cancelled {
                results[i] = Some(StepResult::cancelled(&step.id));
                continue;
            }
            if aborted {
                results[i] = Some(StepResult::skipped(&step.id, "run aborted"));
                continue;
            }
            if let Some(dep) = step
                .depends_on
                .iter()
                .find(|d| !satisfied.contains(d.as_str()))
            {
                results[i] = Some(StepResult::skipped(
                    &step.id,
                    &format!("dependency '{dep}' did not succeed"),
                ));
                continue;
            }

            let result = self.run_step(page, step).await;
            match result.status {
                StepStatus::Succeeded => {
                    satisfied.insert(step.id.as_str());
                }
                StepStatus::Failed if matches!(step.on_error, ErrorPolicy::Abort) => {
                    warn!(step = %step.id, "step failed, aborting run");
                    aborted = true;
                }
                _ => {}
            }
            results[i] = Some(result);
        }

        self.finish_run(&run_id);
        Ok(self.summarize(workflow, run_id, results, was_cancelled, started))
    }

    /// Run independent steps concurrently, level by level. Within a level
    /// at most `max_parallel` steps are in flight.
    pub async fn run_parallel(
        &self,
        page: &Arc<dyn PageDriver>,
        workflow: &Workflow,
    ) -> Result<TaskResult> {
        self.run_parallel_with_id(page, workflow, Self::new_run_id())
            .await
    }

    /// Like [`run_parallel`](Self::run_parallel) with a caller-chosen run
    /// id, so the run can be cancelled from another task.
    pub async fn run_parallel_with_id(
        &self,
        page: &Arc<dyn PageDriver>,
        workflow: &Workflow,
        run_id: String,
    ) -> Result<TaskResult> {
        let levels = workflow.levels()?;
        let cancel = self.register_run(&run_id);
        let started = Instant::now();
        info!(
            workflow = %workflow.name,
            run_id = %run_id,
            levels = levels.len(),
            "parallel workflow started"
        );

        let mut results: Vec<Option<StepResult>> = vec![None; workflow.steps.len()];
        let mut satisfied: HashSet<&str> = HashSet::new();
        let mut aborted = false;
        let mut was_cancelled = false;

        for level in &levels {
            if cancel.load(Ordering::SeqCst) {
                was_cancelled = true;
            }

            let mut runnable = Vec::new();
            for &i in level {
                let step = &workflow.steps[i];
                if was_cancelled {
                    results[i] = Some(StepResult::cancelled(&step.id));
                } else if aborted {
                    results[i] = Some(StepResult::skipped(&step.id, "run aborted"));
                } else if let Some(dep) = step
                    .depends_on
                    .iter()
                    .find(|d| !satisfied.contains(d.as_str()))
                {
                    results[i] = Some(StepResult::skipped(
                        &step.id,
                        &format!("dependency '{dep}' did not succeed"),
                    ));
                } else {
                    runnable.push(i);
                }
            }

            let level_results: Vec<(usize, StepResult)> = stream::iter(runnable)
                .map(|i| async move { (i, self.run_step(page, &workflow.steps[i]).await) })
                .buffer_unordered(self.max_parallel)
                .collect()
                .await;

            for (i, result) in level_results {
                let step = &workflow.steps[i];
                match result.status {
                    StepStatus::Succeeded => {
                        satisfied.insert(step.id.as_str());
                    }
                    StepStatus::Failed if matches!(step.on_error, ErrorPolicy::Abort) => {
                        warn!(step = %step.id, "step failed, aborting run");
                        aborted = true;
                    }
                    _ => {}
                }
                results[i] = Some(result);
            }
        }

        self.finish_run(&run_id);
        Ok(self.summarize(workflow, run_id, results, was_cancelled, started))
    }

    fn register_run(&self, run_id: &str) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.cancellations
            .lock()
            .insert(run_id.to_string(), flag.clone());
        flag
    }

    fn finish_run(&self, run_id: &str) {
        self.cancellations.lock().remove(run_id);
    }

    fn summarize(
        &self,
        workflow: &Workflow,
        run_id: String,
        results: Vec<Option<StepResult>>,
        cancelled: bool,
        started: Instant,
    ) -> TaskResult {
        let steps: Vec<StepResult> = results.into_iter().flatten().collect();
        let succeeded = steps
            .iter()
            .filter(|s| s.status == StepStatus::Succeeded)
            .count();
        let failed = steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .count();
        let skipped = steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Skipped | StepStatus::Cancelled))
            .count();
        let success = !cancelled && failed == 0;

        // Skipped steps carry an error_kind only when an actual failure was
        // tolerated; dependency and precondition skips don't.
        let errors: Vec<TaskError> = steps
            .iter()
            .filter(|s| {
                s.status == StepStatus::Failed
                    || (s.status == StepStatus::Skipped && s.error_kind.is_some())
            })
            .map(|s| TaskError {
                step_id: s.step_id.clone(),
                error: s.error.clone().unwrap_or_default(),
                error_kind: s.error_kind,
            })
            .collect();
        let healing: Vec<HealingAudit> = steps
            .iter()
            .flat_map(|s| {
                s.healing.iter().map(|h| HealingAudit {
                    step_id: s.step_id.clone(),
                    strategy: h.strategy.clone(),
                    succeeded: h.succeeded,
                })
            })
            .collect();

        info!(
            workflow = %workflow.name,
            run_id = %run_id,
            succeeded,
            failed,
            skipped,
            success,
            "workflow finished"
        );
        TaskResult {
            workflow: workflow.name.clone(),
            run_id,
            success,
            cancelled,
            steps,
            errors,
            healing,
            succeeded,
            failed,
            skipped,
            duration: started.elapsed(),
        }
    }

    /// Execute one step: precondition gate, timeout, then self-healing and
    /// the error policy on failure.
    async fn run_step(&self, page: &Arc<dyn PageDriver>, step: &StepSpec) -> StepResult {
        let started = Instant::now();

        if let Some(ref precondition) = step.precondition {
            if self
                .waiter
                .wait_for(page, precondition, PRECONDITION_TIMEOUT)
                .await
                .is_err()
            {
                debug!(step = %step.id, "precondition not met, skipping");
                return StepResult::skipped(&step.id, "precondition not met");
            }
        }

        let mut timeout = step.timeout.unwrap_or(DEFAULT_STEP_TIMEOUT);
        let mut action = step.action.clone();
        let mut healing: Vec<HealingRecord> = Vec::new();

        let mut last_error = match self.attempt(page, step, &action, timeout).await {
            Ok(output) => return self.success_result(step, output, healing, started),
            Err(e) => e,
        };

        for strategy in &step.self_healing {
            if !strategy.matches(&last_error.error) {
                continue;
            }
            debug!(
                step = %step.id,
                strategy = strategy.action.label(),
                error = %last_error.error,
                "applying self-healing"
            );
            self.apply_healing(page, &strategy.action, &mut action, &mut timeout)
                .await;

            match self.attempt(page, step, &action, timeout).await {
                Ok(output) => {
                    healing.push(HealingRecord {
                        strategy: strategy.action.label().to_string(),
                        succeeded: true,
                    });
                    return self.success_result(step, output, healing, started);
                }
                Err(e) => {
                    healing.push(HealingRecord {
                        strategy: strategy.action.label().to_string(),
                        succeeded: false,
                    });
                    last_error = e;
                }
            }
        }
        if !healing.is_empty() {
            last_error = AttemptError {
                error: Error::SelfHealingExhausted(step.id.clone()),
                retry_count: last_error.retry_count,
            };
        }

        match &step.on_error {
            ErrorPolicy::Retry => {
                self.executor.resolver().clear_cache();
                match self.attempt(page, step, &action, timeout).await {
                    Ok(output) => return self.success_result(step, output, healing, started),
                    Err(e) => last_error = e,
                }
            }
            ErrorPolicy::Fallback { action: fallback } => {
                debug!(step = %step.id, "running fallback action");
                match self.attempt(page, step, fallback, timeout).await {
                    Ok(output) => return self.success_result(step, output, healing, started),
                    Err(e) => last_error = e,
                }
            }
            ErrorPolicy::Abort | ErrorPolicy::Skip => {}
        }

        // A tolerated failure becomes a skip: recorded, run continues, but
        // dependents do not execute on top of missing effects.
        let status = if matches!(step.on_error, ErrorPolicy::Skip) {
            StepStatus::Skipped
        } else {
            StepStatus::Failed
        };
        StepResult {
            step_id: step.id.clone(),
            status,
            error_kind: Some(last_error.error.kind()),
            error: Some(last_error.error.to_string()),
            retry_count: last_error.retry_count,
            healing,
            duration: started.elapsed(),
            value: None,
            screenshot: None,
        }
    }

    fn success_result(
        &self,
        step: &StepSpec,
        output: StepOutput,
        healing: Vec<HealingRecord>,
        started: Instant,
    ) -> StepResult {
        StepResult {
            step_id: step.id.clone(),
            status: StepStatus::Succeeded,
            error: None,
            error_kind: None,
            retry_count: output.retry_count,
            healing,
            duration: started.elapsed(),
            value: output.value,
            screenshot: output.screenshot,
        }
    }

    async fn apply_healing(
        &self,
        page: &Arc<dyn PageDriver>,
        healing: &HealingAction,
        action: &mut StepAction,
        timeout: &mut Duration,
    ) {
        match healing {
            HealingAction::RefreshPage => {
                if let Err(e) = page.reload().await {
                    warn!("healing reload failed: {e}");
                }
                let _ = page
                    .wait_for_load_state(LoadState::Load, Duration::from_secs(10))
                    .await;
            }
            HealingAction::WaitLonger => {
                *timeout = timeout.saturating_mul(2);
            }
            HealingAction::ClearResolutionCache => {
                self.executor.resolver().clear_cache();
            }
            HealingAction::TryAlternative { target } => {
                self.executor.resolver().clear_cache();
                if let (Some(alternative), Some(slot)) = (target.clone(), action.target_mut()) {
                    *slot = alternative;
                }
            }
        }
    }

    /// One timed execution of a step action.
    async fn attempt(
        &self,
        page: &Arc<dyn PageDriver>,
        step: &StepSpec,
        action: &StepAction,
        timeout: Duration,
    ) -> std::result::Result<StepOutput, AttemptError> {
        match tokio::time::timeout(timeout, self.execute(page, step, action, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(Error::StepTimeout(step.id.clone()).into()),
        }
    }

    async fn execute(
        &self,
        page: &Arc<dyn PageDriver>,
        step: &StepSpec,
        action: &StepAction,
        timeout: Duration,
    ) -> std::result::Result<StepOutput, AttemptError> {
        let options = ActionOptions {
            timeout,
            retry: step.retry.unwrap_or_default(),
            ..ActionOptions::default()
        };

        match action {
            StepAction::Navigate { url } => {
                page.navigate(url).await?;
                let _ = page
                    .wait_for_load_state(LoadState::Load, Duration::from_secs(10))
                    .await;
                Ok(StepOutput {
                    value: None,
                    screenshot: None,
                    retry_count: 0,
                })
            }
            StepAction::Click { target } => {
                let result = self.executor.click(page, target, &options).await;
                into_output(result)
            }
            StepAction::Type { target, text } => {
                let result = self.executor.type_text(page, target, text, &options).await;
                into_output(result)
            }
            StepAction::Press { target, key } => {
                let result = self.executor.press(page, target, key, &options).await;
                into_output(result)
            }
            StepAction::Scroll { dx, dy } => {
                let result = self.executor.scroll(page, *dx, *dy, &options).await;
                into_output(result)
            }
            StepAction::Wait { condition } => {
                self.waiter.wait_for(page, condition, timeout).await?;
                Ok(StepOutput {
                    value: None,
                    screenshot: None,
                    retry_count: 0,
                })
            }
            StepAction::Extract { target } => {
                let result = self.executor.extract_text(page, target, &options).await;
                into_output(result)
            }
            StepAction::Screenshot => {
                let bytes = page.screenshot().await?;
                Ok(StepOutput {
                    value: None,
                    screenshot: Some(bytes),
                    retry_count: 0,
                })
            }
            StepAction::Custom { name, payload } => {
                let handler = self.handlers.lock().get(name).cloned();
                let handler = handler.ok_or_else(|| {
                    Error::ActionValidationFailed(format!("no handler for custom step '{name}'"))
                })?;
                let value = handler.run(page, payload).await?;
                Ok(StepOutput {
                    value,
                    screenshot: None,
                    retry_count: 0,
                })
            }
        }
    }
}

/// Convert a finished action result into the step pipeline's error type,
/// keeping the attempt count either way.
fn into_output(result: ActionResult) -> std::result::Result<StepOutput, AttemptError> {
    if result.success {
        return Ok(StepOutput {
            value: result.value,
            screenshot: None,
            retry_count: result.retry_count,
        });
    }
    let message = result.error.unwrap_or_else(|| "action failed".to_string());
    let error = match result.error_kind {
        Some(ErrorKind::ElementNotFound) => Error::ElementNotFound(message),
        Some(ErrorKind::NotInteractable) => Error::NotInteractable(message),
        Some(ErrorKind::WaitTimeout) => Error::WaitTimeout(message),
        Some(ErrorKind::Navigation) => Error::NavigationError(message),
        _ => Error::ActionValidationFailed(message),
    };
    Err(AttemptError {
        error,
        retry_count: result.retry_count,
    })
}
