//! Apply executor
//!
//! Runs a [`ChangeSet`] against providers with bounded parallelism. Every
//! entry is a task that reports exactly one [`TaskOutcome`] on a completion
//! channel; the scheduler owns all entry states and is the only place that
//! decides what runs next, what gets skipped and what gets committed.

use crate::error::{EngineError, RemoteError, Result};
use crate::plan::{ActionType, ChangeSet, ChangeSetEntry, diff_record, resolve_attributes};
use crate::provider::{Provider, ProviderRegistry, RemoteResult, ReplaceMode, ResourceSchema, RetryConfig};
use crate::resource::{AttributeValue, Attributes, ResourceId};
use crate::state::{LockToken, StateLock, StateRecord, StateStore};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

/// Executor tuning
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorOptions {
    /// Maximum number of entries in flight
    pub parallelism: usize,

    pub retry: RetryConfig,

    /// Deadline for a single provider call
    pub call_timeout: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            parallelism: 4,
            retry: RetryConfig::default(),
            call_timeout: Duration::from_secs(300),
        }
    }
}

/// Cooperative cancellation for an apply run
///
/// Once cancelled, no new entry starts. Provider calls already in flight are
/// allowed to finish and their results are committed. The run that observes
/// the cancellation clears it on exit, so later runs start normally.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Terminal status of an entry
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntryStatus {
    /// The action ran; `action` may differ from the planned one for deferred entries
    Applied { action: ActionType },
    /// Nothing to do
    Unchanged,
    Failed { error: String, tainted: bool },
    Skipped { reason: String },
}

impl EntryStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, EntryStatus::Applied { .. } | EntryStatus::Unchanged)
    }
}

/// Result of a single entry
#[derive(Debug, Clone, Serialize)]
pub struct EntryResult {
    pub id: ResourceId,

    /// Action from the plan
    pub planned: ActionType,

    pub status: EntryStatus,

    /// Provider calls made, retries included
    pub attempts: u32,
}

/// Overall outcome of an apply run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Success,
    PartialFailure {
        succeeded: Vec<ResourceId>,
        failed: Vec<ResourceId>,
        skipped: Vec<ResourceId>,
    },
}

/// Result of applying a change set
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    /// Per-entry results in plan order
    pub results: Vec<EntryResult>,

    /// Total execution time in milliseconds
    pub duration_ms: u64,

    /// Whether the run was cancelled before completion
    pub cancelled: bool,
}

impl ApplyReport {
    pub fn get(&self, id: &ResourceId) -> Option<&EntryResult> {
        self.results.iter().find(|r| &r.id == id)
    }

    pub fn is_success(&self) -> bool {
        self.results.iter().all(|r| r.status.is_success())
    }

    fn ids_where(&self, pred: impl Fn(&EntryStatus) -> bool) -> Vec<ResourceId> {
        self.results
            .iter()
            .filter(|r| pred(&r.status))
            .map(|r| r.id.clone())
            .collect()
    }

    pub fn succeeded(&self) -> Vec<ResourceId> {
        self.ids_where(EntryStatus::is_success)
    }

    pub fn failed(&self) -> Vec<ResourceId> {
        self.ids_where(|s| matches!(s, EntryStatus::Failed { .. }))
    }

    pub fn skipped(&self) -> Vec<ResourceId> {
        self.ids_where(|s| matches!(s, EntryStatus::Skipped { .. }))
    }

    /// Resources left tainted by this run; they need operator attention
    pub fn tainted(&self) -> Vec<ResourceId> {
        self.ids_where(|s| matches!(s, EntryStatus::Failed { tainted: true, .. }))
    }

    pub fn outcome(&self) -> ApplyOutcome {
        if self.is_success() {
            ApplyOutcome::Success
        } else {
            ApplyOutcome::PartialFailure {
                succeeded: self.succeeded(),
                failed: self.failed(),
                skipped: self.skipped(),
            }
        }
    }

    /// Turn a partial failure into an error
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(EngineError::PartialFailure {
                failed: self.failed().len(),
                skipped: self.skipped().len(),
            })
        }
    }
}

/// What a task reports back to the scheduler
#[derive(Debug)]
struct TaskOutcome {
    status: EntryStatus,
    /// Attributes dependents may reference
    outputs: Option<Attributes>,
    attempts: u32,
}

impl TaskOutcome {
    fn failed(error: impl ToString, tainted: bool, attempts: u32) -> Self {
        Self {
            status: EntryStatus::Failed {
                error: error.to_string(),
                tainted,
            },
            outputs: None,
            attempts,
        }
    }
}

/// Sends a failure if the task ends without reporting, e.g. on panic
struct CompletionGuard {
    index: usize,
    tx: mpsc::UnboundedSender<(usize, TaskOutcome)>,
    sent: bool,
}

impl CompletionGuard {
    fn send(mut self, outcome: TaskOutcome) {
        self.sent = true;
        let _ = self.tx.send((self.index, outcome));
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if !self.sent {
            let _ = self.tx.send((
                self.index,
                TaskOutcome::failed("apply task terminated unexpectedly", false, 0),
            ));
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum EntryState {
    Pending,
    Running,
    Done(EntryStatus),
}

/// Shared, immutable context of one task
struct TaskContext {
    store: Arc<StateStore>,
    provider: Arc<dyn Provider>,
    schema: ResourceSchema,
    lock: LockToken,
    retry: RetryConfig,
    call_timeout: Duration,
}

/// Apply executor
pub struct Executor {
    store: Arc<StateStore>,
    registry: ProviderRegistry,
    options: ExecutorOptions,
    cancel: CancelHandle,
}

impl Executor {
    pub fn new(store: Arc<StateStore>, registry: ProviderRegistry, options: ExecutorOptions) -> Self {
        Self {
            store,
            registry,
            options,
            cancel: CancelHandle::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Execute every entry of `plan` at most once while `lock` is held
    pub async fn execute(&self, plan: &ChangeSet, lock: &StateLock) -> Result<ApplyReport> {
        let start = Instant::now();
        let token = lock.token();
        let entries = &plan.entries;
        let count = entries.len();

        let index: HashMap<&ResourceId, usize> =
            entries.iter().enumerate().map(|(i, e)| (&e.id, i)).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
        let mut waiting: Vec<usize> = vec![0; count];
        for (i, entry) in entries.iter().enumerate() {
            for dep in &entry.dependencies {
                if let Some(&d) = index.get(dep) {
                    dependents[d].push(i);
                    waiting[i] += 1;
                }
            }
        }

        // Outputs visible to references: stored records first, then fresh results
        let mut outputs: HashMap<ResourceId, Attributes> = entries
            .iter()
            .filter_map(|e| {
                e.prior
                    .as_ref()
                    .filter(|r| !r.tainted)
                    .map(|r| (e.id.clone(), r.attributes.clone()))
            })
            .collect();

        let mut states: Vec<EntryState> = vec![EntryState::Pending; count];
        let mut attempts: Vec<u32> = vec![0; count];
        let mut ready: BTreeSet<usize> = (0..count).filter(|i| waiting[*i] == 0).collect();
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, TaskOutcome)>();
        let mut cancel_rx = Some(self.cancel.subscribe());
        let mut cancelled = false;
        let mut in_flight = 0usize;
        let parallelism = self.options.parallelism.max(1);

        tracing::info!(
            "Applying {} entries with parallelism {}",
            count,
            parallelism
        );

        loop {
            if !cancelled && self.cancel.is_cancelled() {
                cancelled = true;
                tracing::warn!("Apply cancelled; waiting for {} in-flight entries", in_flight);
                ready.clear();
                for state in states.iter_mut() {
                    if *state == EntryState::Pending {
                        *state = EntryState::Done(EntryStatus::Skipped {
                            reason: "apply cancelled".to_string(),
                        });
                    }
                }
            }

            while in_flight < parallelism {
                let Some(i) = ready.pop_first() else { break };
                if states[i] != EntryState::Pending {
                    continue;
                }
                states[i] = EntryState::Running;
                let entry = &entries[i];
                let guard = CompletionGuard {
                    index: i,
                    tx: tx.clone(),
                    sent: false,
                };

                let (resolved, pending) = resolve_attributes(&entry.desired, |node, output| {
                    outputs.get(node).and_then(|a| a.get(output).cloned())
                });
                if let Some((node, output)) = pending.into_iter().next() {
                    guard.send(TaskOutcome::failed(
                        EngineError::UnresolvedReference {
                            from: entry.id.clone(),
                            to: node,
                            output,
                        },
                        false,
                        0,
                    ));
                    in_flight += 1;
                    continue;
                }

                let ctx = match self.task_context(entry, &token) {
                    Ok(ctx) => ctx,
                    Err(e) => {
                        guard.send(TaskOutcome::failed(e, false, 0));
                        in_flight += 1;
                        continue;
                    }
                };

                let entry = entry.clone();
                in_flight += 1;
                tokio::spawn(async move {
                    let outcome = run_entry(&ctx, &entry, resolved).await;
                    guard.send(outcome);
                });
            }

            if in_flight == 0 {
                break;
            }

            let mut watch_closed = false;
            let message = match cancel_rx.as_mut() {
                Some(crx) if !cancelled => tokio::select! {
                    message = rx.recv() => Some(message),
                    changed = crx.changed() => {
                        watch_closed = changed.is_err();
                        None
                    }
                },
                _ => Some(rx.recv().await),
            };
            if watch_closed {
                cancel_rx = None;
            }
            let Some(message) = message else { continue };
            let Some((i, outcome)) = message else { break };

            in_flight -= 1;
            attempts[i] += outcome.attempts;
            let id = &entries[i].id;

            match &outcome.status {
                EntryStatus::Failed { error, tainted } => {
                    tracing::error!("{} {} failed: {}", entries[i].action, id, error);
                    if *tainted {
                        tracing::warn!("{} is tainted and needs attention", id);
                    }
                    skip_dependents(i, entries, &dependents, &mut states);
                }
                status => {
                    tracing::info!("{} {}: {:?}", entries[i].action, id, status);
                    if let Some(out) = outcome.outputs {
                        outputs.insert(id.clone(), out);
                    } else if entries[i].action == ActionType::Delete {
                        outputs.remove(id);
                    }
                    for &d in &dependents[i] {
                        waiting[d] -= 1;
                        if waiting[d] == 0 && states[d] == EntryState::Pending {
                            ready.insert(d);
                        }
                    }
                }
            }
            states[i] = EntryState::Done(outcome.status);
        }

        if cancelled {
            self.cancel.reset();
        }

        let results = entries
            .iter()
            .zip(states)
            .zip(attempts)
            .map(|((entry, state), attempts)| EntryResult {
                id: entry.id.clone(),
                planned: entry.action,
                status: match state {
                    EntryState::Done(status) => status,
                    // Unreachable unless the completion channel closed early
                    EntryState::Pending | EntryState::Running => EntryStatus::Skipped {
                        reason: "not started".to_string(),
                    },
                },
                attempts,
            })
            .collect();

        let report = ApplyReport {
            results,
            duration_ms: start.elapsed().as_millis() as u64,
            cancelled,
        };
        match report.outcome() {
            ApplyOutcome::Success => tracing::info!("Apply complete in {}ms", report.duration_ms),
            ApplyOutcome::PartialFailure {
                succeeded,
                failed,
                skipped,
            } => tracing::warn!(
                "Apply finished with errors: {} succeeded, {} failed, {} skipped",
                succeeded.len(),
                failed.len(),
                skipped.len()
            ),
        }
        Ok(report)
    }

    fn task_context(&self, entry: &ChangeSetEntry, lock: &LockToken) -> Result<Arc<TaskContext>> {
        let provider = self.registry.get(&entry.provider)?;
        let schema = provider.schema(&entry.id.resource_type);
        Ok(Arc::new(TaskContext {
            store: Arc::clone(&self.store),
            provider,
            schema,
            lock: lock.clone(),
            retry: self.options.retry.clone(),
            call_timeout: self.options.call_timeout,
        }))
    }
}

/// Mark every pending entry downstream of `failed` as skipped
fn skip_dependents(
    failed: usize,
    entries: &[ChangeSetEntry],
    dependents: &[Vec<usize>],
    states: &mut [EntryState],
) {
    let reason = format!("dependency {} failed", entries[failed].id);
    let mut queue: VecDeque<usize> = dependents[failed].iter().copied().collect();
    while let Some(d) = queue.pop_front() {
        if states[d] == EntryState::Pending {
            tracing::warn!("Skipping {}: {}", entries[d].id, reason);
            states[d] = EntryState::Done(EntryStatus::Skipped {
                reason: reason.clone(),
            });
            queue.extend(dependents[d].iter().copied());
        }
    }
}

/// Call a provider operation under the deadline and retry policy
///
/// Returns the final result and the number of attempts made.
pub(crate) async fn call_with_retry<T, F, Fut>(
    retry: &RetryConfig,
    call_timeout: Duration,
    what: &str,
    mut call: F,
) -> (RemoteResult<T>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RemoteResult<T>>,
{
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        let result = match tokio::time::timeout(call_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::retryable(format!(
                "{} timed out after {:?}",
                what, call_timeout
            ))),
        };
        attempt += 1;

        match result {
            Err(e) if e.retryable && attempt < max_attempts => {
                let delay = retry.delay_for_attempt(attempt - 1);
                tracing::warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    what,
                    attempt,
                    max_attempts,
                    delay,
                    e.message
                );
                tokio::time::sleep(delay).await;
            }
            result => return (result, attempt),
        }
    }
}

async fn run_entry(ctx: &TaskContext, entry: &ChangeSetEntry, resolved: Attributes) -> TaskOutcome {
    let mut action = entry.action;
    let mut changed = entry.changed.clone();
    let mut replace_mode = entry.replace_mode.unwrap_or(ctx.schema.replace_mode);

    // Values that were unknown at plan time are concrete now; re-diff
    if entry.deferred
        && matches!(action, ActionType::NoOp | ActionType::Update)
        && let Some(prior) = &entry.prior
    {
        let diff = diff_record(&entry.desired, &resolved, &entry.provider, prior, &ctx.schema);
        action = diff.action;
        changed = diff.changed;
        if let Some(mode) = diff.replace_mode {
            replace_mode = mode;
        }
        if action != entry.action {
            tracing::info!(
                "{} re-evaluated from {} to {} after upstream changes",
                entry.id,
                entry.action,
                action
            );
        }
    }

    match action {
        ActionType::NoOp => settle_noop(ctx, entry).await,
        ActionType::Create => create(ctx, entry, resolved, entry.prior_version()).await,
        ActionType::Update => update(ctx, entry, resolved, &changed).await,
        ActionType::Delete => delete(ctx, entry).await,
        ActionType::Replace => match replace_mode {
            ReplaceMode::CreateBeforeDestroy => create_before_destroy(ctx, entry, resolved).await,
            ReplaceMode::DestroyBeforeCreate => destroy_before_create(ctx, entry, resolved).await,
        },
    }
}

fn record_for(entry: &ChangeSetEntry, attributes: Attributes) -> StateRecord {
    let declared = entry
        .desired
        .iter()
        .filter(|(_, value)| !matches!(value, AttributeValue::Unknown))
        .map(|(key, _)| key.clone());
    StateRecord::new(entry.id.clone(), &entry.provider)
        .with_attributes(attributes)
        .with_declared(declared)
        .with_dependencies(entry.dependencies.iter().cloned())
}

async fn commit(
    ctx: &TaskContext,
    record: StateRecord,
    expected: Option<u64>,
    action: ActionType,
    attempts: u32,
) -> TaskOutcome {
    let outputs = record.attributes.clone();
    match ctx.store.write(&ctx.lock, record, expected).await {
        Ok(_) => TaskOutcome {
            status: EntryStatus::Applied { action },
            outputs: Some(outputs),
            attempts,
        },
        Err(e) => TaskOutcome::failed(format!("remote change applied but state write failed: {}", e), false, attempts),
    }
}

async fn taint(ctx: &TaskContext, entry: &ChangeSetEntry, partial: Option<Attributes>) -> bool {
    match ctx
        .store
        .taint(&ctx.lock, &entry.id, &entry.provider, partial)
        .await
    {
        Ok(_) => true,
        Err(e) => {
            tracing::error!("Could not mark {} as tainted: {}", entry.id, e);
            false
        }
    }
}

/// Keep recorded dependencies current without touching the provider
async fn settle_noop(ctx: &TaskContext, entry: &ChangeSetEntry) -> TaskOutcome {
    let Some(prior) = &entry.prior else {
        return TaskOutcome {
            status: EntryStatus::Unchanged,
            outputs: None,
            attempts: 0,
        };
    };

    let recorded: BTreeSet<&ResourceId> = prior.dependencies.iter().collect();
    let desired: BTreeSet<&ResourceId> = entry.dependencies.iter().collect();
    if recorded != desired {
        let mut record = prior.clone();
        record.dependencies = entry.dependencies.clone();
        if let Err(e) = ctx.store.write(&ctx.lock, record, Some(prior.version)).await {
            return TaskOutcome::failed(e, false, 0);
        }
    }

    TaskOutcome {
        status: EntryStatus::Unchanged,
        outputs: Some(prior.attributes.clone()),
        attempts: 0,
    }
}

async fn create(
    ctx: &TaskContext,
    entry: &ChangeSetEntry,
    resolved: Attributes,
    expected: Option<u64>,
) -> TaskOutcome {
    let what = format!("create {}", entry.id);
    let (result, attempts) = call_with_retry(&ctx.retry, ctx.call_timeout, &what, || {
        ctx.provider.create(&entry.id, &resolved)
    })
    .await;

    match result {
        Ok(outputs) => {
            let mut attributes = resolved;
            attributes.extend(outputs);
            commit(ctx, record_for(entry, attributes), expected, ActionType::Create, attempts).await
        }
        Err(e) => {
            let tainted = match e.partial.clone() {
                Some(partial) => taint(ctx, entry, Some(partial)).await,
                None => false,
            };
            TaskOutcome::failed(e, tainted, attempts)
        }
    }
}

async fn update(
    ctx: &TaskContext,
    entry: &ChangeSetEntry,
    resolved: Attributes,
    changed: &[String],
) -> TaskOutcome {
    let prior = entry.prior_attributes();
    let what = format!("update {}", entry.id);
    let (result, attempts) = call_with_retry(&ctx.retry, ctx.call_timeout, &what, || {
        ctx.provider.update(&entry.id, &prior, &resolved, changed)
    })
    .await;

    match result {
        Ok(outputs) => {
            let mut attributes = prior.clone();
            // Changed fields without a desired value were dropped from the declaration
            for key in changed {
                if !resolved.contains_key(key) && !outputs.contains_key(key) {
                    attributes.remove(key);
                }
            }
            attributes.extend(resolved);
            attributes.extend(outputs);
            commit(
                ctx,
                record_for(entry, attributes),
                entry.prior_version(),
                ActionType::Update,
                attempts,
            )
            .await
        }
        Err(e) => {
            let tainted = taint(ctx, entry, e.partial.clone()).await;
            TaskOutcome::failed(e, tainted, attempts)
        }
    }
}

async fn delete(ctx: &TaskContext, entry: &ChangeSetEntry) -> TaskOutcome {
    let prior = entry.prior_attributes();
    let what = format!("delete {}", entry.id);
    let (result, attempts) = call_with_retry(&ctx.retry, ctx.call_timeout, &what, || {
        ctx.provider.delete(&entry.id, &prior)
    })
    .await;

    match result {
        Ok(()) => match ctx.store.delete(&ctx.lock, &entry.id).await {
            Ok(_) => TaskOutcome {
                status: EntryStatus::Applied {
                    action: ActionType::Delete,
                },
                outputs: None,
                attempts,
            },
            Err(e) => TaskOutcome::failed(e, false, attempts),
        },
        Err(e) => {
            let tainted = taint(ctx, entry, e.partial.clone()).await;
            TaskOutcome::failed(e, tainted, attempts)
        }
    }
}

async fn create_before_destroy(
    ctx: &TaskContext,
    entry: &ChangeSetEntry,
    resolved: Attributes,
) -> TaskOutcome {
    let prior = entry.prior_attributes();

    let what = format!("create replacement for {}", entry.id);
    let (created, mut attempts) = call_with_retry(&ctx.retry, ctx.call_timeout, &what, || {
        ctx.provider.create(&entry.id, &resolved)
    })
    .await;
    let outputs = match created {
        Ok(outputs) => outputs,
        // The previous object is untouched, so the record stays as it was
        Err(e) => return TaskOutcome::failed(e, false, attempts),
    };

    let mut attributes = resolved;
    attributes.extend(outputs);

    // Track the new instance before the previous one goes away
    let committed = commit(
        ctx,
        record_for(entry, attributes.clone()),
        entry.prior_version(),
        ActionType::Replace,
        attempts,
    )
    .await;
    if !committed.status.is_success() {
        tracing::warn!(
            "Replacement for {} is not tracked; previous instance kept. New attributes: {}",
            entry.id,
            serde_json::to_string(&attributes).unwrap_or_default()
        );
        return committed;
    }

    let what = format!("destroy previous {}", entry.id);
    let (destroyed, delete_attempts) = call_with_retry(&ctx.retry, ctx.call_timeout, &what, || {
        ctx.provider.delete(&entry.id, &prior)
    })
    .await;
    attempts += delete_attempts;

    match destroyed {
        Ok(()) => TaskOutcome {
            attempts,
            ..committed
        },
        Err(e) => {
            tracing::warn!(
                "Previous instance of {} was not destroyed; attributes: {}",
                entry.id,
                serde_json::to_string(&prior).unwrap_or_default()
            );
            TaskOutcome {
                status: EntryStatus::Failed {
                    error: format!(
                        "replacement created but previous instance could not be destroyed: {}",
                        e
                    ),
                    tainted: false,
                },
                outputs: committed.outputs,
                attempts,
            }
        }
    }
}

async fn destroy_before_create(
    ctx: &TaskContext,
    entry: &ChangeSetEntry,
    resolved: Attributes,
) -> TaskOutcome {
    let deleted = delete(ctx, entry).await;
    if !deleted.status.is_success() {
        return deleted;
    }

    let mut outcome = create(ctx, entry, resolved, None).await;
    outcome.attempts += deleted.attempts;
    if let EntryStatus::Applied { action } = &mut outcome.status {
        *action = ActionType::Replace;
    }
    outcome
}
