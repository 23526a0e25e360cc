//! In-process execution runtime standing in for the cluster scheduler.
//!
//! A [`Worker`] runs units of work for one job on tokio tasks. Each unit
//! gets a [`TaskContext`] through which its body reports lines, scopes and
//! variables, hits explicit breakpoints, and issues nested calls. Stops are
//! served by a [`Bridge`](crate::bridge::Bridge) owned by the unit, so a
//! paused unit blocks only its own task.

pub mod context;
pub mod demo;
pub mod frame;

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use tracing::{info, info_span, Instrument};

use crate::bridge::BridgeSettings;
use crate::models::session::SessionKey;
use crate::registry::{JobTable, SessionRegistry};
use crate::{AppError, Result};

pub use self::context::TaskContext;
pub use self::frame::TracedFrame;

/// Future returned by a unit body.
pub type TaskFuture = BoxFuture<'static, Result<Value>>;

/// Per-job runtime options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Job identifier recorded in the job table and in every descriptor.
    pub job_id: String,
    /// Whether explicit breakpoints suspend traced units.
    pub breakpoints_enabled: bool,
    /// Whether a failing traced unit stops at a post-mortem breakpoint.
    pub post_mortem: bool,
}

impl WorkerOptions {
    /// Breakpoints on, post-mortem off.
    #[must_use]
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            breakpoints_enabled: true,
            post_mortem: false,
        }
    }
}

/// Source text a unit reports line numbers against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceListing {
    /// Displayed file path.
    pub file: String,
    /// Line number of the first entry of `lines`.
    pub first_line: u32,
    /// Source lines.
    pub lines: Vec<String>,
}

impl SourceListing {
    /// Build a listing from a block of text starting at `first_line`.
    #[must_use]
    pub fn new(file: impl Into<String>, first_line: u32, text: &str) -> Self {
        Self {
            file: file.into(),
            first_line,
            lines: text.lines().map(str::to_owned).collect(),
        }
    }

    /// Text of line `line`, if it is part of the listing.
    #[must_use]
    pub fn text(&self, line: u32) -> Option<&str> {
        let index = line.checked_sub(self.first_line)?;
        self.lines
            .get(usize::try_from(index).ok()?)
            .map(String::as_str)
    }

    /// Number of the last line in the listing.
    #[must_use]
    pub fn last_line(&self) -> u32 {
        let len = u32::try_from(self.lines.len()).unwrap_or(u32::MAX);
        self.first_line.saturating_add(len).saturating_sub(1)
    }

    /// Render lines `from..=to` with the current line marked by `->`.
    #[must_use]
    pub fn render(&self, from: u32, to: u32, current: u32) -> String {
        let mut out = String::new();
        for number in from.max(self.first_line)..=to.min(self.last_line()) {
            let marker = if number == current { "->" } else { "" };
            let text = self.text(number).unwrap_or_default();
            let _ = writeln!(out, "{number:>4} {marker:<2}\t{text}");
        }
        out
    }
}

/// What to run: a named unit with its source and arguments.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Function name shown in banners and call chains.
    pub name: String,
    /// Source the unit reports lines against.
    pub source: Arc<SourceListing>,
    /// Arguments, shown by `args` and resolvable by `p`.
    pub args: Vec<(String, Value)>,
    /// Untraced units never suspend.
    pub traced: bool,
}

impl TaskSpec {
    /// A traced unit with no arguments.
    #[must_use]
    pub fn new(name: impl Into<String>, source: Arc<SourceListing>) -> Self {
        Self {
            name: name.into(),
            source,
            args: Vec::new(),
            traced: true,
        }
    }

    /// Add an argument.
    #[must_use]
    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.push((name.into(), value.into()));
        self
    }

    /// Disable tracing for this unit.
    #[must_use]
    pub fn untraced(mut self) -> Self {
        self.traced = false;
        self
    }

    /// Call expression, e.g. `fact(n=4)`.
    #[must_use]
    pub fn call_label(&self) -> String {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        format!("{}({})", self.name, args.join(", "))
    }
}

type SharedResult = Shared<BoxFuture<'static, std::result::Result<Value, String>>>;

/// Cloneable handle on a submitted unit's eventual result.
#[derive(Clone)]
pub struct TaskHandle {
    task_id: String,
    label: String,
    result: SharedResult,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task_id", &self.task_id)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl TaskHandle {
    /// Unit identifier.
    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Call expression the unit was submitted with.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Wait for the unit's result.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Task` if the unit failed, panicked or was cancelled.
    pub async fn result(&self) -> Result<Value> {
        self.result.clone().await.map_err(AppError::Task)
    }

    /// Result rendered as reply text.
    pub(crate) fn result_text(&self) -> BoxFuture<'static, String> {
        let result = self.result.clone();
        async move {
            match result.await {
                Ok(value) => value.to_string(),
                Err(err) => format!("error: {err}"),
            }
        }
        .boxed()
    }
}

/// State shared by every unit of one job.
pub(crate) struct Runtime {
    pub(crate) registry: SessionRegistry,
    pub(crate) settings: BridgeSettings,
    pub(crate) options: WorkerOptions,
    next_task: AtomicU64,
}

impl Runtime {
    fn next_task_id(&self) -> String {
        let n = self.next_task.fetch_add(1, Ordering::Relaxed);
        format!("{}-task-{n}", self.options.job_id)
    }
}

/// Spawn one unit. `entry_key` is set when the unit was entered through a
/// descend; the unit then stops on its first line under that key.
pub(crate) fn spawn_unit<B>(
    runtime: Arc<Runtime>,
    spec: TaskSpec,
    body: B,
    entry_key: Option<SessionKey>,
    callers: Vec<String>,
) -> TaskHandle
where
    B: FnOnce(TaskContext) -> TaskFuture + Send + 'static,
{
    let task_id = runtime.next_task_id();
    let label = spec.call_label();
    let span = info_span!("unit", task_id = %task_id, call = %label);
    let ctx = TaskContext::new(runtime, spec, task_id.clone(), entry_key, callers);

    let join = tokio::spawn(
        async move {
            let result = body(ctx.clone()).await;
            ctx.finish(result).await
        }
        .instrument(span),
    );

    let result = async move {
        match join.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(err.to_string()),
            Err(err) => Err(format!("unit did not complete: {err}")),
        }
    }
    .boxed()
    .shared();

    TaskHandle {
        task_id,
        label,
        result,
    }
}

/// Runs units of work for one job.
#[derive(Clone)]
pub struct Worker {
    runtime: Arc<Runtime>,
    jobs: JobTable,
}

impl Worker {
    /// Register the job and start accepting units.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StoreUnavailable` if the job cannot be registered.
    pub async fn start(
        registry: SessionRegistry,
        settings: BridgeSettings,
        options: WorkerOptions,
    ) -> Result<Self> {
        let jobs = JobTable::new(registry.store());
        jobs.register(&options.job_id, std::process::id()).await?;
        info!(
            job_id = %options.job_id,
            advertised_host = %settings.advertised_host,
            breakpoints = options.breakpoints_enabled,
            post_mortem = options.post_mortem,
            "worker started"
        );
        Ok(Self {
            runtime: Arc::new(Runtime {
                registry,
                settings,
                options,
                next_task: AtomicU64::new(1),
            }),
            jobs,
        })
    }

    /// Job this worker runs units for.
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.runtime.options.job_id
    }

    /// Session registry the worker's bridges publish to.
    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.runtime.registry
    }

    /// Run `body` as a new top-level unit.
    pub fn submit<B>(&self, spec: TaskSpec, body: B) -> TaskHandle
    where
        B: FnOnce(TaskContext) -> TaskFuture + Send + 'static,
    {
        spawn_unit(Arc::clone(&self.runtime), spec, body, None, Vec::new())
    }

    /// Mark the job finished so its leftover sessions become reapable.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StoreUnavailable` on directory failure.
    pub async fn finish(&self) -> Result<()> {
        self.jobs.mark_finished(self.job_id()).await.map(|_| ())
    }
}
