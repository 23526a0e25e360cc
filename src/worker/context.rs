//! Execution context handed to every unit body.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::frame::TracedFrame;
use super::{spawn_unit, Runtime, TaskFuture, TaskHandle, TaskSpec};
use crate::bridge::{Bridge, Frame, Resume, StepKind, StopReason};
use crate::models::session::{SessionIdentity, SessionKey};
use crate::Result;

/// How the unit runs until its next stop.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RunMode {
    /// Only explicit breakpoints stop.
    Free,
    /// Stop at the next line at or above `depth`.
    StepNext { depth: usize },
    /// Stop at the very next line.
    StepInto,
    /// Stop at the first line after scope `depth` returns.
    StepOut { depth: usize },
    /// Stop at the next nested call, which runs under the successor key.
    Descend(SessionKey),
}

/// One active function scope of the unit.
#[derive(Debug, Clone)]
pub(crate) struct Scope {
    pub(crate) function: String,
    pub(crate) line: u32,
    pub(crate) locals: BTreeMap<String, Value>,
}

struct UnitState {
    scopes: Vec<Scope>,
    mode: RunMode,
    session: Option<Bridge>,
    entry_key: Option<SessionKey>,
    last_call: Option<TaskHandle>,
    stopped_here: bool,
    detached: bool,
}

impl UnitState {
    fn depth(&self) -> usize {
        self.scopes.len()
    }

    fn current(&mut self) -> Option<&mut Scope> {
        self.scopes.last_mut()
    }
}

struct Unit {
    runtime: Arc<Runtime>,
    spec: TaskSpec,
    identity: SessionIdentity,
    callers: Vec<String>,
    state: Mutex<UnitState>,
}

/// Handle a unit body uses to report progress and hit breakpoints.
#[derive(Clone)]
pub struct TaskContext {
    unit: Arc<Unit>,
}

impl TaskContext {
    pub(super) fn new(
        runtime: Arc<Runtime>,
        spec: TaskSpec,
        task_id: String,
        entry_key: Option<SessionKey>,
        callers: Vec<String>,
    ) -> Self {
        let mode = if entry_key.is_some() {
            RunMode::StepInto
        } else {
            RunMode::Free
        };
        let root = Scope {
            function: spec.name.clone(),
            line: spec.source.first_line,
            locals: BTreeMap::new(),
        };
        let identity = SessionIdentity {
            job_id: runtime.options.job_id.clone(),
            task_id,
        };
        Self {
            unit: Arc::new(Unit {
                runtime,
                spec,
                identity,
                callers,
                state: Mutex::new(UnitState {
                    scopes: vec![root],
                    mode,
                    session: None,
                    entry_key,
                    last_call: None,
                    stopped_here: false,
                    detached: false,
                }),
            }),
        }
    }

    /// Identifier of this unit.
    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.unit.identity.task_id
    }

    /// Argument passed to this unit, if any.
    #[must_use]
    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.unit
            .spec
            .args
            .iter()
            .find(|(arg, _)| arg == name)
            .map(|(_, value)| value)
    }

    /// Trace hook: the unit is about to execute `line`.
    ///
    /// # Errors
    ///
    /// Propagates a failure to open the debug session for this stop.
    pub async fn line(&self, line: u32) -> Result<()> {
        let mut state = self.unit.state.lock().await;
        state.stopped_here = false;
        if let Some(scope) = state.current() {
            scope.line = line;
        }
        if !self.unit.spec.traced || state.detached {
            return Ok(());
        }

        let depth = state.depth();
        let stop = match state.mode {
            RunMode::Free | RunMode::Descend(_) => false,
            RunMode::StepInto => true,
            RunMode::StepNext { depth: at } => depth <= at,
            RunMode::StepOut { depth: at } => depth < at,
        };
        if stop {
            self.stop(&mut state, StopReason::Step).await?;
            state.stopped_here = true;
        }
        Ok(())
    }

    /// Enter a nested scope of this unit.
    pub async fn enter(&self, function: &str) {
        let mut state = self.unit.state.lock().await;
        let line = state.current().map_or(self.unit.spec.source.first_line, |s| s.line);
        state.scopes.push(Scope {
            function: function.to_owned(),
            line,
            locals: BTreeMap::new(),
        });
    }

    /// Leave the innermost nested scope. The unit's root scope is never left.
    pub async fn leave(&self) {
        let mut state = self.unit.state.lock().await;
        if state.scopes.len() > 1 {
            state.scopes.pop();
        }
    }

    /// Record a local variable in the innermost scope.
    pub async fn set_local(&self, name: &str, value: impl Into<Value>) {
        let mut state = self.unit.state.lock().await;
        if let Some(scope) = state.current() {
            scope.locals.insert(name.to_owned(), value.into());
        }
    }

    /// Explicit breakpoint. Suspends until a debugger client resumes the
    /// unit; a no-op for untraced units, when breakpoints are disabled, or
    /// when a step already stopped on this line.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ListenerBindFailed` or a registry error when the
    /// session cannot be opened. Only this breakpoint hit is affected.
    pub async fn breakpoint(&self) -> Result<()> {
        if !self.unit.spec.traced || !self.unit.runtime.options.breakpoints_enabled {
            return Ok(());
        }
        let mut state = self.unit.state.lock().await;
        if state.stopped_here || state.detached {
            return Ok(());
        }
        self.stop(&mut state, StopReason::Breakpoint).await?;
        state.stopped_here = true;
        Ok(())
    }

    /// Issue a nested call. If a descend is pending, the nested unit stops
    /// on its first line under the successor key and this unit stops until
    /// the client is handed over.
    ///
    /// # Errors
    ///
    /// Propagates a failure to serve the descend stop.
    pub async fn call<B>(&self, spec: TaskSpec, body: B) -> Result<TaskHandle>
    where
        B: FnOnce(TaskContext) -> TaskFuture + Send + 'static,
    {
        let mut state = self.unit.state.lock().await;
        let entry_key = match &state.mode {
            RunMode::Descend(key) => Some(key.clone()),
            _ => None,
        };
        let call = spec.call_label();
        let mut callers = self.unit.callers.clone();
        callers.extend(state.scopes.iter().map(|scope| self.caller_entry(scope)));

        let handle = spawn_unit(
            Arc::clone(&self.unit.runtime),
            spec,
            body,
            entry_key.clone(),
            callers,
        );
        debug!(nested = %handle.task_id(), %call, "nested call issued");
        state.last_call = Some(handle.clone());

        if let Some(successor) = entry_key {
            state.mode = RunMode::Free;
            self.stop(&mut state, StopReason::Descended { successor, call })
                .await?;
            state.stopped_here = true;
        }
        Ok(handle)
    }

    /// Wait for a nested call's result.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Task` if the nested unit failed.
    pub async fn get(&self, handle: &TaskHandle) -> Result<Value> {
        debug!(task_id = %self.task_id(), nested = %handle.task_id(), "awaiting nested result");
        handle.result().await
    }

    fn caller_entry(&self, scope: &Scope) -> String {
        format!(
            "{}({}){}()",
            self.unit.spec.source.file, scope.line, scope.function
        )
    }

    async fn stop(&self, state: &mut UnitState, reason: StopReason) -> Result<()> {
        let mut frame = TracedFrame::capture(
            &self.unit.spec,
            &self.unit.callers,
            &state.scopes,
            state.last_call.clone(),
        );

        if state.session.is_none() {
            let bridge = Bridge::publish(
                self.unit.runtime.registry.clone(),
                self.unit.runtime.settings.clone(),
                &self.unit.identity,
                frame.location(),
                state.entry_key.take(),
            )
            .await?;
            state.session = Some(bridge);
        }
        let Some(bridge) = state.session.as_mut() else {
            return Ok(());
        };

        let resume = bridge.stop(&mut frame, reason).await?;
        self.resume(state, resume).await;
        Ok(())
    }

    async fn resume(&self, state: &mut UnitState, resume: Resume) {
        let depth = state.depth();
        let quit = resume == Resume::Quit;
        state.mode = match resume {
            Resume::Continue | Resume::Quit | Resume::Disconnected => {
                state.detached |= quit;
                if let Some(bridge) = state.session.take() {
                    if let Err(err) = bridge.terminate(None).await {
                        warn!(%err, "could not remove session entry; the reaper will collect it");
                    }
                }
                RunMode::Free
            }
            Resume::Step(StepKind::Next) => RunMode::StepNext { depth },
            Resume::Step(StepKind::Into) => RunMode::StepInto,
            Resume::Step(StepKind::Out) => RunMode::StepOut { depth },
            Resume::Descend(key) => RunMode::Descend(key),
        };
    }

    /// Post-mortem stop and session teardown once the body has returned.
    pub(super) async fn finish(&self, result: Result<Value>) -> Result<Value> {
        let mut state = self.unit.state.lock().await;

        if let Err(err) = &result {
            if self.unit.runtime.options.post_mortem && self.unit.spec.traced && !state.detached
            {
                if let Err(stop_err) = self
                    .stop(&mut state, StopReason::PostMortem(err.to_string()))
                    .await
                {
                    warn!(%stop_err, "post-mortem session failed");
                }
            }
        }

        if let Some(bridge) = state.session.take() {
            let note = if matches!(state.mode, RunMode::Descend(_)) {
                "*** unit finished without issuing a nested call\n".to_owned()
            } else {
                match &result {
                    Ok(value) => format!("*** task returned {value}\n"),
                    Err(err) => format!("*** task failed: {err}\n"),
                }
            };
            if let Err(err) = bridge.terminate(Some(&note)).await {
                warn!(%err, "could not remove session entry; the reaper will collect it");
            }
        }
        result
    }
}
