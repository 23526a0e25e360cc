//! Snapshot of a paused unit answering inspection commands.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use super::context::Scope;
use super::{SourceListing, TaskHandle, TaskSpec};
use crate::bridge::Frame;
use crate::models::session::BreakpointLocation;
use crate::protocol::Command;

/// Lines shown on each side of the current line by `list`.
const LIST_CONTEXT: u32 = 5;

/// Frame captured when a traced unit stops.
#[derive(Debug, Clone)]
pub struct TracedFrame {
    source: Arc<SourceListing>,
    function: String,
    line: u32,
    callers: Vec<String>,
    args: Vec<(String, Value)>,
    locals: BTreeMap<String, Value>,
    last_call: Option<TaskHandle>,
}

impl TracedFrame {
    pub(crate) fn capture(
        spec: &TaskSpec,
        callers: &[String],
        scopes: &[Scope],
        last_call: Option<TaskHandle>,
    ) -> Self {
        let mut chain = callers.to_vec();
        let (function, line, locals) = match scopes.split_last() {
            Some((innermost, outer)) => {
                chain.extend(
                    outer
                        .iter()
                        .map(|scope| format!("{}({}){}()", spec.source.file, scope.line, scope.function)),
                );
                (
                    innermost.function.clone(),
                    innermost.line,
                    innermost.locals.clone(),
                )
            }
            None => (spec.name.clone(), spec.source.first_line, BTreeMap::new()),
        };
        Self {
            source: Arc::clone(&spec.source),
            function,
            line,
            callers: chain,
            args: spec.args.clone(),
            locals,
            last_call,
        }
    }

    fn position(&self) -> String {
        format!("{}({}){}()", self.source.file, self.line, self.function)
    }

    fn lookup(&self, name: &str) -> Option<&Value> {
        self.locals.get(name).or_else(|| {
            self.args
                .iter()
                .find(|(arg, _)| arg == name)
                .map(|(_, value)| value)
        })
    }
}

impl Frame for TracedFrame {
    fn location(&self) -> BreakpointLocation {
        BreakpointLocation {
            file: self.source.file.clone(),
            line: self.line,
            function: self.function.clone(),
        }
    }

    fn banner(&self) -> String {
        let text = self.source.text(self.line).unwrap_or_default().trim();
        format!("> {}\n-> {text}\n", self.position())
    }

    fn dispatch(&mut self, command: &Command) -> String {
        match command {
            Command::List => self.source.render(
                self.line.saturating_sub(LIST_CONTEXT),
                self.line.saturating_add(LIST_CONTEXT),
                self.line,
            ),
            Command::LongList => {
                self.source
                    .render(self.source.first_line, self.source.last_line(), self.line)
            }
            Command::Where => {
                let mut out = String::new();
                for caller in &self.callers {
                    let _ = writeln!(out, "  {caller}");
                }
                let _ = writeln!(out, "> {}", self.position());
                out
            }
            Command::Args => {
                let mut out = String::new();
                for (name, value) in &self.args {
                    let _ = writeln!(out, "{name} = {value}");
                }
                out
            }
            Command::Print(name) => match self.lookup(name) {
                Some(value) => format!("{value}\n"),
                None => format!("*** NameError: name '{name}' is not defined\n"),
            },
            _ => String::new(),
        }
    }

    fn pending_result(&self) -> Option<BoxFuture<'static, String>> {
        self.last_call.as_ref().map(TaskHandle::result_text)
    }
}
