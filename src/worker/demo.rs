//! Demo workloads exercising breakpoints, stepping and descend.

use std::sync::{Arc, OnceLock};

use futures_util::FutureExt;
use serde_json::{json, Value};

use super::{SourceListing, TaskContext, TaskFuture, TaskHandle, TaskSpec, Worker};
use crate::{AppError, Result};

const FACTORIAL_SOURCE: &str = "\
fn fact(n: u64) -> u64 {
    if n < 1 {
        return 1;
    }
    breakpoint();
    let inner = spawn(fact, n - 1);
    n * get(inner)
}";

const COMMANDS_SOURCE: &str = "\
fn commands() -> u64 {
    let i = 1;
    breakpoint();
    println!(\"We support unicode too: 🐛\");
    i + 1
}";

const STEPPING_SOURCE: &str = "\
fn stepping() -> u64 {
    breakpoint();
    let x = helper(1);
    let y = x + 1;
    y * 2
}

fn helper(a: u64) -> u64 {
    let b = a + 10;
    b
}";

fn listing(cell: &'static OnceLock<Arc<SourceListing>>, file: &str, text: &str) -> Arc<SourceListing> {
    Arc::clone(cell.get_or_init(|| Arc::new(SourceListing::new(file, 1, text))))
}

fn factorial_source() -> Arc<SourceListing> {
    static CELL: OnceLock<Arc<SourceListing>> = OnceLock::new();
    listing(&CELL, "demos/factorial.rs", FACTORIAL_SOURCE)
}

fn as_count(value: &Value) -> Result<u64> {
    value
        .as_u64()
        .ok_or_else(|| AppError::Task(format!("expected an unsigned integer, got {value}")))
}

/// Spec of `fact(n)`.
#[must_use]
pub fn factorial_spec(n: u64) -> TaskSpec {
    TaskSpec::new("fact", factorial_source()).arg("n", n)
}

/// Recursive factorial: each level hits a breakpoint and computes the next
/// level through a nested call.
pub fn factorial(ctx: TaskContext, n: u64) -> TaskFuture {
    async move {
        if n < 1 {
            return Ok(json!(1));
        }
        ctx.line(5).await?;
        ctx.breakpoint().await?;
        ctx.line(6).await?;
        let inner = ctx
            .call(factorial_spec(n - 1), move |nested| factorial(nested, n - 1))
            .await?;
        ctx.set_local("inner", inner.task_id()).await;
        ctx.line(7).await?;
        let below = as_count(&ctx.get(&inner).await?)?;
        let product = n
            .checked_mul(below)
            .ok_or_else(|| AppError::Task(format!("fact({n}) overflows u64")))?;
        Ok(json!(product))
    }
    .boxed()
}

/// Submit `fact(n)` as a top-level unit.
pub fn submit_factorial(worker: &Worker, n: u64) -> TaskHandle {
    worker.submit(factorial_spec(n), move |ctx| factorial(ctx, n))
}

/// Spec of the inspection demo.
#[must_use]
pub fn commands_spec() -> TaskSpec {
    static CELL: OnceLock<Arc<SourceListing>> = OnceLock::new();
    TaskSpec::new("commands", listing(&CELL, "demos/commands.rs", COMMANDS_SOURCE))
}

/// Single breakpoint followed by non-ASCII source text.
pub fn commands(ctx: TaskContext) -> TaskFuture {
    async move {
        ctx.line(2).await?;
        let i = 1_u64;
        ctx.set_local("i", i).await;
        ctx.line(3).await?;
        ctx.breakpoint().await?;
        ctx.line(4).await?;
        ctx.line(5).await?;
        Ok(json!(i + 1))
    }
    .boxed()
}

/// Submit the inspection demo.
pub fn submit_commands(worker: &Worker) -> TaskHandle {
    worker.submit(commands_spec(), commands)
}

/// Spec of the stepping demo.
#[must_use]
pub fn stepping_spec() -> TaskSpec {
    static CELL: OnceLock<Arc<SourceListing>> = OnceLock::new();
    TaskSpec::new("stepping", listing(&CELL, "demos/stepping.rs", STEPPING_SOURCE))
}

/// Breakpoint followed by a helper call, for `next`, `step` and `return`.
pub fn stepping(ctx: TaskContext) -> TaskFuture {
    async move {
        ctx.line(2).await?;
        ctx.breakpoint().await?;
        ctx.line(3).await?;
        let x = helper(&ctx, 1).await?;
        ctx.set_local("x", x).await;
        ctx.line(4).await?;
        let y = x + 1;
        ctx.set_local("y", y).await;
        ctx.line(5).await?;
        Ok(json!(y * 2))
    }
    .boxed()
}

async fn helper(ctx: &TaskContext, a: u64) -> Result<u64> {
    ctx.enter("helper").await;
    ctx.set_local("a", a).await;
    ctx.line(9).await?;
    let b = a + 10;
    ctx.set_local("b", b).await;
    ctx.line(10).await?;
    ctx.leave().await;
    Ok(b)
}

/// Submit the stepping demo.
pub fn submit_stepping(worker: &Worker) -> TaskHandle {
    worker.submit(stepping_spec(), stepping)
}
