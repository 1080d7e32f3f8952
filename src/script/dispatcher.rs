//! Runs script entry points for requests.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mlua::{Function, Value};
use tracing::{debug, warn};

use super::compiler::normalize_path;
use super::context::{RequestContext, Response};
use super::engine::Interpreter;
use super::runtime::Runtime;
use crate::db::ExtensionKind;
use crate::{CastroError, Result};

/// Entry point of widget scripts.
pub const WIDGET_ENTRY: &str = "widget";

const RUNNING: u8 = 0;
const FINISHED: u8 = 1;
const ABANDONED: u8 = 2;

/// Dispatches requests to pooled interpreters.
#[derive(Clone)]
pub struct Dispatcher {
    runtime: Arc<Runtime>,
}

impl Dispatcher {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Run the entry point of `path` for one request.
    ///
    /// Pages run the global named after the lowercased HTTP method, widgets
    /// run `widget`. The interpreter goes back to the pool whether or not the
    /// script failed. Blocks, so call it from a worker thread.
    pub fn run(&self, path: &str, ctx: RequestContext) -> Result<Response> {
        self.run_tracked(path, ctx, None)
    }

    /// [`run`](Self::run) on the blocking thread pool.
    pub async fn run_blocking(&self, path: &str, ctx: RequestContext) -> Result<Response> {
        let dispatcher = self.clone();
        let path = path.to_string();
        tokio::task::spawn_blocking(move || dispatcher.run(&path, ctx))
            .await
            .map_err(|e| CastroError::Script(format!("dispatch task failed: {e}")))?
    }

    /// [`run`](Self::run) with a deadline.
    ///
    /// Scripts cannot be interrupted, so on timeout the dispatch keeps
    /// running in the background. Its interpreter is then discarded instead
    /// of being checked back in.
    pub async fn run_with_deadline(
        &self,
        path: &str,
        ctx: RequestContext,
        timeout: Duration,
    ) -> Result<Response> {
        let state = Arc::new(AtomicU8::new(RUNNING));
        let dispatcher = self.clone();
        let owned_path = path.to_string();
        let task_state = Arc::clone(&state);
        let mut task = tokio::task::spawn_blocking(move || {
            dispatcher.run_tracked(&owned_path, ctx, Some(&task_state))
        });

        let joined = match tokio::time::timeout(timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                if state
                    .compare_exchange(RUNNING, ABANDONED, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    warn!("Dispatch of {} exceeded {:?}", path, timeout);
                    return Err(CastroError::Timeout(format!("{path} after {timeout:?}")));
                }
                // Finished right at the deadline.
                task.await
            }
        };
        joined.map_err(|e| CastroError::Script(format!("dispatch task failed: {e}")))?
    }

    fn run_tracked(
        &self,
        path: &str,
        ctx: RequestContext,
        state: Option<&AtomicU8>,
    ) -> Result<Response> {
        let pool = self.runtime.pool();
        let interpreter = pool.checkout(path)?;
        let result = execute(&interpreter, path, ctx);

        let abandoned = state.is_some_and(|s| {
            s.compare_exchange(RUNNING, FINISHED, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        });
        if abandoned {
            pool.discard(interpreter);
        } else {
            pool.checkin(interpreter, path);
        }
        result
    }
}

fn entry_point(path: &str, ctx: &RequestContext) -> String {
    match ExtensionKind::of_path(&normalize_path(path)) {
        Some(ExtensionKind::Widget) => WIDGET_ENTRY.to_string(),
        _ => ctx.entry_point(),
    }
}

fn execute(interpreter: &Interpreter, path: &str, ctx: RequestContext) -> Result<Response> {
    let entry = entry_point(path, &ctx);
    let lua = interpreter.lua();
    let script_error = |e: mlua::Error| CastroError::Script(format!("{path}: {e}"));

    let function: Option<Function> = lua.globals().get(entry.as_str()).map_err(script_error)?;
    let function = function.ok_or_else(|| {
        CastroError::Script(format!("{path} has no '{entry}' entry point"))
    })?;

    let ctx = lua.create_userdata(ctx).map_err(script_error)?;
    let returned: Value = interpreter
        .guarded(|_| function.call(ctx.clone()))
        .map_err(script_error)?;
    let mut ctx = ctx.take::<RequestContext>().map_err(script_error)?;

    if let Value::String(text) = returned {
        ctx.write(&text.to_str().map_err(script_error)?);
    }

    debug!(
        "Ran {}:{} on interpreter {}",
        interpreter.path(),
        entry,
        interpreter.id()
    );
    Ok(ctx.into_response())
}
