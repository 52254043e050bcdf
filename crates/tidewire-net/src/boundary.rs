//! Panic boundaries around handler code.
//!
//! Every place that runs application callbacks (queue consumer, pool worker,
//! per-connection loops) goes through one of these helpers so a panicking
//! handler is reported instead of tearing down its thread or task.

use std::{
    any::Any,
    future::Future,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use futures_util::FutureExt;
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::error;

/// Receives the message of a recovered panic.
pub type PanicHandler = Arc<dyn Fn(String) + Send + Sync>;

/// A handler that logs the panic under `context`.
pub fn log_panics(context: &'static str) -> PanicHandler {
    Arc::new(move |msg| error!(context, panic = %msg, "recovered panic"))
}

/// Best-effort extraction of a panic payload's message.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Run `f`, converting a panic into `Err(message)`.
pub fn guard<R>(f: impl FnOnce() -> R) -> Result<R, String> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_message(&*payload))
}

/// Run `f`, reporting a panic to `on_panic`.
pub fn run_guarded(on_panic: &PanicHandler, f: impl FnOnce()) {
    if let Err(msg) = guard(f) {
        on_panic(msg);
    }
}

/// Spawn `fut` on `runtime`; a panic inside it is passed to `on_panic`.
pub fn spawn_guarded<F>(
    runtime: &Handle,
    fut: F,
    on_panic: impl FnOnce(String) + Send + 'static,
) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    runtime.spawn(async move {
        if let Err(payload) = AssertUnwindSafe(fut).catch_unwind().await {
            on_panic(panic_message(&*payload));
        }
    })
}
