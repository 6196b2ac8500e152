//! Asynchronous execution with wait, bounded wait and cooperative cancel.
//!
//! ```text
//!            ┌──────────► Done       (finished, with values or an error)
//!  Pending ──┤
//!            └──────────► Cancelled  (cancel acknowledged by the engine)
//! ```
//!
//! Both end states are final. The call runs on a tokio blocking worker when a
//! runtime is current and on a dedicated thread otherwise.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;
use tracing::{debug, error};

use crate::executor::Executor;
use crate::instance::FunctionInstance;
use crate::value::Value;
use crate::WasmEngine;
use wasm_embed_common::RuntimeError;

/// State of an [`AsyncExecution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncState {
    Pending,
    Done,
    Cancelled,
}

struct Slot {
    state: AsyncState,
    result: Option<Result<Vec<Value>, RuntimeError>>,
}

struct Shared {
    slot: Mutex<Slot>,
    finished: Condvar,
    notify: Notify,
    cancel: Arc<AtomicBool>,
    engine: WasmEngine,
}

impl Shared {
    fn new(engine: WasmEngine) -> Self {
        Self {
            slot: Mutex::new(Slot {
                state: AsyncState::Pending,
                result: None,
            }),
            finished: Condvar::new(),
            notify: Notify::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            engine,
        }
    }

    fn finish(&self, result: Result<Vec<Value>, RuntimeError>) {
        let mut slot = self.slot.lock();
        if slot.state != AsyncState::Pending {
            return;
        }

        let cancelled = self.cancel.load(Ordering::Acquire) && result.is_err();
        slot.state = if cancelled {
            AsyncState::Cancelled
        } else {
            AsyncState::Done
        };
        slot.result = Some(result);
        debug!(state = ?slot.state, "Async execution finished");
        drop(slot);

        self.finished.notify_all();
        self.notify.notify_waiters();
    }

    fn state(&self) -> AsyncState {
        self.slot.lock().state
    }
}

/// Handle to a call running on a worker.
///
/// Dropping a pending handle requests cancellation; the worker then finishes
/// on its own.
pub struct AsyncExecution {
    shared: Arc<Shared>,
}

impl AsyncExecution {
    pub(crate) fn spawn(executor: Executor, function: FunctionInstance, params: Vec<Value>) -> Self {
        let shared = Arc::new(Shared::new(executor.engine().clone()));

        let worker = Arc::clone(&shared);
        let job = move || {
            let mut returns = Vec::new();
            let cancel = Some(Arc::clone(&worker.cancel));
            let result = executor
                .invoke_with_cancel(&function, &params, &mut returns, cancel)
                .map(|()| returns);
            worker.finish(result);
        };

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn_blocking(job);
        } else if let Err(e) = std::thread::Builder::new()
            .name("wasm-embed-async".to_string())
            .spawn(job)
        {
            error!(error = %e, "Failed to spawn async worker");
            shared.finish(Err(RuntimeError::Io(e)));
        }

        Self { shared }
    }

    /// Current state, without blocking.
    pub fn state(&self) -> AsyncState {
        self.shared.state()
    }

    /// Block until the execution reaches a final state.
    pub fn wait(&self) {
        let mut slot = self.shared.slot.lock();
        while slot.state == AsyncState::Pending {
            self.shared.finished.wait(&mut slot);
        }
    }

    /// Block for at most `timeout_ms`.
    ///
    /// Returns `true` iff the execution is `Done`. On timeout the execution
    /// keeps running and the state stays `Pending`.
    pub fn wait_for(&self, timeout_ms: u64) -> bool {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut slot = self.shared.slot.lock();
        while slot.state == AsyncState::Pending {
            if self
                .shared
                .finished
                .wait_until(&mut slot, deadline)
                .timed_out()
            {
                break;
            }
        }
        slot.state == AsyncState::Done
    }

    /// Wait without blocking the async runtime.
    pub async fn wait_async(&self) -> AsyncState {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let state = self.state();
            if state != AsyncState::Pending {
                return state;
            }
            notified.await;
        }
    }

    /// Request cooperative termination. A no-op once the execution is final.
    ///
    /// The state becomes `Cancelled` when the engine stops the call at its
    /// next function entry or loop back-edge.
    pub fn cancel(&self) {
        let slot = self.shared.slot.lock();
        if slot.state != AsyncState::Pending {
            return;
        }
        self.shared.cancel.store(true, Ordering::Release);
        drop(slot);

        self.shared.engine.increment_epoch();
        debug!("Async execution cancel requested");
    }

    /// Copy the results into `returns`.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::NotReady`] while pending, [`RuntimeError::Cancelled`]
    /// after cancellation, or the execution's own error if it failed.
    pub fn get(&self, returns: &mut Vec<Value>) -> Result<(), RuntimeError> {
        let slot = self.shared.slot.lock();
        match (slot.state, slot.result.as_ref()) {
            (AsyncState::Pending, _) | (AsyncState::Done, None) => Err(RuntimeError::NotReady),
            (AsyncState::Cancelled, _) => Err(RuntimeError::Cancelled),
            (AsyncState::Done, Some(Ok(values))) => {
                returns.clone_from(values);
                Ok(())
            }
            (AsyncState::Done, Some(Err(err))) => Err(err.clone()),
        }
    }

    /// Number of values the execution returned; 0 if it failed.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::NotReady`] while pending, [`RuntimeError::Cancelled`]
    /// after cancellation.
    pub fn returns_len(&self) -> Result<usize, RuntimeError> {
        let slot = self.shared.slot.lock();
        match (slot.state, slot.result.as_ref()) {
            (AsyncState::Pending, _) => Err(RuntimeError::NotReady),
            (AsyncState::Cancelled, _) => Err(RuntimeError::Cancelled),
            (AsyncState::Done, Some(Ok(values))) => Ok(values.len()),
            (AsyncState::Done, _) => Ok(0),
        }
    }
}

impl Drop for AsyncExecution {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for AsyncExecution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncExecution")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasm_embed_common::Configuration;

    fn pending() -> AsyncExecution {
        let engine = WasmEngine::new(&Configuration::default()).unwrap();
        AsyncExecution {
            shared: Arc::new(Shared::new(engine)),
        }
    }

    #[test]
    fn test_pending_handle() {
        let handle = pending();
        assert_eq!(handle.state(), AsyncState::Pending);
        assert!(!handle.wait_for(0));
        assert!(matches!(handle.get(&mut Vec::new()), Err(RuntimeError::NotReady)));
        assert!(matches!(handle.returns_len(), Err(RuntimeError::NotReady)));
    }

    #[test]
    fn test_done_handle() {
        let handle = pending();
        handle.shared.finish(Ok(vec![Value::I32(3)]));

        handle.wait();
        assert!(handle.wait_for(0));
        assert_eq!(handle.returns_len().unwrap(), 1);

        let mut returns = vec![Value::I64(0), Value::I64(0)];
        handle.get(&mut returns).unwrap();
        assert_eq!(returns, vec![Value::I32(3)]);

        // Cancel on a final handle changes nothing
        handle.cancel();
        assert_eq!(handle.state(), AsyncState::Done);
    }

    #[test]
    fn test_failed_execution_is_done() {
        let handle = pending();
        handle
            .shared
            .finish(Err(RuntimeError::trap("boom", Some("unreachable".to_string()))));

        assert_eq!(handle.state(), AsyncState::Done);
        assert_eq!(handle.returns_len().unwrap(), 0);
        let err = handle.get(&mut Vec::new()).unwrap_err();
        assert_eq!(err.trap_code(), Some("unreachable"));
        // Readable more than once
        assert!(handle.get(&mut Vec::new()).is_err());
    }

    #[test]
    fn test_cancelled_handle() {
        let handle = pending();
        handle.cancel();
        handle
            .shared
            .finish(Err(RuntimeError::trap("interrupted", Some("interrupt".to_string()))));

        assert_eq!(handle.state(), AsyncState::Cancelled);
        assert!(!handle.wait_for(10));
        assert!(matches!(handle.get(&mut Vec::new()), Err(RuntimeError::Cancelled)));
    }

    #[test]
    fn test_cancel_racing_success_is_done() {
        let handle = pending();
        handle.cancel();
        handle.shared.finish(Ok(vec![Value::I32(1)]));

        assert_eq!(handle.state(), AsyncState::Done);
        assert!(handle.wait_for(0));
        let mut returns = Vec::new();
        handle.get(&mut returns).unwrap();
        assert_eq!(returns, vec![Value::I32(1)]);
    }

    #[test]
    fn test_drop_requests_cancel() {
        let handle = pending();
        let shared = Arc::clone(&handle.shared);
        drop(handle);

        assert!(shared.cancel.load(Ordering::Acquire));
        assert_eq!(shared.state(), AsyncState::Pending);
    }

    #[test]
    fn test_wait_async() {
        let handle = pending();
        let shared = Arc::clone(&handle.shared);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            shared.finish(Ok(Vec::new()));
        });

        let state = tokio_test::block_on(handle.wait_async());
        assert_eq!(state, AsyncState::Done);
    }
}
