//! One-shot readiness gate.
//!
//! Work submitted before the host signals readiness is buffered in submission
//! order and run exactly once when [`ReadinessGate::open`] is called. Work
//! submitted afterwards runs immediately on the caller's thread.

use std::{
    collections::VecDeque,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Mutex, MutexGuard, OnceLock, PoisonError},
};

use tokio::sync::oneshot;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// How a submission was dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The gate was open and the task already ran.
    Immediate,
    /// The task is buffered until the gate opens.
    Buffered,
}

#[derive(Default)]
struct GateState {
    open: bool,
    flushing: bool,
    buffer: VecDeque<Task>,
}

/// Buffered one-shot dispatch gate.
#[derive(Default)]
pub struct ReadinessGate {
    state: Mutex<GateState>,
}

impl ReadinessGate {
    /// Create a closed gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a gate that is already open.
    #[must_use]
    pub fn opened() -> Self {
        Self {
            state: Mutex::new(GateState {
                open: true,
                ..GateState::default()
            }),
        }
    }

    /// The process-wide gate.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<ReadinessGate> = OnceLock::new();
        GLOBAL.get_or_init(Self::new)
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the gate has opened and finished flushing.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        let state = self.lock();
        state.open && !state.flushing
    }

    /// Run `task` now if the gate is open, otherwise buffer it.
    ///
    /// Tasks submitted while the buffer is being flushed join the end of the
    /// buffer, so ordering across submissions is preserved.
    pub fn submit<F>(&self, task: F) -> Dispatch
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.lock();
            if !state.open || state.flushing {
                state.buffer.push_back(Box::new(task));
                return Dispatch::Buffered;
            }
        }
        task();
        Dispatch::Immediate
    }

    /// Open the gate and run buffered tasks in order. Panics raised by a
    /// buffered task are logged; nobody awaits the gate itself. Opening an
    /// open gate does nothing.
    pub fn open(&self) {
        {
            let mut state = self.lock();
            if state.open {
                return;
            }
            state.open = true;
            state.flushing = true;
        }

        let mut flushed = 0usize;
        loop {
            let batch = {
                let mut state = self.lock();
                if state.buffer.is_empty() {
                    state.flushing = false;
                    break;
                }
                std::mem::take(&mut state.buffer)
            };
            for task in batch {
                flushed += 1;
                if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(ToString::to_string)
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!(error = %message, "error in queued function");
                }
            }
        }
        tracing::debug!(flushed, "readiness gate opened");
    }

    /// Resolve once the gate has opened and everything submitted before this
    /// call has run.
    pub async fn wait(&self) {
        let (tx, rx) = oneshot::channel();
        self.submit(move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }
}
