//! Single-flight FIFO command queue.
//!
//! Commands run strictly one at a time in the order they were enqueued. When
//! a command fails, every command behind it that has not started is failed
//! with a [`DrainError`](crate::error::DrainError) wrapping the original
//! failure, up to the next checkpoint barrier.

use std::{
    collections::VecDeque,
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
};

use futures::{FutureExt, future::BoxFuture};
use tokio::sync::oneshot;

use crate::error::CommandError;

/// Type-erased queued action together with the resolver of its future.
trait Job: Send {
    /// Run the action and settle its future. The error is handed back so the
    /// queue can drain.
    fn run(self: Box<Self>) -> BoxFuture<'static, Result<(), CommandError>>;

    /// Settle the future with `err` without running the action.
    fn reject(self: Box<Self>, err: CommandError);
}

struct Queued<F, V> {
    action: F,
    tx: oneshot::Sender<Result<V, CommandError>>,
}

impl<F, Fut, V> Job for Queued<F, V>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<V, CommandError>> + Send + 'static,
    V: Send + 'static,
{
    fn run(self: Box<Self>) -> BoxFuture<'static, Result<(), CommandError>> {
        let Self { action, tx } = *self;
        Box::pin(async move {
            match action().await {
                Ok(value) => {
                    let _ = tx.send(Ok(value));
                    Ok(())
                }
                Err(err) => {
                    let _ = tx.send(Err(err.clone()));
                    Err(err)
                }
            }
        })
    }

    fn reject(self: Box<Self>, err: CommandError) {
        let _ = self.tx.send(Err(err));
    }
}

enum Entry {
    Command(Box<dyn Job>),
    Barrier(oneshot::Sender<Result<(), CommandError>>),
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<Entry>,
    running: bool,
    /// Set by `halt`, cleared by the next push or started command.
    halted: bool,
}

impl QueueState {
    /// Fail pending commands up to and including the next barrier, which
    /// settles successfully. Returns the number of failed commands.
    fn drain(&mut self, cause: Option<CommandError>) -> usize {
        if self.entries.is_empty() {
            return 0;
        }

        let err = CommandError::drained(cause);
        let mut drained = 0;
        while let Some(entry) = self.entries.pop_front() {
            match entry {
                Entry::Command(job) => {
                    job.reject(err.clone());
                    drained += 1;
                }
                Entry::Barrier(tx) => {
                    let _ = tx.send(Ok(()));
                    break;
                }
            }
        }
        drained
    }
}

struct Inner {
    label: String,
    state: Mutex<QueueState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule_digest(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(inner.digest());
    }

    async fn digest(self: Arc<Self>) {
        loop {
            let job = {
                let mut state = self.lock();
                if state.running {
                    return;
                }
                match state.entries.pop_front() {
                    None => return,
                    Some(Entry::Barrier(tx)) => {
                        tracing::debug!(queue = %self.label, "checkpoint reached");
                        let _ = tx.send(Ok(()));
                        continue;
                    }
                    Some(Entry::Command(job)) => {
                        state.running = true;
                        state.halted = false;
                        job
                    }
                }
            };

            tracing::debug!(queue = %self.label, "command started");
            let outcome = match AssertUnwindSafe(job.run()).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::error!(queue = %self.label, "command panicked");
                    Err(CommandError::Abandoned)
                }
            };

            {
                let mut state = self.lock();
                state.running = false;
                if let Err(err) = outcome {
                    let drained = state.drain(Some(err.clone()));
                    tracing::warn!(
                        queue = %self.label,
                        error = %err,
                        drained,
                        "command failed; draining queue"
                    );
                } else {
                    tracing::debug!(queue = %self.label, pending = state.entries.len(), "command settled");
                }
            }

            // Give other tasks a turn before the next command.
            tokio::task::yield_now().await;
        }
    }
}

/// Ordered, single-flight queue of commands for one session.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct CommandQueue {
    inner: Arc<Inner>,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new("queue")
    }
}

impl CommandQueue {
    /// Create an empty queue. `label` tags this queue's log events.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                label: label.into(),
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Append a command. The returned future settles with the action's result
    /// once every earlier command has settled and the action has run.
    ///
    /// Never blocks; the action does not start before this returns.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime while the queue is idle.
    pub fn enqueue<F, Fut, V>(&self, action: F) -> CommandFuture<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, CommandError>> + Send + 'static,
        V: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.push(Entry::Command(Box::new(Queued { action, tx })));
        CommandFuture::new(rx)
    }

    /// Append a barrier. It settles successfully when reached in order, and
    /// stops any drain that reaches it.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime while the queue is idle.
    pub fn checkpoint(&self) -> CommandFuture<()> {
        let (tx, rx) = oneshot::channel();
        self.push(Entry::Barrier(tx));
        CommandFuture::new(rx)
    }

    /// Fail every pending command with a drain error wrapping `cause`,
    /// stopping at the first barrier. The command in flight, if any, is not
    /// interrupted. Returns the number of failed commands.
    ///
    /// Repeating a halt before anything is enqueued or started does nothing.
    pub fn halt(&self, cause: Option<CommandError>) -> usize {
        let (drained, resume) = {
            let mut state = self.inner.lock();
            if state.halted {
                return 0;
            }
            let drained = state.drain(cause);
            state.halted = true;
            (drained, !state.running && !state.entries.is_empty())
        };
        if drained > 0 {
            tracing::warn!(queue = %self.inner.label, drained, "queue halted");
        }
        if resume {
            self.inner.schedule_digest();
        }
        drained
    }

    /// Number of entries waiting to start.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether no entries are waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Whether a command is currently executing.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    fn push(&self, entry: Entry) {
        let start = {
            let mut state = self.inner.lock();
            state.entries.push_back(entry);
            state.halted = false;
            state.entries.len() == 1 && !state.running
        };
        if start {
            self.inner.schedule_digest();
        }
    }
}

/// Future of a queued command's outcome.
#[must_use = "futures do nothing unless polled"]
pub struct CommandFuture<V> {
    rx: oneshot::Receiver<Result<V, CommandError>>,
}

impl<V> CommandFuture<V> {
    const fn new(rx: oneshot::Receiver<Result<V, CommandError>>) -> Self {
        Self { rx }
    }
}

impl<V> Future for CommandFuture<V> {
    type Output = Result<V, CommandError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(CommandError::Abandoned)))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use tokio_test::{assert_err, assert_ok, assert_pending};

    use super::*;
    use crate::error::{DRAIN_MESSAGE, RemoteError};

    fn boom() -> CommandError {
        RemoteError::new("boom").with_stack("at boom (page.js:1)").into()
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_with_independent_delays() {
        let queue = CommandQueue::new("fifo");
        let log = Arc::new(Mutex::new(Vec::new()));

        let delays = [30u64, 5, 20, 0, 10];
        let futures: Vec<_> = delays
            .iter()
            .enumerate()
            .map(|(i, &ms)| {
                let log = Arc::clone(&log);
                queue.enqueue(move || async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    log.lock().unwrap().push(i);
                    Ok(i)
                })
            })
            .collect();

        for (i, fut) in futures.into_iter().enumerate() {
            assert_eq!(fut.await.unwrap(), i);
        }
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight() {
        let queue = CommandQueue::new("single-flight");
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let futures: Vec<_> = (0..20u64)
            .map(|i| {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                queue.enqueue(move || async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(i % 3)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();

        for fut in futures {
            assert_ok!(fut.await);
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_enqueue_does_not_start_action_synchronously() {
        let queue = CommandQueue::new("lazy");
        let started = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&started);

        let mut fut = tokio_test::task::spawn(queue.enqueue(move || async move {
            flag.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        }));

        assert_eq!(started.load(Ordering::SeqCst), 0);
        assert_pending!(fut.poll());
        assert_eq!(fut.await.unwrap(), 7);
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drain_stops_at_barrier() {
        let queue = CommandQueue::new("drain");
        let ran = Arc::new(Mutex::new(Vec::new()));

        let a = queue.enqueue(|| async { Err::<(), _>(boom()) });
        let b = {
            let ran = Arc::clone(&ran);
            queue.enqueue(move || async move {
                ran.lock().unwrap().push("b");
                Ok(())
            })
        };
        let checkpoint = queue.checkpoint();
        let c = {
            let ran = Arc::clone(&ran);
            queue.enqueue(move || async move {
                ran.lock().unwrap().push("c");
                Ok("c")
            })
        };

        let a_err = assert_err!(a.await);
        assert_eq!(a_err.to_string(), "boom");

        let b_err = assert_err!(b.await);
        assert!(b_err.is_drained());
        assert_eq!(b_err.to_string(), DRAIN_MESSAGE);
        assert_eq!(b_err.root_cause().to_string(), "boom");
        assert_eq!(b_err.root_cause().stack(), Some("at boom (page.js:1)"));

        assert_ok!(checkpoint.await);
        assert_eq!(c.await.unwrap(), "c");
        assert_eq!(*ran.lock().unwrap(), vec!["c"]);
    }

    #[tokio::test]
    async fn test_drain_without_barrier_empties_queue() {
        let queue = CommandQueue::new("drain-all");

        let a = queue.enqueue(|| async { Err::<(), _>(boom()) });
        let b = queue.enqueue(|| async { Ok(1) });
        let c = queue.enqueue(|| async { Ok(2) });

        assert_err!(a.await);
        assert!(assert_err!(b.await).is_drained());
        assert!(assert_err!(c.await).is_drained());
        assert!(queue.is_empty());

        // The queue keeps working after a drain.
        assert_eq!(queue.enqueue(|| async { Ok(3) }).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_barrier_enqueued_by_failing_command_stops_its_drain() {
        let queue = CommandQueue::new("open-question");
        let (barrier_tx, barrier_rx) = oneshot::channel();

        let inner = queue.clone();
        let a = queue.enqueue(move || async move {
            let _ = barrier_tx.send(inner.checkpoint());
            Err::<(), _>(boom())
        });
        let b = queue.enqueue(|| async { Ok("b") });

        assert_err!(a.await);
        assert!(assert_err!(b.await).is_drained());

        let barrier = barrier_rx.await.unwrap();
        assert_ok!(barrier.await);

        let c = queue.enqueue(|| async { Ok("c") });
        assert_eq!(c.await.unwrap(), "c");
    }

    #[tokio::test]
    async fn test_checkpoint_on_idle_queue_settles() {
        let queue = CommandQueue::new("idle");
        assert_ok!(queue.checkpoint().await);
        assert_ok!(queue.checkpoint().await);
    }

    #[tokio::test]
    async fn test_halt_on_empty_queue_is_noop() {
        let queue = CommandQueue::new("empty");
        assert_eq!(queue.halt(Some(boom())), 0);
        assert_eq!(queue.halt(None), 0);
        assert_eq!(queue.enqueue(|| async { Ok(1) }).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_halt_twice_has_no_additional_effect() {
        let queue = CommandQueue::new("halt-twice");
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first = queue.enqueue(move || async move {
            let _ = release_rx.await;
            Ok("first")
        });
        let second = queue.enqueue(|| async { Ok("second") });
        let third = queue.enqueue(|| async { Ok("third") });

        // Let the first command start.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(queue.is_running());

        assert_eq!(queue.halt(Some(CommandError::TargetClosed { target: "Browser".into() })), 2);
        assert_eq!(queue.halt(Some(boom())), 0);

        let _ = release_tx.send(());
        assert_eq!(first.await.unwrap(), "first");

        let err = assert_err!(second.await);
        assert_eq!(err.root_cause().to_string(), "Browser closed");
        assert!(assert_err!(third.await).is_drained());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_halt_keeps_later_checkpoint_segments() {
        let queue = CommandQueue::new("halt-segments");
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first = queue.enqueue(move || async move {
            let _ = release_rx.await;
            Ok(1)
        });
        let second = queue.enqueue(|| async { Ok(2) });
        let cp1 = queue.checkpoint();
        let third = queue.enqueue(|| async { Ok(3) });
        let cp2 = queue.checkpoint();
        let fourth = queue.enqueue(|| async { Ok(4) });

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(queue.is_running());

        assert_eq!(queue.halt(None), 1);
        assert_eq!(queue.halt(None), 0);
        assert_eq!(queue.len(), 3);

        let _ = release_tx.send(());
        assert_eq!(first.await.unwrap(), 1);
        assert!(assert_err!(second.await).is_drained());
        assert_ok!(cp1.await);
        assert_eq!(third.await.unwrap(), 3);
        assert_ok!(cp2.await);
        assert_eq!(fourth.await.unwrap(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_halt_after_new_entry_drains_again() {
        let queue = CommandQueue::new("halt-again");
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first = queue.enqueue(move || async move {
            let _ = release_rx.await;
            Ok(1)
        });
        tokio::time::sleep(Duration::from_millis(1)).await;

        let second = queue.enqueue(|| async { Ok(2) });
        let cp = queue.checkpoint();
        let third = queue.enqueue(|| async { Ok(3) });
        assert_eq!(queue.halt(None), 1);

        let fourth = queue.enqueue(|| async { Ok(4) });
        assert_eq!(queue.halt(None), 2);

        let _ = release_tx.send(());
        assert_eq!(first.await.unwrap(), 1);
        assert!(assert_err!(second.await).is_drained());
        assert_ok!(cp.await);
        assert!(assert_err!(third.await).is_drained());
        assert!(assert_err!(fourth.await).is_drained());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_long_chain_does_not_overflow() {
        let queue = CommandQueue::new("long");
        let counter = Arc::new(AtomicUsize::new(0));

        let mut last = None;
        for _ in 0..5_000 {
            let counter = Arc::clone(&counter);
            last = Some(queue.enqueue(move || async move {
                Ok(counter.fetch_add(1, Ordering::SeqCst))
            }));
        }

        assert_eq!(last.unwrap().await.unwrap(), 4_999);
        assert_eq!(counter.load(Ordering::SeqCst), 5_000);
    }

    #[tokio::test]
    async fn test_panicking_command_drains_queue() {
        let queue = CommandQueue::new("panic");

        let a = queue.enqueue(|| async {
            if true {
                panic!("action blew up");
            }
            Ok(())
        });
        let b = queue.enqueue(|| async { Ok(()) });

        assert!(matches!(assert_err!(a.await), CommandError::Abandoned));
        assert!(assert_err!(b.await).is_drained());
        assert_eq!(queue.enqueue(|| async { Ok(5) }).await.unwrap(), 5);
    }
}
