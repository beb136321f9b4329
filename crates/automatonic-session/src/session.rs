//! A session: one ordered command pipeline bound to one remote target.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, OnceLock, Weak},
    task::{Context, Poll},
    time::Duration,
};

use automatonic_core::{
    CommandError, CommandFuture, CommandQueue, NavigateOptions, ReadinessGate, RemoteTarget,
    Script, SessionConfig, TargetEvent, wait_until,
};
use automatonic_executor::{CallBuilder, RemoteExecutor};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::{
    sync::{broadcast, oneshot, watch},
    task::AbortHandle,
};
use uuid::Uuid;

/// Session identifier.
pub type SessionId = Uuid;

/// What [`Session::wait_for`] waits on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitFor {
    /// An element matching the selector.
    Selector(String),
    /// A fixed delay.
    Delay(Duration),
}

impl From<&str> for WaitFor {
    fn from(selector: &str) -> Self {
        Self::Selector(selector.to_string())
    }
}

impl From<String> for WaitFor {
    fn from(selector: String) -> Self {
        Self::Selector(selector)
    }
}

impl From<Duration> for WaitFor {
    fn from(delay: Duration) -> Self {
        Self::Delay(delay)
    }
}

/// What [`Session::check_for_text`] looks for in the body HTML.
#[derive(Debug, Clone)]
pub enum TextPattern {
    /// A substring.
    Literal(String),
    /// A regular expression matched anywhere in the HTML.
    Regex(Regex),
}

impl TextPattern {
    /// Whether the pattern occurs in `haystack`.
    #[must_use]
    pub fn is_match(&self, haystack: &str) -> bool {
        match self {
            Self::Literal(needle) => haystack.contains(needle.as_str()),
            Self::Regex(re) => re.is_match(haystack),
        }
    }
}

impl From<&str> for TextPattern {
    fn from(needle: &str) -> Self {
        Self::Literal(needle.to_string())
    }
}

impl From<String> for TextPattern {
    fn from(needle: String) -> Self {
        Self::Literal(needle)
    }
}

impl From<Regex> for TextPattern {
    fn from(re: Regex) -> Self {
        Self::Regex(re)
    }
}

/// Options for [`Session::click`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClickOptions {
    /// Budget for the element to appear; defaults to the session's.
    pub timeout: Option<Duration>,
}

/// Options for [`Session::type_text`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TypeOptions {
    /// Keep the field's current value instead of clearing it first.
    pub append: bool,
    /// Delay between keystrokes; defaults to the session's.
    pub typing_interval: Option<Duration>,
    /// Budget for the element to appear; defaults to the session's.
    pub timeout: Option<Duration>,
}

impl TypeOptions {
    /// Options that keep the field's current value.
    #[must_use]
    pub const fn append() -> Self {
        Self {
            append: true,
            typing_interval: None,
            timeout: None,
        }
    }
}

struct Inner {
    id: SessionId,
    config: SessionConfig,
    queue: CommandQueue,
    executor: OnceLock<RemoteExecutor>,
    closed: watch::Sender<bool>,
    watcher: OnceLock<AbortHandle>,
}

impl Inner {
    fn executor(&self) -> Result<RemoteExecutor, CommandError> {
        self.executor.get().cloned().ok_or_else(|| {
            CommandError::Transport(format!("{} is not connected", self.config.target_name))
        })
    }

    fn closed_error(&self) -> CommandError {
        CommandError::TargetClosed {
            target: self.config.target_name.clone(),
        }
    }

    /// Bind the target and watch it for closure.
    ///
    /// The watcher holds only a weak reference to the session.
    fn attach(self: &Arc<Self>, target: Arc<dyn RemoteTarget>) {
        // Subscribe before checking, so a close in between is not missed.
        let events = target.subscribe();
        let already_closed = target.is_closed();

        if self
            .executor
            .set(RemoteExecutor::new(target, self.config.target_name.clone()))
            .is_err()
        {
            tracing::warn!(session = %self.id, "session already has a target");
            return;
        }
        tracing::info!(session = %self.id, "session connected");

        let weak = Arc::downgrade(self);
        let watcher = tokio::spawn(async move {
            if !already_closed {
                wait_closed(events).await;
            }
            if let Some(inner) = weak.upgrade() {
                let pending = inner.queue.halt(Some(inner.closed_error()));
                tracing::info!(session = %inner.id, pending, "target closed");
                inner.closed.send_replace(true);
            }
        });
        let _ = self.watcher.set(watcher.abort_handle());
    }

    /// Mark a session whose target never came up as closed.
    fn connect_failed(&self, err: &CommandError) {
        tracing::warn!(session = %self.id, error = %err, "failed to connect");
        self.closed.send_replace(true);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.get() {
            watcher.abort();
        }
    }
}

async fn wait_closed(mut events: broadcast::Receiver<TargetEvent>) {
    loop {
        match events.recv().await {
            Ok(TargetEvent::Closed) | Err(broadcast::error::RecvError::Closed) => return,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
        }
    }
}

async fn wait_selector(
    inner: &Inner,
    executor: &RemoteExecutor,
    selector: &str,
    timeout: Option<Duration>,
) -> Result<bool, CommandError> {
    let options = inner.config.poll_options(timeout);
    wait_until(&format!("element '{selector}'"), options, || {
        executor.has_element(selector)
    })
    .await
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Ordered command pipeline over one remote target.
///
/// Every operation except [`Session::checkpoint`] and [`Session::halt`] is
/// queued: it starts only after everything enqueued before it has settled,
/// and a failure discards the not-yet-started commands up to the next
/// checkpoint. Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("pending", &self.inner.queue.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    fn unconnected(config: SessionConfig) -> Self {
        let id = Uuid::new_v4();
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                id,
                queue: CommandQueue::new(id.to_string()),
                config,
                executor: OnceLock::new(),
                closed,
                watcher: OnceLock::new(),
            }),
        }
    }

    /// Start a session on a live target.
    ///
    /// When the target reports that it closed, the queue is halted with
    /// [`CommandError::TargetClosed`].
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn launch(target: Arc<dyn RemoteTarget>, config: SessionConfig) -> Self {
        let session = Self::unconnected(config);
        session.inner.attach(target);
        session
    }

    /// Start a session whose target is created by `connect` once `gate`
    /// opens. Commands enqueued in the meantime run after the connection,
    /// in order; if `connect` fails they are drained and the session counts
    /// as closed.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn launch_gated<F, Fut>(gate: &ReadinessGate, config: SessionConfig, connect: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Arc<dyn RemoteTarget>, CommandError>> + Send + 'static,
    {
        let session = Self::unconnected(config);
        let (ready_tx, ready_rx) = oneshot::channel();
        gate.submit(move || {
            let _ = ready_tx.send(());
        });

        let inner: Weak<Inner> = Arc::downgrade(&session.inner);
        let _connected = session.inner.queue.enqueue(move || async move {
            let connected = match ready_rx.await {
                Ok(()) => connect().await,
                Err(_) => Err(CommandError::Abandoned),
            };
            let inner = inner.upgrade().ok_or(CommandError::Abandoned)?;
            match connected {
                Ok(target) => {
                    inner.attach(target);
                    Ok(())
                }
                Err(err) => {
                    inner.connect_failed(&err);
                    Err(err)
                }
            }
        });
        session
    }

    /// Unique id of this session.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Configuration the session was launched with.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Number of commands waiting to start.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.queue.len()
    }

    /// Whether the target has closed, or never connected.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Resolve once the target has closed and the queue has been halted,
    /// or once a gated connect has failed.
    pub async fn closed(&self) {
        let mut rx = self.watch_closed();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Receiver of the closed flag that does not keep the session alive.
    pub(crate) fn watch_closed(&self) -> watch::Receiver<bool> {
        self.inner.closed.subscribe()
    }

    fn schedule<F, Fut, V>(&self, action: F) -> Chained<V>
    where
        F: FnOnce(Arc<Inner>, RemoteExecutor) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, CommandError>> + Send + 'static,
        V: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let future = self.inner.queue.enqueue(move || async move {
            let executor = inner.executor()?;
            action(inner, executor).await
        });
        Chained::new(future, self.clone())
    }

    /// Evaluate a script on the target.
    pub fn execute(&self, script: Script) -> Chained<Value> {
        self.schedule(move |_, executor| async move { executor.execute(script).await })
    }

    /// Evaluate a script and decode its result.
    pub fn execute_as<T>(&self, script: Script) -> Chained<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.schedule(move |_, executor| async move { executor.execute_as(script).await })
    }

    /// Call a function registered on the target. Argument encoding failures
    /// fail this command.
    pub fn call(&self, call: CallBuilder) -> Chained<Value> {
        self.schedule(move |_, executor| async move { executor.execute(call.build()?).await })
    }

    /// Load `url`. Settles when the target reports the load finished, and
    /// fails with [`CommandError::Navigation`] when it reports a failure.
    pub fn goto_url(&self, url: impl Into<String>, options: NavigateOptions) -> Chained<()> {
        let url = url.into();
        self.schedule(move |inner, executor| async move {
            // Subscribe first: the outcome may arrive before load_url returns.
            let mut events = executor.target().subscribe();
            tracing::debug!(session = %inner.id, url = %url, "navigating");
            executor.load_url(&url, &options).await?;

            loop {
                match events.recv().await {
                    Ok(TargetEvent::LoadFinished) => return Ok(()),
                    Ok(TargetEvent::LoadFailed { code, description }) => {
                        return Err(CommandError::Navigation {
                            url,
                            reason: format!("{description} ({code})"),
                        });
                    }
                    Ok(TargetEvent::Closed) | Err(broadcast::error::RecvError::Closed) => {
                        return Err(inner.closed_error());
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(session = %inner.id, skipped, "navigation events lagged");
                    }
                }
            }
        })
    }

    /// Close the target gracefully.
    pub fn close(&self) -> Chained<()> {
        self.schedule(|inner, executor| async move {
            tracing::info!(session = %inner.id, "closing session");
            executor.close().await
        })
    }

    /// Destroy the target without a graceful close.
    pub fn kill(&self) -> Chained<()> {
        self.schedule(|inner, executor| async move {
            tracing::info!(session = %inner.id, "killing session");
            executor.destroy().await
        })
    }

    /// Wait for an element to appear or for a fixed delay. `timeout` bounds
    /// element waits and defaults to the session's `wait_timeout`.
    pub fn wait_for(&self, what: impl Into<WaitFor>, timeout: Option<Duration>) -> Chained<bool> {
        let what = what.into();
        self.schedule(move |inner, executor| async move {
            match what {
                WaitFor::Selector(selector) => {
                    wait_selector(&inner, &executor, &selector, timeout).await
                }
                WaitFor::Delay(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(true)
                }
            }
        })
    }

    /// Pause the pipeline for `delay`.
    pub fn wait(&self, delay: Duration) -> Chained<()> {
        let inner = Arc::clone(&self.inner);
        let future = self.inner.queue.enqueue(move || async move {
            tracing::trace!(session = %inner.id, delay_ms = millis(delay), "waiting");
            tokio::time::sleep(delay).await;
            Ok(())
        });
        Chained::new(future, self.clone())
    }

    /// Current document title.
    pub fn title(&self) -> Chained<String> {
        self.schedule(|_, executor| async move { executor.title().await })
    }

    /// Wait for `selector`, then click it.
    pub fn click(&self, selector: impl Into<String>, options: ClickOptions) -> Chained<()> {
        let selector = selector.into();
        self.schedule(move |inner, executor| async move {
            wait_selector(&inner, &executor, &selector, options.timeout).await?;
            executor.execute(Script::Click { selector }).await.map(drop)
        })
    }

    /// Wait for `selector`, then type `text` into it one key at a time.
    pub fn type_text(
        &self,
        selector: impl Into<String>,
        text: impl Into<String>,
        options: TypeOptions,
    ) -> Chained<()> {
        let selector = selector.into();
        let text = text.into();
        self.schedule(move |inner, executor| async move {
            wait_selector(&inner, &executor, &selector, options.timeout).await?;
            let interval = options
                .typing_interval
                .unwrap_or(inner.config.typing_interval);
            let script = Script::Type {
                selector,
                text,
                append: options.append,
                typing_interval_ms: millis(interval),
            };
            executor.execute(script).await.map(drop)
        })
    }

    /// Whether `selector` matches right now. Does not wait.
    pub fn check_for(&self, selector: impl Into<String>) -> Chained<bool> {
        let selector = selector.into();
        self.schedule(move |_, executor| async move { executor.has_element(&selector).await })
    }

    /// Whether the body HTML contains `pattern`.
    pub fn check_for_text(&self, pattern: impl Into<TextPattern>) -> Chained<bool> {
        let pattern = pattern.into();
        self.schedule(move |_, executor| async move {
            let html: String = executor.execute_as(Script::BodyHtml).await?;
            Ok(pattern.is_match(&html))
        })
    }

    /// Enqueue a barrier. It settles when reached and stops any drain.
    pub fn checkpoint(&self) -> Chained<()> {
        Chained::new(self.inner.queue.checkpoint(), self.clone())
    }

    /// Fail every not-yet-started command up to the next checkpoint.
    /// Returns how many were failed.
    pub fn halt(&self, cause: Option<CommandError>) -> usize {
        self.inner.queue.halt(cause)
    }
}

/// Future of a queued session operation that also hands back its session,
/// so calls can be chained: `session.goto_url(url, opts).and().click(...)`.
#[must_use = "futures do nothing unless polled"]
pub struct Chained<V> {
    future: CommandFuture<V>,
    session: Session,
}

impl<V> Chained<V> {
    const fn new(future: CommandFuture<V>, session: Session) -> Self {
        Self { future, session }
    }

    /// The session this operation was queued on.
    pub const fn and(&self) -> &Session {
        &self.session
    }
}

impl<V> Future for Chained<V> {
    type Output = Result<V, CommandError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.future).poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_pattern() {
        let html = "<p>Welcome back, Ada</p>";
        assert!(TextPattern::from("Welcome").is_match(html));
        assert!(!TextPattern::from("Goodbye").is_match(html));
        assert!(TextPattern::from(Regex::new(r"back, \w+").unwrap()).is_match(html));
        assert!(!TextPattern::from(Regex::new(r"^\d+$").unwrap()).is_match(html));
    }

    #[test]
    fn test_wait_for_conversions() {
        assert_eq!(WaitFor::from("#a"), WaitFor::Selector("#a".into()));
        assert_eq!(
            WaitFor::from(Duration::from_millis(5)),
            WaitFor::Delay(Duration::from_millis(5))
        );
        assert!(TypeOptions::append().append);
    }

    #[cfg(feature = "memory")]
    #[tokio::test]
    async fn test_dropped_session_releases_queue_while_target_open() {
        let target = Arc::new(crate::MemoryTarget::new());
        let session = Session::launch(
            Arc::clone(&target) as Arc<dyn RemoteTarget>,
            SessionConfig::default(),
        );
        let inner = Arc::downgrade(&session.inner);

        drop(session);
        tokio::task::yield_now().await;
        assert!(inner.upgrade().is_none());
        assert!(!target.is_closed());
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_millis(42)), 42);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }
}
