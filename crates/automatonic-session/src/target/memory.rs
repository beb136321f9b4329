//! In-memory remote target.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use async_trait::async_trait;
use automatonic_core::{
    EventHub, NavigateOptions, RemoteTarget, Script, TargetEvent, TargetFailure,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{sync::broadcast, time::Instant};

/// Net error code reported for URLs with no registered page.
pub const NAME_NOT_RESOLVED: i32 = -105;

/// A simulated document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Page {
    pub title: String,
    /// Body HTML searched by text checks.
    pub html: String,
    /// Selectors that match an element once the page has loaded.
    pub elements: HashSet<String>,
    /// When set, loading this page fails with `(code, description)`.
    pub load_failure: Option<(i32, String)>,
}

impl Page {
    /// Empty page with the given title.
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    /// Set the body HTML.
    #[must_use]
    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = html.into();
        self
    }

    /// Add a selector that matches once the page has loaded.
    #[must_use]
    pub fn with_element(mut self, selector: impl Into<String>) -> Self {
        self.elements.insert(selector.into());
        self
    }

    /// Make loading this page fail with a network error.
    #[must_use]
    pub fn failing(mut self, code: i32, description: impl Into<String>) -> Self {
        self.load_failure = Some((code, description.into()));
        self
    }
}

/// Function callable through [`Script::Call`].
pub type RemoteFn = Arc<dyn Fn(&[Value]) -> Result<Value, TargetFailure> + Send + Sync>;

#[derive(Default)]
struct State {
    pages: HashMap<String, Page>,
    current_url: Option<String>,
    /// Selector to the instant it starts matching.
    elements: HashMap<String, Instant>,
    functions: HashMap<String, RemoteFn>,
    fields: HashMap<String, String>,
    clicks: Vec<String>,
}

impl State {
    fn current(&self) -> Option<&Page> {
        self.current_url.as_ref().and_then(|url| self.pages.get(url))
    }

    fn has_element(&self, selector: &str) -> bool {
        self.elements
            .get(selector)
            .is_some_and(|at| Instant::now() >= *at)
    }
}

/// A [`RemoteTarget`] that simulates a browser page in memory.
///
/// Useful for development and tests. Pages are registered by URL; loading a
/// URL replaces the set of present elements with the page's own. Elements
/// can be made to appear later, and named functions can be registered for
/// [`Script::Call`]. Clicks and typed values are recorded for inspection.
pub struct MemoryTarget {
    state: RwLock<State>,
    events: Arc<EventHub>,
    load_delay: Duration,
}

impl Default for MemoryTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTarget {
    /// Create a target with no pages.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            events: Arc::new(EventHub::new()),
            load_delay: Duration::ZERO,
        }
    }

    /// Delay between a load request and its completion event.
    #[must_use]
    pub const fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// Register a page.
    #[must_use]
    pub fn with_page(self, url: impl Into<String>, page: Page) -> Self {
        self.add_page(url, page);
        self
    }

    /// Register a remote function.
    #[must_use]
    pub fn with_function<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, TargetFailure> + Send + Sync + 'static,
    {
        self.register(name, f);
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serve `page` at `url`, replacing any page already there.
    pub fn add_page(&self, url: impl Into<String>, page: Page) {
        self.write().pages.insert(url.into(), page);
    }

    /// Register a function callable through [`Script::Call`].
    pub fn register<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&[Value]) -> Result<Value, TargetFailure> + Send + Sync + 'static,
    {
        self.write().functions.insert(name.into(), Arc::new(f));
    }

    /// Make `selector` match from now on.
    pub fn add_element(&self, selector: impl Into<String>) {
        self.add_element_after(selector, Duration::ZERO);
    }

    /// Make `selector` match once `delay` has passed.
    pub fn add_element_after(&self, selector: impl Into<String>, delay: Duration) {
        self.write()
            .elements
            .insert(selector.into(), Instant::now() + delay);
    }

    /// Stop `selector` from matching.
    pub fn remove_element(&self, selector: &str) {
        self.write().elements.remove(selector);
    }

    /// Selectors clicked so far, oldest first.
    #[must_use]
    pub fn clicks(&self) -> Vec<String> {
        self.read().clicks.clone()
    }

    /// Value typed into the field matched by `selector`.
    #[must_use]
    pub fn field_value(&self, selector: &str) -> Option<String> {
        self.read().fields.get(selector).cloned()
    }

    /// URL of the last page loaded successfully.
    #[must_use]
    pub fn current_url(&self) -> Option<String> {
        self.read().current_url.clone()
    }

    /// Simulate the window going away.
    pub fn fire_closed(&self) {
        if self.events.publish(TargetEvent::Closed) {
            tracing::debug!("memory target closed");
        }
    }

    fn ensure_open(&self) -> Result<(), TargetFailure> {
        if self.events.is_closed() {
            Err(TargetFailure::Disconnected)
        } else {
            Ok(())
        }
    }

    fn missing(op: &str, selector: &str) -> TargetFailure {
        let message = format!("{op}: No element matches '{selector}'");
        TargetFailure::Exception {
            stack: Some(format!("Error: {message}\n    at {op} (memory)")),
            message,
        }
    }

    fn has_element(&self, selector: &str) -> bool {
        self.read().has_element(selector)
    }

    fn body_html(&self) -> String {
        self.read().current().map(|p| p.html.clone()).unwrap_or_default()
    }

    fn click(&self, selector: String) -> Result<(), TargetFailure> {
        let mut state = self.write();
        if !state.has_element(&selector) {
            return Err(Self::missing("click", &selector));
        }
        state.clicks.push(selector);
        Ok(())
    }

    fn call(&self, function: &str, args: &[Value]) -> Result<Value, TargetFailure> {
        let f = self.read().functions.get(function).cloned();
        match f {
            Some(f) => f(args),
            None => {
                let message = format!("{function} is not defined");
                Err(TargetFailure::Exception {
                    stack: Some(format!("ReferenceError: {message}\n    at <anonymous>:1:1")),
                    message,
                })
            }
        }
    }

    async fn type_text(
        &self,
        selector: &str,
        text: &str,
        append: bool,
        interval: Duration,
    ) -> Result<(), TargetFailure> {
        {
            let mut state = self.write();
            if !state.has_element(selector) {
                return Err(Self::missing("type", selector));
            }
            let field = state.fields.entry(selector.to_string()).or_default();
            if !append {
                field.clear();
            }
        }

        for ch in text.chars() {
            self.ensure_open()?;
            self.write()
                .fields
                .entry(selector.to_string())
                .or_default()
                .push(ch);
            tokio::time::sleep(interval).await;
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteTarget for MemoryTarget {
    async fn evaluate(&self, script: Script) -> Result<Value, TargetFailure> {
        self.ensure_open()?;
        match script {
            Script::Call { function, args } => self.call(&function, &args),
            Script::HasElement { selector } => Ok(Value::Bool(self.has_element(&selector))),
            Script::Click { selector } => self.click(selector).map(|()| Value::Null),
            Script::Type {
                selector,
                text,
                append,
                typing_interval_ms,
            } => self
                .type_text(
                    &selector,
                    &text,
                    append,
                    Duration::from_millis(typing_interval_ms),
                )
                .await
                .map(|()| Value::Null),
            Script::BodyHtml => Ok(Value::String(self.body_html())),
        }
    }

    async fn load_url(&self, url: &str, _options: &NavigateOptions) -> Result<(), TargetFailure> {
        self.ensure_open()?;

        let event = {
            let mut state = self.write();
            match state.pages.get(url).cloned() {
                None => TargetEvent::LoadFailed {
                    code: NAME_NOT_RESOLVED,
                    description: "ERR_NAME_NOT_RESOLVED".to_string(),
                },
                Some(Page {
                    load_failure: Some((code, description)),
                    ..
                }) => TargetEvent::LoadFailed { code, description },
                Some(page) => {
                    let now = Instant::now();
                    state.elements = page.elements.into_iter().map(|s| (s, now)).collect();
                    state.fields.clear();
                    state.current_url = Some(url.to_string());
                    TargetEvent::LoadFinished
                }
            }
        };

        // Completion is reported after the load call returns.
        let events = Arc::clone(&self.events);
        let delay = self.load_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            events.publish(event);
        });
        Ok(())
    }

    async fn title(&self) -> Result<String, TargetFailure> {
        self.ensure_open()?;
        Ok(self.read().current().map(|p| p.title.clone()).unwrap_or_default())
    }

    async fn close(&self) -> Result<(), TargetFailure> {
        self.ensure_open()?;
        self.fire_closed();
        Ok(())
    }

    async fn destroy(&self) -> Result<(), TargetFailure> {
        self.fire_closed();
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TargetEvent> {
        self.events.subscribe()
    }

    fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}
