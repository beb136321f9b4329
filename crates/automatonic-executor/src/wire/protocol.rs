//! Line-delimited JSON protocol peer implementing [`RemoteTarget`].

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use automatonic_core::{
    EventHub, NavigateOptions, RemoteTarget, Script, TargetEvent, TargetFailure,
};
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::{Mutex as AsyncMutex, broadcast, oneshot},
    task::JoinHandle,
};

use super::types::{Frame, Request, RequestFrame};

type Reply = Result<Value, TargetFailure>;
/// In-flight requests by id; `None` once the reader has hung up.
type Pending = Arc<Mutex<Option<HashMap<u64, oneshot::Sender<Reply>>>>>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

fn lock(pending: &Pending) -> MutexGuard<'_, Option<HashMap<u64, oneshot::Sender<Reply>>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Remote target reached over a byte stream carrying one JSON frame per line.
///
/// Requests carry an auto-incrementing `id`; a background task reads
/// responses, correlates them by `id`, and publishes events. When the stream
/// ends, pending requests fail with [`TargetFailure::Disconnected`] and
/// [`TargetEvent::Closed`] is published.
pub struct WireTarget {
    writer: Arc<AsyncMutex<Writer>>,
    pending: Pending,
    next_id: AtomicU64,
    events: Arc<EventHub>,
    reader: JoinHandle<()>,
}

impl WireTarget {
    /// Spawn the reader task and return the connected target.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn spawn<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending: Pending = Arc::new(Mutex::new(Some(HashMap::new())));
        let events = Arc::new(EventHub::new());

        let reader = tokio::spawn(Self::read_loop(
            reader,
            Arc::clone(&pending),
            Arc::clone(&events),
        ));

        Self {
            writer: Arc::new(AsyncMutex::new(Box::new(writer))),
            pending,
            next_id: AtomicU64::new(1),
            events,
            reader,
        }
    }

    /// Event hub fed by the reader task.
    #[must_use]
    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    async fn read_loop<R>(reader: R, pending: Pending, events: Arc<EventHub>)
    where
        R: AsyncRead + Send + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut buffer = String::new();

        loop {
            buffer.clear();
            match reader.read_line(&mut buffer).await {
                Ok(0) => break, // EOF
                Ok(_) => {
                    let line = buffer.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Frame>(line) {
                        Ok(Frame::Response { id, result, error }) => {
                            let reply = error.map_or(Ok(result), |e| Err(e.into()));
                            let tx = lock(&pending).as_mut().and_then(|map| map.remove(&id));
                            if let Some(tx) = tx {
                                let _ = tx.send(reply);
                            } else {
                                tracing::debug!(id, "response for unknown request id");
                            }
                        }
                        Ok(Frame::Event { event }) => {
                            // Replies to requests already in flight may
                            // still follow a close.
                            tracing::debug!(?event, "target event");
                            events.publish(event);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "ignoring malformed frame");
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("Error reading from target: {e}");
                    break;
                }
            }
        }

        let orphaned = lock(&pending).take().unwrap_or_default();
        for (_, tx) in orphaned {
            let _ = tx.send(Err(TargetFailure::Disconnected));
        }
        events.publish(TargetEvent::Closed);
    }

    async fn request(&self, request: Request) -> Reply {
        if self.events.is_closed() {
            return Err(TargetFailure::Disconnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        // Register before sending so a fast reply is never missed. The map is
        // gone once the reader has hung up.
        match lock(&self.pending).as_mut() {
            Some(map) => map.insert(id, tx),
            None => return Err(TargetFailure::Disconnected),
        };

        if let Err(e) = self.send_json(&RequestFrame { id, request }).await {
            if let Some(map) = lock(&self.pending).as_mut() {
                map.remove(&id);
            }
            return Err(e);
        }

        rx.await.unwrap_or(Err(TargetFailure::Disconnected))
    }

    async fn send_json<T: serde::Serialize>(&self, message: &T) -> Result<(), TargetFailure> {
        let json = serde_json::to_string(message).map_err(|e| TargetFailure::Io(e.to_string()))?;
        let mut writer = self.writer.lock().await;
        let io = async {
            writer.write_all(json.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        };
        io.await.map_err(|e| TargetFailure::Io(e.to_string()))
    }
}

impl Drop for WireTarget {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl RemoteTarget for WireTarget {
    async fn evaluate(&self, script: Script) -> Result<Value, TargetFailure> {
        self.request(Request::Evaluate { script }).await
    }

    async fn load_url(&self, url: &str, options: &NavigateOptions) -> Result<(), TargetFailure> {
        self.request(Request::LoadUrl {
            url: url.to_string(),
            options: options.clone(),
        })
        .await
        .map(drop)
    }

    async fn title(&self) -> Result<String, TargetFailure> {
        match self.request(Request::Title).await? {
            Value::String(title) => Ok(title),
            Value::Null => Ok(String::new()),
            other => Err(TargetFailure::Io(format!("title is not a string: {other}"))),
        }
    }

    async fn close(&self) -> Result<(), TargetFailure> {
        self.request(Request::Close).await.map(drop)
    }

    async fn destroy(&self) -> Result<(), TargetFailure> {
        self.request(Request::Destroy).await.map(drop)
    }

    fn subscribe(&self) -> broadcast::Receiver<TargetEvent> {
        self.events.subscribe()
    }

    fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
    use tokio_test::assert_err;

    use super::*;
    use crate::wire::types::WireError;

    /// The far end of the wire, driven by the test.
    struct Peer {
        lines: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Peer {
        async fn next_request(&mut self) -> RequestFrame {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send(&mut self, frame: &Frame) {
            let mut line = serde_json::to_string(frame).unwrap();
            line.push('\n');
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }

        async fn send_raw(&mut self, raw: &str) {
            self.writer.write_all(raw.as_bytes()).await.unwrap();
        }
    }

    fn connect() -> (Arc<WireTarget>, Peer) {
        let (local, remote) = tokio::io::duplex(4096);
        let (local_read, local_write) = tokio::io::split(local);
        let (remote_read, remote_write) = tokio::io::split(remote);
        let target = Arc::new(WireTarget::spawn(local_read, local_write));
        let peer = Peer {
            lines: BufReader::new(remote_read).lines(),
            writer: remote_write,
        };
        (target, peer)
    }

    #[tokio::test]
    async fn test_evaluate_round_trip() {
        let (target, mut peer) = connect();

        let call = {
            let target = Arc::clone(&target);
            tokio::spawn(async move { target.evaluate(Script::has_element("#login")).await })
        };

        let req = peer.next_request().await;
        assert_eq!(
            req.request,
            Request::Evaluate {
                script: Script::has_element("#login")
            }
        );
        peer.send(&Frame::ok(req.id, json!(true))).await;

        assert_eq!(call.await.unwrap().unwrap(), json!(true));
    }

    #[tokio::test]
    async fn test_responses_correlate_by_id() {
        let (target, mut peer) = connect();

        let first = {
            let target = Arc::clone(&target);
            tokio::spawn(async move { target.title().await })
        };
        let first_req = peer.next_request().await;
        let second = {
            let target = Arc::clone(&target);
            tokio::spawn(async move { target.evaluate(Script::BodyHtml).await })
        };
        let second_req = peer.next_request().await;

        // Answer out of order.
        peer.send(&Frame::ok(second_req.id, json!("<p>hi</p>"))).await;
        peer.send(&Frame::ok(first_req.id, json!("Home"))).await;

        assert_eq!(first.await.unwrap().unwrap(), "Home");
        assert_eq!(second.await.unwrap().unwrap(), json!("<p>hi</p>"));
    }

    #[tokio::test]
    async fn test_remote_exception() {
        let (target, mut peer) = connect();

        let call = {
            let target = Arc::clone(&target);
            tokio::spawn(async move { target.evaluate(Script::call("explode", vec![])).await })
        };
        let req = peer.next_request().await;
        peer.send(&Frame::err(
            req.id,
            WireError {
                message: Some("kaboom".into()),
                stack: Some("Error: kaboom\n    at explode".into()),
                value: None,
            },
        ))
        .await;

        match assert_err!(call.await.unwrap()) {
            TargetFailure::Exception { message, stack } => {
                assert_eq!(message, "kaboom");
                assert!(stack.unwrap().contains("at explode"));
            }
            other => panic!("expected exception, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_events_are_published_and_malformed_frames_skipped() {
        let (target, mut peer) = connect();
        let mut events = target.subscribe();

        peer.send_raw("this is not json\n").await;
        peer.send(&Frame::Event {
            event: TargetEvent::LoadFinished,
        })
        .await;

        assert_eq!(events.recv().await.unwrap(), TargetEvent::LoadFinished);
        assert!(!target.is_closed());
    }

    #[tokio::test]
    async fn test_reply_after_closed_event_is_delivered() {
        let (target, mut peer) = connect();

        let call = {
            let target = Arc::clone(&target);
            tokio::spawn(async move { target.close().await })
        };
        let req = peer.next_request().await;
        assert_eq!(req.request, Request::Close);

        peer.send(&Frame::Event {
            event: TargetEvent::Closed,
        })
        .await;
        peer.send(&Frame::ok(req.id, Value::Null)).await;

        assert!(call.await.unwrap().is_ok());
        assert!(target.is_closed());
        assert!(matches!(
            target.evaluate(Script::BodyHtml).await,
            Err(TargetFailure::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_request_after_reader_hangup_fails_with_open_writer() {
        // Separate pipes: the inbound side ends while the outbound side
        // still accepts bytes.
        let (inbound, inbound_far) = tokio::io::duplex(4096);
        let (outbound, outbound_far) = tokio::io::duplex(4096);
        let target = WireTarget::spawn(inbound, outbound);
        let mut events = target.subscribe();
        let mut requests = BufReader::new(outbound_far).lines();

        let call = target.evaluate(Script::BodyHtml);
        let hangup = async {
            let _ = requests.next_line().await.unwrap().unwrap();
            drop(inbound_far);
        };
        let (outcome, ()) = tokio::join!(call, hangup);
        assert!(matches!(outcome, Err(TargetFailure::Disconnected)));
        assert_eq!(events.recv().await.unwrap(), TargetEvent::Closed);

        let late = tokio::time::timeout(Duration::from_secs(1), target.title()).await;
        assert!(matches!(late, Ok(Err(TargetFailure::Disconnected))));
    }

    #[tokio::test]
    async fn test_request_racing_hangup_does_not_hang() {
        let (inbound, _inbound_far) = tokio::io::duplex(4096);
        let (outbound, _outbound_far) = tokio::io::duplex(4096);
        let target = WireTarget::spawn(inbound, outbound);

        // The reader has dropped its in-flight map but not yet published the
        // close.
        let _ = lock(&target.pending).take();
        assert!(!target.is_closed());

        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            target.evaluate(Script::BodyHtml),
        )
        .await;
        assert!(matches!(outcome, Ok(Err(TargetFailure::Disconnected))));
    }

    #[tokio::test]
    async fn test_hangup_fails_pending_and_closes() {
        let (target, mut peer) = connect();
        let mut events = target.subscribe();

        let call = {
            let target = Arc::clone(&target);
            tokio::spawn(async move { target.evaluate(Script::BodyHtml).await })
        };
        let _ = peer.next_request().await;
        drop(peer);

        assert!(matches!(
            call.await.unwrap(),
            Err(TargetFailure::Disconnected)
        ));
        assert_eq!(events.recv().await.unwrap(), TargetEvent::Closed);
        assert!(target.is_closed());
        assert!(matches!(
            target.title().await,
            Err(TargetFailure::Disconnected)
        ));
    }
}
