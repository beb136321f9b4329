//! Scripted login flow against a simulated page served over the wire
//! protocol.
//!
//! Run with: cargo run -p scripted-flow
//!
//! Set `RUST_LOG=debug` to watch the queue at work.

use std::{sync::Arc, time::Duration};

use anyhow::Context as _;
use automatonic_core::{
    CommandError, NavigateOptions, ReadinessGate, RemoteTarget, Script, SessionConfig,
    TargetEvent,
};
use automatonic_executor::{
    CallBuilder, WireTarget,
    wire::{Frame, Request, RequestFrame},
};
use automatonic_session::{ClickOptions, MemoryTarget, Page, SessionManager, TypeOptions};
use regex::Regex;
use serde_json::{Value, json};
use tokio::{
    io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, WriteHalf},
    sync::Mutex,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const LOGIN: &str = "https://app.test/login";
const DASHBOARD: &str = "https://app.test/dashboard";

fn simulated_app() -> Arc<MemoryTarget> {
    Arc::new(
        MemoryTarget::new()
            .with_load_delay(Duration::from_millis(50))
            .with_page(
                LOGIN,
                Page::new("Sign in")
                    .with_html("<form><input id=\"user\"><input id=\"pass\"></form>")
                    .with_element("#user")
                    .with_element("#pass"),
            )
            .with_page(
                DASHBOARD,
                Page::new("Dashboard")
                    .with_html("<h1>Welcome back</h1><p>3 open orders</p>")
                    .with_element("#orders"),
            )
            .with_function("sum", |args| {
                Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
            }),
    )
}

type SharedWriter = Arc<Mutex<WriteHalf<DuplexStream>>>;

async fn send_frame<W: AsyncWrite + Unpin>(writer: &Mutex<W>, frame: &Frame) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Serve `target` on the far end of the wire until the client hangs up.
async fn serve(target: Arc<MemoryTarget>, stream: DuplexStream) -> anyhow::Result<()> {
    let (read, write) = tokio::io::split(stream);
    let writer: SharedWriter = Arc::new(Mutex::new(write));

    let mut events = target.subscribe();
    let forward = {
        let writer = Arc::clone(&writer);
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let closed = event == TargetEvent::Closed;
                if send_frame(&writer, &Frame::Event { event }).await.is_err() || closed {
                    break;
                }
            }
        })
    };

    let mut lines = BufReader::new(read).lines();
    while let Some(line) = lines.next_line().await? {
        let RequestFrame { id, request } =
            serde_json::from_str(&line).context("malformed request")?;
        let outcome = match request {
            Request::Evaluate { script } => target.evaluate(script).await,
            Request::LoadUrl { url, options } => {
                target.load_url(&url, &options).await.map(|()| Value::Null)
            }
            Request::Title => target.title().await.map(Value::String),
            Request::Close => target.close().await.map(|()| Value::Null),
            Request::Destroy => target.destroy().await.map(|()| Value::Null),
        };
        let reply = match outcome {
            Ok(result) => Frame::ok(id, result),
            Err(failure) => Frame::err(id, failure.into()),
        };
        send_frame(&writer, &reply).await?;
    }

    forward.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let app = simulated_app();
    let config = SessionConfig::default()
        .with_poll_interval(Duration::from_millis(25))
        .with_typing_interval(Duration::from_millis(10));
    let manager = SessionManager::new(config);

    // Work submitted before the host is ready waits behind the gate.
    let gate = ReadinessGate::global();
    let served = Arc::clone(&app);
    let session = manager
        .launch_gated(gate, move || async move {
            let (client, server) = tokio::io::duplex(64 * 1024);
            tokio::spawn(async move {
                if let Err(e) = serve(served, server).await {
                    tracing::error!("wire server failed: {e:#}");
                }
            });
            let (read, write) = tokio::io::split(client);
            let target: Arc<dyn RemoteTarget> = Arc::new(WireTarget::spawn(read, write));
            Ok(target)
        })
        .await;

    let landed = session.goto_url(LOGIN, NavigateOptions::default().with_user_agent("automatonic"));
    tracing::info!(pending = session.pending(), "commands queued before the host is ready");

    tokio::time::sleep(Duration::from_millis(100)).await;
    gate.open();
    landed.await?;

    // The dashboard link shows up a little after the form is filled.
    app.add_element_after("#sign-in", Duration::from_millis(120));
    session
        .type_text("#user", "ada", TypeOptions::default())
        .and()
        .type_text("#pass", "hunter2", TypeOptions::default())
        .and()
        .click("#sign-in", ClickOptions::default())
        .and()
        .goto_url(DASHBOARD, NavigateOptions::default().with_referrer(LOGIN))
        .await?;

    let title = session.title().await?;
    let welcomed = session.check_for_text("Welcome back").await?;
    let orders = session
        .check_for_text(Regex::new(r"\d+ open orders")?)
        .await?;
    let total = session.call(CallBuilder::new("sum").args([19, 23])).await?;
    tracing::info!(%title, welcomed, orders, %total, "signed in");

    // A failing command drains what follows it, up to the checkpoint.
    let broken = session.execute(Script::call("undefinedHelper", vec![]));
    let skipped = session.title();
    let barrier = session.checkpoint();
    let resumed = session.check_for("#orders");

    if let Err(e) = broken.await {
        tracing::warn!(error = %e, "remote call failed");
    }
    if let Err(e) = skipped.await {
        tracing::warn!("skipped command:\n{}", e.report());
    }
    barrier.await?;
    tracing::info!(found = resumed.await?, "queue resumed after checkpoint");

    manager.close_all().await?;
    session.closed().await;
    match session.title().await {
        Err(CommandError::TargetClosed { target }) => tracing::info!("{target} closed"),
        other => tracing::warn!(?other, "unexpected result after close"),
    }
    Ok(())
}
