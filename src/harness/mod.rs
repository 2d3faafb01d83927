//! Load-driver harness
//!
//! Spins up one [`Session`] per virtual client, runs the configured script
//! on each and attributes every outcome to a named metric.

mod report;

pub use report::*;

use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;

use crate::auth::TokenSource;
use crate::config::{LoadConfig, ScriptStep};
use crate::metrics::{self, qualified, MetricsSink};
use crate::network::{handler, Connector, EventHandler, Session, SessionConfig, SessionError};

/// How a virtual client's run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientOutcome {
    /// Connected and ran the whole script
    Completed,
    /// Never obtained a credential
    AuthFailed,
    /// Connect attempt failed
    ConnectFailed,
    /// Session ended while the script was running
    Dropped,
}

/// Live progress counters
#[derive(Debug, Default)]
struct Progress {
    active: AtomicUsize,
    connected: AtomicUsize,
    failed: AtomicUsize,
}

/// Everything a client task needs
struct ClientContext {
    session: SessionConfig,
    load: LoadConfig,
    tokens: TokenSource,
    connector: Arc<dyn Connector>,
    sink: Arc<dyn MetricsSink>,
    handshakes: Semaphore,
    awaited: HashSet<String>,
    progress: Progress,
}

/// Drives a load run
pub struct LoadDriver {
    ctx: Arc<ClientContext>,
}

impl LoadDriver {
    pub fn new(
        session: SessionConfig,
        load: LoadConfig,
        tokens: TokenSource,
        connector: Arc<dyn Connector>,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        let awaited = load
            .script
            .iter()
            .filter_map(|step| match step {
                ScriptStep::WaitFor { event, .. } => Some(event.clone()),
                _ => None,
            })
            .collect();
        let handshakes = Semaphore::new(load.max_concurrent_handshakes.max(1));

        Self {
            ctx: Arc::new(ClientContext {
                session,
                load,
                tokens,
                connector,
                sink,
                handshakes,
                awaited,
                progress: Progress::default(),
            }),
        }
    }

    /// Run every virtual client to completion
    pub async fn run(&self) -> RunSummary {
        let clients = self.ctx.load.clients;
        let started = Instant::now();

        tracing::info!(
            clients,
            ramp_up_ms = self.ctx.load.ramp_up_ms,
            "Starting load run against {}",
            self.ctx.session.url
        );

        let ticker = self.spawn_progress_ticker();

        let tasks: Vec<_> = (0..clients)
            .map(|index| {
                let ctx = self.ctx.clone();
                tokio::spawn(async move { run_client(index, ctx).await })
            })
            .collect();

        let mut summary = RunSummary {
            clients,
            ..Default::default()
        };
        for task in tasks {
            match task.await {
                Ok(outcome) => summary.add(outcome),
                Err(e) => {
                    tracing::error!("Client task failed: {}", e);
                    summary.add(ClientOutcome::Dropped);
                }
            }
        }
        summary.elapsed_ms = started.elapsed().as_millis() as u64;

        if let Some(ticker) = ticker {
            ticker.abort();
        }

        tracing::info!(
            completed = summary.completed,
            failed = summary.connect_failed + summary.auth_failed,
            dropped = summary.dropped,
            "Load run finished in {} ms",
            summary.elapsed_ms
        );
        summary
    }

    fn spawn_progress_ticker(&self) -> Option<tokio::task::JoinHandle<()>> {
        let interval_ms = self.ctx.load.report_interval_ms;
        if interval_ms == 0 {
            return None;
        }

        let ctx = self.ctx.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                tracing::info!(
                    active = ctx.progress.active.load(Ordering::Relaxed),
                    connected = ctx.progress.connected.load(Ordering::Relaxed),
                    failed = ctx.progress.failed.load(Ordering::Relaxed),
                    "Progress"
                );
            }
        }))
    }
}

/// Offset of a client's start within the ramp-up window
fn ramp_offset(index: usize, clients: usize, ramp_up_ms: u64) -> Duration {
    if clients == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(ramp_up_ms * index as u64 / clients as u64)
}

fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}

/// Errors after which the session cannot continue the script
fn ends_session(error: &SessionError) -> bool {
    matches!(
        error,
        SessionError::Cancelled
            | SessionError::NotConnected
            | SessionError::ChannelClosed(_)
            | SessionError::Transport(_)
    )
}

async fn run_client(index: usize, ctx: Arc<ClientContext>) -> ClientOutcome {
    tokio::time::sleep(ramp_offset(index, ctx.load.clients, ctx.load.ramp_up_ms)).await;

    let token = match ctx.tokens.token_for(index).await {
        Ok(token) => token,
        Err(e) => {
            tracing::warn!(client = index, "Credential acquisition failed: {}", e);
            ctx.sink.increment(metrics::AUTH_FAILURE);
            ctx.progress.failed.fetch_add(1, Ordering::Relaxed);
            return ClientOutcome::AuthFailed;
        }
    };

    let session = Session::with_label(
        ctx.session.clone(),
        ctx.connector.clone(),
        format!("client-{}", index),
    );
    let listeners = register_listeners(&session, &ctx);

    let (connected, latency) = {
        let _permit = ctx.handshakes.acquire().await;
        let started = Instant::now();
        let connected = session.connect(&token).await;
        (connected, elapsed_ms(started))
    };
    if let Err(e) = connected {
        ctx.sink.increment(&qualified(metrics::CONNECT_FAILURE, e.kind()));
        ctx.progress.failed.fetch_add(1, Ordering::Relaxed);
        return ClientOutcome::ConnectFailed;
    }
    ctx.sink.increment(metrics::CONNECT_SUCCESS);
    ctx.sink.record(metrics::CONNECT_LATENCY, latency);
    ctx.progress.connected.fetch_add(1, Ordering::Relaxed);
    ctx.progress.active.fetch_add(1, Ordering::Relaxed);

    let outcome = run_script(index, &session, &ctx, listeners.inbound).await;

    // Nothing waits for events once the script is over
    for (name, forwarder) in &listeners.forwarders {
        session.off(name, forwarder);
    }

    if outcome == ClientOutcome::Completed && ctx.load.hold_ms > 0 {
        tokio::time::sleep(Duration::from_millis(ctx.load.hold_ms)).await;
    }
    if outcome == ClientOutcome::Dropped {
        ctx.sink.increment(metrics::SESSION_DROPPED);
    }

    let _ = session.close().await;
    ctx.progress.active.fetch_sub(1, Ordering::Relaxed);
    outcome
}

/// Handlers a client registers before connecting
struct Listeners {
    /// Names of awaited events, in arrival order
    inbound: mpsc::UnboundedReceiver<String>,
    forwarders: Vec<(String, EventHandler)>,
}

/// Count listened events and feed the awaited ones to `wait_for` steps
fn register_listeners(session: &Session, ctx: &ClientContext) -> Listeners {
    let names: HashSet<&String> = ctx.load.listen.iter().chain(ctx.awaited.iter()).collect();
    for name in names {
        let sink = ctx.sink.clone();
        let metric = qualified(metrics::EVENT_RECEIVED, name);
        session.on(
            name,
            handler(move |_| {
                sink.increment(&metric);
                Ok(None)
            }),
        );
    }

    let (tx, inbound) = mpsc::unbounded_channel();
    let forwarders = ctx
        .awaited
        .iter()
        .map(|name| {
            let tx = tx.clone();
            let forwarded = name.clone();
            let forwarder = handler(move |_| {
                let _ = tx.send(forwarded.clone());
                Ok(None)
            });
            session.on(name, forwarder.clone());
            (name.clone(), forwarder)
        })
        .collect();

    Listeners { inbound, forwarders }
}

async fn run_script(
    index: usize,
    session: &Session,
    ctx: &ClientContext,
    mut inbound: mpsc::UnboundedReceiver<String>,
) -> ClientOutcome {
    for iteration in 0..ctx.load.iterations {
        for step in &ctx.load.script {
            let result = match step {
                ScriptStep::Emit {
                    event,
                    args,
                    ack,
                    timeout_ms,
                } => emit(session, ctx, event, args, *ack, *timeout_ms).await,
                ScriptStep::Sleep { ms } => {
                    tokio::time::sleep(Duration::from_millis(*ms)).await;
                    Ok(())
                }
                ScriptStep::WaitFor { event, timeout_ms } => {
                    wait_for(ctx, &mut inbound, event, *timeout_ms).await;
                    Ok(())
                }
            };

            if let Err(e) = result {
                tracing::warn!(client = index, iteration, "Session lost mid-script: {}", e);
                return ClientOutcome::Dropped;
            }
        }
    }

    if session.is_connected().await {
        ClientOutcome::Completed
    } else {
        ClientOutcome::Dropped
    }
}

/// Run one emit step; only errors that end the session are returned
async fn emit(
    session: &Session,
    ctx: &ClientContext,
    event: &str,
    args: &[Value],
    ack: bool,
    timeout_ms: Option<u64>,
) -> Result<(), SessionError> {
    if !ack {
        session.emit(event, args.to_vec()).await?;
        ctx.sink.increment(metrics::EMIT_SENT);
        return Ok(());
    }

    let timeout = timeout_ms.map_or(ctx.session.ack_timeout, Duration::from_millis);
    let started = Instant::now();
    match session.emit_with_ack_timeout(event, args.to_vec(), timeout).await {
        Ok(_) => {
            ctx.sink.increment(metrics::ACK_SUCCESS);
            ctx.sink.record(metrics::ACK_RTT, elapsed_ms(started));
            Ok(())
        }
        Err(e) => {
            ctx.sink.increment(&qualified(metrics::ACK_FAILURE, e.kind()));
            if ends_session(&e) {
                Err(e)
            } else {
                Ok(())
            }
        }
    }
}

async fn wait_for(
    ctx: &ClientContext,
    inbound: &mut mpsc::UnboundedReceiver<String>,
    event: &str,
    timeout_ms: u64,
) {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        match tokio::time::timeout_at(deadline, inbound.recv()).await {
            Ok(Some(name)) if name == event => {
                ctx.sink.increment(metrics::WAIT_SUCCESS);
                return;
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => {
                ctx.sink.increment(metrics::WAIT_TIMEOUT);
                return;
            }
        }
    }
}
