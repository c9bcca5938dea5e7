//! The control-socket daemon: accepts line-oriented JSON requests and
//! streams progress events back while a session runs.
//!
//! Connections are served concurrently with the long-running upgrade task,
//! but at most one session is ever in flight; the status flag refuses the
//! rest. An interrupt signal triggers the shutdown manager, which releases
//! the offline image device before the process exits.

mod status;

pub use self::status::DaemonStatus;

use crate::{
    config::DaemonConfig,
    events::Reporter,
    misc::format_error,
    offline::OfflineImage,
    protocol::{Message, Request},
    session_log::SessionLog,
    sighandler, upgrade,
};
use async_shutdown::ShutdownManager as Shutdown;
use atomic::{Atomic, Ordering};
use futures::StreamExt;
use std::{io, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{tcp::OwnedWriteHalf, TcpListener, TcpStream},
    sync::mpsc::unbounded_channel,
    time::sleep,
};
use tokio_stream::wrappers::LinesStream;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("failed to bind the control socket at {addr}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

struct SharedState {
    status: Atomic<DaemonStatus>,
    offline: OfflineImage,
    config: DaemonConfig,
    log: SessionLog,
    shutdown: Shutdown<()>,
}

pub struct Daemon;

impl Daemon {
    pub async fn init(addr: &str) -> Result<(), DaemonError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| DaemonError::Bind { addr: addr.to_owned(), source })?;

        info!("listening for control connections on {}", addr);

        let state = Arc::new(SharedState {
            status: Atomic::new(DaemonStatus::Inactive),
            offline: OfflineImage::default(),
            config: DaemonConfig::load(),
            log: SessionLog::default(),
            shutdown: Shutdown::new(),
        });

        // Latch interrupts into the shutdown manager, so cleanup runs even
        // when a session is mid-flight.
        tokio::spawn(enclose!((state) async move {
            loop {
                if let Some(signal) = sighandler::status() {
                    warn!("caught {} signal, shutting down", signal);
                    let _ = state.shutdown.trigger_shutdown(());
                    break;
                }

                sleep(Duration::from_millis(500)).await;
            }
        }));

        // The one guaranteed cleanup path: an attached image device never
        // outlives the daemon.
        tokio::spawn(enclose!((state) async move {
            let _ = state.shutdown.wait_shutdown_triggered().await;
            state.offline.detach().await;
            std::process::exit(1);
        }));

        loop {
            let stream = match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("client connected from {}", peer);
                    stream
                }
                Err(why) => {
                    error!("failed to accept a control connection: {}", why);
                    continue;
                }
            };

            tokio::spawn(enclose!((state) async move {
                handle_client(stream, state).await;
            }));
        }
    }
}

async fn handle_client(stream: TcpStream, state: Arc<SharedState>) {
    let (reader, writer) = stream.into_split();

    let (tx, rx) = unbounded_channel::<Message>();
    let writer_task = tokio::spawn(write_events(writer, rx));

    let reporter = Reporter::new(tx, state.log.clone());

    let mut lines = LinesStream::new(BufReader::new(reader).lines());

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };

        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Request>(&line) {
            Ok(request) => dispatch(request, &state, reporter.clone()).await,
            Err(why) => reporter.fatal(fomat!("invalid request envelope: " (why))),
        }
    }

    drop(reporter);
    let _ = writer_task.await;
}

async fn dispatch(request: Request, state: &Arc<SharedState>, reporter: Reporter) {
    match request {
        Request::Check => {
            if !acquire(state, DaemonStatus::Checking) {
                reporter.fatal("another session is already active");
                return;
            }

            if let Err(why) =
                upgrade::check(&state.config, state.offline.clone(), &reporter).await
            {
                reporter.fatal(format_error(&why));
            }

            release(state);
        }
        Request::Update(request) => {
            if !acquire(state, DaemonStatus::Updating) {
                reporter.fatal("another update session is already active");
                return;
            }

            // The session runs on its own task so this connection, and any
            // other, keeps being served while it progresses.
            let state = Arc::clone(state);

            tokio::spawn(async move {
                let result = upgrade::update(
                    request,
                    &state.config,
                    state.offline.clone(),
                    &reporter,
                )
                .await;

                match result {
                    Ok(()) => info!("update session finished"),
                    Err(why) => reporter.fatal(format_error(&why)),
                }

                release(&state);
            });
        }
    }
}

fn acquire(state: &SharedState, status: DaemonStatus) -> bool {
    state
        .status
        .compare_exchange(DaemonStatus::Inactive, status, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}

fn release(state: &SharedState) {
    state.status.store(DaemonStatus::Inactive, Ordering::SeqCst);
}

async fn write_events(
    mut writer: OwnedWriteHalf,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = rx.recv().await {
        let mut line = match serde_json::to_string(&message) {
            Ok(line) => line,
            Err(why) => {
                error!("failed to encode an event: {}", why);
                continue;
            }
        };

        line.push('\n');

        if writer.write_all(line.as_bytes()).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_session_gate() {
        let state = SharedState {
            status: Atomic::new(DaemonStatus::Inactive),
            offline: OfflineImage::default(),
            config: DaemonConfig::default(),
            log: SessionLog::new("/tmp/snapup-test.log"),
            shutdown: Shutdown::new(),
        };

        assert!(acquire(&state, DaemonStatus::Updating));
        assert!(!acquire(&state, DaemonStatus::Updating));
        assert!(!acquire(&state, DaemonStatus::Checking));

        release(&state);
        assert!(acquire(&state, DaemonStatus::Checking));
    }
}
