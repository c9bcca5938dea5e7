//! Thin client: submits one request to the daemon and renders the event
//! stream until the session ends.

use crate::{
    plan::UpdatePlan,
    protocol::{Message, Request},
};
use std::{io, time::Duration};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    time::sleep,
};
use yansi::Paint;

/// Exit code reported when a `check` found pending updates.
pub const EXIT_UPDATES_AVAILABLE: i32 = 10;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to the upgrade daemon at {addr}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode the request")]
    Encode(#[source] serde_json::Error),

    #[error("lost the connection to the upgrade daemon")]
    Io(#[source] io::Error),

    #[error("the daemon closed the connection without finishing the session")]
    Disconnected,
}

/// Runs one request to completion and returns the process exit code.
pub async fn run(addr: &str, request: &Request) -> Result<i32, ClientError> {
    let mut stream = connect(addr).await?;

    let mut line = serde_json::to_string(request).map_err(ClientError::Encode)?;
    line.push('\n');
    stream.write_all(line.as_bytes()).await.map_err(ClientError::Io)?;

    let mut lines = BufReader::new(stream).lines();

    while let Some(line) = lines.next_line().await.map_err(ClientError::Io)? {
        if line.trim().is_empty() {
            continue;
        }

        let message = match serde_json::from_str::<Message>(&line) {
            Ok(message) => message,
            Err(why) => {
                warn!("discarding an unreadable event: {}", why);
                continue;
            }
        };

        match message {
            Message::Info { info } => pintln!((info)),
            Message::Shutdown { info } => {
                if !info.is_empty() {
                    pintln!((info));
                }

                return Ok(0);
            }
            Message::Fatal { info } => {
                epintln!((Paint::red("error").bold()) ": " (info));
                return Ok(1);
            }
            Message::Check { updates, details } => {
                print_plan(updates, &details);
                return Ok(if updates { EXIT_UPDATES_AVAILABLE } else { 0 });
            }
        }
    }

    Err(ClientError::Disconnected)
}

/// The daemon may still be binding its socket when we race it at startup.
async fn connect(addr: &str) -> Result<TcpStream, ClientError> {
    let mut last = None;

    for _ in 0..10 {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(source) => last = Some(source),
        }

        sleep(Duration::from_millis(50)).await;
    }

    Err(ClientError::Connect {
        addr: addr.to_owned(),
        source: last
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no connection attempted")),
    })
}

fn print_plan(updates: bool, details: &UpdatePlan) {
    if !updates {
        pintln!("No updates available");
        return;
    }

    if !details.upgraded.is_empty() {
        pintln!((Paint::new("The following packages will be upgraded:").bold()));
        for pkg in &details.upgraded {
            pintln!("   " (pkg.name) ": " (pkg.old_version) " -> " (pkg.new_version));
        }
    }

    if !details.new.is_empty() {
        pintln!((Paint::new("The following packages will be installed:").bold()));
        for pkg in &details.new {
            pintln!("   " (pkg.name) ": " (pkg.version));
        }
    }

    if !details.reinstalled.is_empty() {
        pintln!((Paint::new("The following packages will be reinstalled:").bold()));
        for pkg in &details.reinstalled {
            pintln!("   " (pkg.name) " (" (pkg.reason) ")");
        }
    }

    if !details.removed.is_empty() {
        pintln!((Paint::new("The following packages will be removed:").bold()));
        for pkg in &details.removed {
            pintln!("   " (pkg.name) ": " (pkg.version));
        }
    }

    if details.kernel_up {
        pintln!();
        pintln!((Paint::yellow("A kernel update is staged first: two reboots are required").bold()));
    }
}
