//! Fan-out of progress events to the connected client and the session log.

use crate::{protocol::Message, session_log::SessionLog};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Handle through which every part of a session reports progress. Cloneable,
/// so subprocess drain tasks can own one each.
#[derive(Clone)]
pub struct Reporter {
    tx: UnboundedSender<Message>,
    log: SessionLog,
}

impl Reporter {
    pub fn new(tx: UnboundedSender<Message>, log: SessionLog) -> Self { Self { tx, log } }

    /// A reporter whose events are printed to stdout instead of a socket;
    /// used by stage 2, which runs before any client can connect.
    pub fn stdout(log: SessionLog) -> Self {
        let (tx, mut rx): (_, UnboundedReceiver<Message>) = unbounded_channel();

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    Message::Info { info } | Message::Shutdown { info } => println!("{}", info),
                    Message::Fatal { info } => eprintln!("{}", info),
                    Message::Check { .. } => (),
                }
            }
        });

        Self { tx, log }
    }

    pub fn log(&self) -> &SessionLog { &self.log }

    /// Relays a progress line and appends it to the session log.
    pub fn info(&self, line: impl Into<String>) {
        let line = line.into();
        self.log.append(&line);
        let _ = self.tx.send(Message::Info { info: line });
    }

    /// Reports a terminal error and snapshots the session log for
    /// post-mortem debugging.
    pub fn fatal(&self, line: impl Into<String>) {
        let line = line.into();
        error!("{}", line);
        self.log.append(&line);
        self.log.snapshot_failure();
        let _ = self.tx.send(Message::Fatal { info: line });
    }

    pub fn shutdown(&self, line: impl Into<String>) {
        let line = line.into();
        self.log.append(&line);
        let _ = self.tx.send(Message::Shutdown { info: line });
    }

    pub fn send(&self, message: Message) { let _ = self.tx.send(message); }
}
