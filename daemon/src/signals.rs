//! Signal wiring for the daemon.
//!
//! SIGINT and SIGTERM stop the daemon; SIGHUP is trapped and swallowed.
//! Without a handler the default disposition would terminate the process, and
//! a terminal hangup must not tear down the intercept mid-session.

use anyhow::Result;
use tokio::signal::unix::{Signal, SignalKind, signal};

pub struct Signals {
    interrupt: Signal,
    terminate: Signal,
    hangup: Signal,
}

impl Signals {
    pub fn install() -> Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            // Registering the stream is what turns SIGHUP into a no-op.
            hangup: signal(SignalKind::hangup())?,
        })
    }

    /// Resolves when the daemon should stop; hangups arriving in the
    /// meantime are consumed and logged away.
    pub async fn terminated(&mut self) {
        loop {
            tokio::select! {
                _ = self.interrupt.recv() => return,
                _ = self.terminate.recv() => return,
                _ = self.hangup.recv() => {
                    tracing::debug!("ignoring SIGHUP");
                }
            }
        }
    }
}
