//! Kernel-level packet redirection for intercepted addresses.
//!
//! The [`Translator`] owns two things: the OS redirect policy (an iptables
//! chain on Linux, a pf anchor on macOS) and the declared-target map that
//! records, per redirected address, where the flow was meant to go. The
//! transparent proxy recovers destinations through [`Translator::original_dst`]
//! instead of trusting anything readable off the redirected socket.
//!
//! All mutations are issued from the interceptor's single worker task, so the
//! backends don't defend against concurrent rule edits.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::AsRawFd;

#[cfg(target_os = "linux")]
#[path = "linux.rs"]
mod platform;

#[cfg(target_os = "macos")]
#[path = "macos.rs"]
mod platform;

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
#[path = "noop.rs"]
mod platform;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("iptables: {0}")]
    Iptables(String),
    #[error("failed to run `{command}`: {source}")]
    Command {
        command: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: &'static str,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("redirect policy is not enabled")]
    Disabled,
    #[error("no state entry for connection from {0}")]
    UnknownConnection(SocketAddr),
    #[error("no declared route for {0}")]
    UnknownDestination(Ipv4Addr),
    #[error("packet redirection is not supported on this platform")]
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn name(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Where redirected flows land locally.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the iptables chain / pf anchor owned by this process.
    pub scope: String,
    /// Local port the transparent TCP proxy listens on.
    pub tcp_port: u16,
    /// Local port NATed UDP datagrams are pointed at.
    pub udp_port: u16,
}

pub struct Translator {
    backend: platform::Backend,
    targets: Mutex<HashMap<(Ipv4Addr, Protocol), String>>,
}

impl Translator {
    pub fn new(config: Config) -> Self {
        Self {
            backend: platform::Backend::new(config),
            targets: Mutex::new(HashMap::new()),
        }
    }

    /// Acquires the kernel redirect policy. Fatal on failure; without it the
    /// interceptor cannot do its job.
    pub fn enable(&self) -> Result<()> {
        self.backend.enable()
    }

    /// Releases the kernel redirect policy and forgets all declared targets.
    /// Idempotent.
    pub fn disable(&self) -> Result<()> {
        self.targets.lock().clear();
        self.backend.disable()
    }

    pub fn forward_tcp(&self, ip: Ipv4Addr, target: &str) -> Result<()> {
        self.forward(Protocol::Tcp, ip, target)
    }

    pub fn forward_udp(&self, ip: Ipv4Addr, target: &str) -> Result<()> {
        self.forward(Protocol::Udp, ip, target)
    }

    pub fn clear_tcp(&self, ip: Ipv4Addr) -> Result<()> {
        self.clear(Protocol::Tcp, ip)
    }

    pub fn clear_udp(&self, ip: Ipv4Addr) -> Result<()> {
        self.clear(Protocol::Udp, ip)
    }

    /// Recovers the destination a redirected connection was originally
    /// opened to, as `(ip, declared target)`.
    ///
    /// `peer` is the connection's remote (client) address; the Linux backend
    /// reads the pre-NAT address off the socket, the macOS backend finds the
    /// pf state entry for the client's source port. The returned target is
    /// always the declared one, never one read back from the socket.
    pub fn original_dst<S: AsRawFd>(&self, conn: &S, peer: SocketAddr) -> Result<(Ipv4Addr, String)> {
        let ip = self.backend.original_dst_ip(conn.as_raw_fd(), peer)?;
        let target = self
            .targets
            .lock()
            .get(&(ip, Protocol::Tcp))
            .cloned()
            .ok_or(Error::UnknownDestination(ip))?;

        Ok((ip, target))
    }

    fn forward(&self, proto: Protocol, ip: Ipv4Addr, target: &str) -> Result<()> {
        self.backend.install(proto, ip)?;
        self.targets
            .lock()
            .insert((ip, proto), target.to_owned());

        Ok(())
    }

    fn clear(&self, proto: Protocol, ip: Ipv4Addr) -> Result<()> {
        self.targets.lock().remove(&(ip, proto));
        self.backend.remove(proto, ip)
    }
}
