//! Fallback backend for platforms without a supported redirect mechanism.
//! Rule operations succeed silently; destination recovery cannot work.

use crate::{Config, Error, Protocol, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::RawFd;

pub(crate) struct Backend {}

impl Backend {
    pub(crate) fn new(_config: Config) -> Self {
        Self {}
    }

    pub(crate) fn enable(&self) -> Result<()> {
        tracing::warn!("packet redirection is not supported on this platform; NAT rules are no-ops");

        Ok(())
    }

    pub(crate) fn disable(&self) -> Result<()> {
        Ok(())
    }

    pub(crate) fn install(&self, _proto: Protocol, _ip: Ipv4Addr) -> Result<()> {
        Ok(())
    }

    pub(crate) fn remove(&self, _proto: Protocol, _ip: Ipv4Addr) -> Result<()> {
        Ok(())
    }

    pub(crate) fn original_dst_ip(&self, _fd: RawFd, _peer: SocketAddr) -> Result<Ipv4Addr> {
        Err(Error::Unsupported)
    }
}
