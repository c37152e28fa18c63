//! iptables backend: a dedicated chain in the `nat` table, jumped to from
//! both `OUTPUT` (locally-generated traffic) and `PREROUTING`.

use crate::{Config, Error, Protocol, Result};
use parking_lot::Mutex;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::RawFd;

const TABLE: &str = "nat";

// From linux/netfilter_ipv4.h; not exported by libc.
const SO_ORIGINAL_DST: libc::c_int = 80;

pub(crate) struct Backend {
    config: Config,
    ipt: Mutex<Option<iptables::IPTables>>,
}

impl Backend {
    pub(crate) fn new(config: Config) -> Self {
        Self {
            config,
            ipt: Mutex::new(None),
        }
    }

    pub(crate) fn enable(&self) -> Result<()> {
        let chain = &self.config.scope;
        let ipt = iptables::new(false).map_err(to_error)?;

        if !ipt.chain_exists(TABLE, chain).map_err(to_error)? {
            ipt.new_chain(TABLE, chain).map_err(to_error)?;
        }
        ipt.flush_chain(TABLE, chain).map_err(to_error)?;

        let jump = format!("-j {chain}");
        for hook in ["OUTPUT", "PREROUTING"] {
            if !ipt.exists(TABLE, hook, &jump).map_err(to_error)? {
                ipt.append(TABLE, hook, &jump).map_err(to_error)?;
            }
        }

        tracing::debug!(%chain, "Enabled iptables redirect chain");
        *self.ipt.lock() = Some(ipt);

        Ok(())
    }

    pub(crate) fn disable(&self) -> Result<()> {
        let Some(ipt) = self.ipt.lock().take() else {
            return Ok(());
        };
        let chain = &self.config.scope;

        let jump = format!("-j {chain}");
        for hook in ["OUTPUT", "PREROUTING"] {
            if let Err(e) = ipt.delete(TABLE, hook, &jump) {
                tracing::warn!(%chain, hook, "failed to unlink redirect chain: {e}");
            }
        }
        if let Err(e) = ipt
            .flush_chain(TABLE, chain)
            .and_then(|()| ipt.delete_chain(TABLE, chain))
        {
            tracing::warn!(%chain, "failed to remove redirect chain: {e}");
        }

        Ok(())
    }

    pub(crate) fn install(&self, proto: Protocol, ip: Ipv4Addr) -> Result<()> {
        let rule = self.rule(proto, ip);

        self.with_ipt(|ipt, chain| {
            if !ipt.exists(TABLE, chain, &rule).map_err(to_error)? {
                ipt.append(TABLE, chain, &rule).map_err(to_error)?;
            }

            Ok(())
        })
    }

    pub(crate) fn remove(&self, proto: Protocol, ip: Ipv4Addr) -> Result<()> {
        let rule = self.rule(proto, ip);

        self.with_ipt(|ipt, chain| {
            if ipt.exists(TABLE, chain, &rule).map_err(to_error)? {
                ipt.delete(TABLE, chain, &rule).map_err(to_error)?;
            }

            Ok(())
        })
    }

    /// Reads the pre-NAT destination off a REDIRECTed socket.
    ///
    /// `SO_ORIGINAL_DST` is always available on Linux; the declared target is
    /// still looked up from the translator's map, this only recovers the IP.
    pub(crate) fn original_dst_ip(&self, fd: RawFd, _peer: SocketAddr) -> Result<Ipv4Addr> {
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

        // SAFETY: `addr` and `len` point to a properly sized sockaddr_in.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_IP,
                SO_ORIGINAL_DST,
                std::ptr::from_mut(&mut addr).cast(),
                &mut len,
            )
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        Ok(Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)))
    }

    fn rule(&self, proto: Protocol, ip: Ipv4Addr) -> String {
        let port = match proto {
            Protocol::Tcp => self.config.tcp_port,
            Protocol::Udp => self.config.udp_port,
        };

        format!(
            "-p {proto} -d {ip}/32 -j REDIRECT --to-ports {port}",
            proto = proto.name(),
        )
    }

    fn with_ipt<T>(&self, f: impl FnOnce(&iptables::IPTables, &str) -> Result<T>) -> Result<T> {
        match self.ipt.lock().as_ref() {
            Some(ipt) => f(ipt, &self.config.scope),
            None => Err(Error::Disabled),
        }
    }
}

fn to_error(e: Box<dyn std::error::Error>) -> Error {
    Error::Iptables(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_strings_redirect_to_the_scoped_port() {
        let backend = Backend::new(Config {
            scope: "PODLINK".to_owned(),
            tcp_port: 1234,
            udp_port: 1235,
        });

        assert_eq!(
            backend.rule(Protocol::Tcp, Ipv4Addr::new(10, 0, 0, 1)),
            "-p tcp -d 10.0.0.1/32 -j REDIRECT --to-ports 1234"
        );
        assert_eq!(
            backend.rule(Protocol::Udp, Ipv4Addr::new(10, 0, 0, 2)),
            "-p udp -d 10.0.0.2/32 -j REDIRECT --to-ports 1235"
        );
    }
}
