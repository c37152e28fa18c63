//! pf backend: `rdr` rules in a dedicated anchor, plus host routes pointing
//! the synthetic addresses at loopback so the anchor sees the traffic.
//!
//! pf has no per-rule add/remove; the anchor's ruleset is regenerated from
//! the current rule map and reloaded on every change.

use crate::{Config, Error, Protocol, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::Write as _;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::RawFd;
use std::process::{Command, Stdio};

pub(crate) struct Backend {
    config: Config,
    /// Reference token handed out by `pfctl -E`, spent by `pfctl -X`.
    token: Mutex<Option<String>>,
    rules: Mutex<BTreeMap<(Ipv4Addr, &'static str), String>>,
}

impl Backend {
    pub(crate) fn new(config: Config) -> Self {
        Self {
            config,
            token: Mutex::new(None),
            rules: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn enable(&self) -> Result<()> {
        let anchor = &self.config.scope;

        // Hook the anchor into the main ruleset. pf evaluates named anchors
        // only when the main ruleset references them.
        let hooks = format!("pass on lo0\nrdr-anchor \"{anchor}\"\nanchor \"{anchor}\"\n");
        run("pfctl", &["-f", "-"], Some(&hooks))?;
        run("pfctl", &["-a", anchor, "-F", "all"], None)?;

        let output = run("pfctl", &["-E"], None)?;
        *self.token.lock() = parse_enable_token(&output);

        tracing::debug!(%anchor, "Enabled pf redirect anchor");

        Ok(())
    }

    pub(crate) fn disable(&self) -> Result<()> {
        let anchor = &self.config.scope;

        if let Err(e) = run("pfctl", &["-a", anchor, "-F", "all"], None) {
            tracing::warn!(%anchor, "failed to flush redirect anchor: {e}");
        }
        let rules = std::mem::take(&mut *self.rules.lock());
        for (ip, _) in rules.into_keys() {
            delete_loopback_route(ip);
        }
        if let Some(token) = self.token.lock().take() {
            if let Err(e) = run("pfctl", &["-X", &token], None) {
                tracing::warn!("failed to release pf reference: {e}");
            }
        }

        Ok(())
    }

    pub(crate) fn install(&self, proto: Protocol, ip: Ipv4Addr) -> Result<()> {
        let port = match proto {
            Protocol::Tcp => self.config.tcp_port,
            Protocol::Udp => self.config.udp_port,
        };
        let rule = format!(
            "rdr pass on lo0 inet proto {proto} from any to {ip} -> 127.0.0.1 port {port}",
            proto = proto.name(),
        );

        let ruleset = {
            let mut rules = self.rules.lock();
            rules.insert((ip, proto.name()), rule);
            render_ruleset(&rules)
        };
        self.load_anchor(&ruleset)?;

        // Datagrams and SYNs to the synthetic address must be steered onto
        // lo0 before the rdr rule can translate them.
        if let Err(e) = run(
            "route",
            &["add", "-host", &ip.to_string(), "127.0.0.1"],
            None,
        ) {
            tracing::debug!(%ip, "loopback route not added (may already exist): {e}");
        }

        Ok(())
    }

    pub(crate) fn remove(&self, proto: Protocol, ip: Ipv4Addr) -> Result<()> {
        let (ruleset, ip_still_routed) = {
            let mut rules = self.rules.lock();
            rules.remove(&(ip, proto.name()));
            let still_routed = rules.keys().any(|(other, _)| *other == ip);
            (render_ruleset(&rules), still_routed)
        };
        self.load_anchor(&ruleset)?;

        if !ip_still_routed {
            delete_loopback_route(ip);
        }

        Ok(())
    }

    /// Finds the pf state entry created for the redirected connection and
    /// returns the pre-translation destination address.
    pub(crate) fn original_dst_ip(&self, _fd: RawFd, peer: SocketAddr) -> Result<Ipv4Addr> {
        let output = run("pfctl", &["-s", "states"], None)?;

        parse_original_dst(&output, peer).ok_or(Error::UnknownConnection(peer))
    }

    fn load_anchor(&self, ruleset: &str) -> Result<()> {
        run(
            "pfctl",
            &["-a", &self.config.scope, "-f", "-"],
            Some(ruleset),
        )?;

        Ok(())
    }
}

fn render_ruleset(rules: &BTreeMap<(Ipv4Addr, &'static str), String>) -> String {
    let mut ruleset = String::new();
    for rule in rules.values() {
        ruleset.push_str(rule);
        ruleset.push('\n');
    }
    ruleset
}

fn delete_loopback_route(ip: Ipv4Addr) {
    if let Err(e) = run(
        "route",
        &["delete", "-host", &ip.to_string(), "127.0.0.1"],
        None,
    ) {
        tracing::warn!(%ip, "failed to delete loopback route: {e}");
    }
}

/// `pfctl -E` prints the reference token on stderr as `Token : NNNN`.
fn parse_enable_token(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.strip_prefix("Token :"))
        .map(|token| token.trim().to_owned())
}

/// Scans `pfctl -s states` output for the entry whose far end is `peer`.
///
/// A state created by an rdr rule renders with two arrows, e.g.
/// `ALL tcp 127.0.0.1:1234 <- 10.0.0.1:9000 <- 127.0.0.1:54321`; the middle
/// address is the destination the client actually dialed.
fn parse_original_dst(states: &str, peer: SocketAddr) -> Option<Ipv4Addr> {
    let peer = peer.to_string();

    for line in states.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [_, "tcp", _, "<-", original, "<-", source, ..] if *source == peer => {
                let (ip, _port) = original.rsplit_once(':')?;
                return ip.parse().ok();
            }
            _ => {}
        }
    }

    None
}

fn run(command: &'static str, args: &[&str], stdin: Option<&str>) -> Result<String> {
    let mut child = Command::new(command)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| Error::Command { command, source })?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes())
            .map_err(|source| Error::Command { command, source })?;
    }

    let output = child
        .wait_with_output()
        .map_err(|source| Error::Command { command, source })?;

    // pfctl writes diagnostics to stderr even on success; keep both streams.
    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );

    if !output.status.success() {
        return Err(Error::CommandFailed {
            command,
            status: output.status,
            stderr: combined,
        });
    }

    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_enable_token() {
        let output = "pf enabled\nToken : 16170759\n";

        assert_eq!(parse_enable_token(output), Some("16170759".to_owned()));
    }

    #[test]
    fn finds_original_destination_by_client_port() {
        let states = "\
ALL tcp 127.0.0.1:631 <- 127.0.0.1:52114       ESTABLISHED:ESTABLISHED
ALL tcp 127.0.0.1:1234 <- 10.0.0.1:9000 <- 127.0.0.1:54321       ESTABLISHED:ESTABLISHED
ALL udp 192.168.1.5:53 -> 8.8.8.8:53       MULTIPLE:SINGLE
";
        let peer = "127.0.0.1:54321".parse().unwrap();

        assert_eq!(
            parse_original_dst(states, peer),
            Some(Ipv4Addr::new(10, 0, 0, 1))
        );
    }

    #[test]
    fn unmatched_client_port_yields_none() {
        let states = "ALL tcp 127.0.0.1:1234 <- 10.0.0.1:9000 <- 127.0.0.1:54321\n";
        let peer = "127.0.0.1:50000".parse().unwrap();

        assert_eq!(parse_original_dst(states, peer), None);
    }
}
