//! macOS integration: `networksetup` owns the per-service search domains and
//! `mDNSResponder` owns the system DNS cache (it re-reads configuration and
//! drops its cache on SIGHUP).

use anyhow::{Context as _, Result};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::Command;

pub(crate) async fn flush_caches() {
    let output = match Command::new("ps")
        .args(["ax", "-o", "pid=,comm="])
        .output()
        .await
    {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!("failed to list processes for DNS cache flush: {e}");
            return;
        }
    };

    for pid in mdns_responder_pids(&String::from_utf8_lossy(&output.stdout)) {
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGHUP) {
            tracing::warn!(pid, "failed to SIGHUP mDNSResponder: {e}");
        }
    }
}

fn mdns_responder_pids(ps_output: &str) -> Vec<i32> {
    ps_output
        .lines()
        .filter_map(|line| {
            let (pid, comm) = line.trim_start().split_once(' ')?;
            comm.to_lowercase()
                .contains("mdnsresponder")
                .then(|| pid.parse().ok())?
        })
        .collect()
}

pub(crate) async fn override_search_domains(domain: &str) -> Result<Restore> {
    let output = Command::new("networksetup")
        .arg("-listallnetworkservices")
        .output()
        .await
        .context("failed to run `networksetup -listallnetworkservices`")?;

    let mut saved = Vec::new();
    for service in network_services(&String::from_utf8_lossy(&output.stdout)) {
        let previous = match Command::new("networksetup")
            .args(["-getsearchdomains", &service])
            .output()
            .await
        {
            Ok(output) => search_domains(&String::from_utf8_lossy(&output.stdout)),
            Err(e) => {
                tracing::warn!(%service, "failed to read search domains: {e}");
                continue;
            }
        };

        if let Err(e) = set_search_domains(&service, &[domain.to_owned()]).await {
            tracing::warn!(%service, "failed to override search domains: {e}");
            continue;
        }

        tracing::debug!(%service, ?previous, domain, "overrode search domains");
        saved.push((service, previous));
    }

    Ok(Restore { saved })
}

pub(crate) struct Restore {
    saved: Vec<(String, Vec<String>)>,
}

impl Restore {
    pub(crate) async fn restore(self) {
        for (service, domains) in self.saved {
            if let Err(e) = set_search_domains(&service, &domains).await {
                tracing::warn!(%service, "failed to restore search domains: {e}");
            }
        }
    }
}

async fn set_search_domains(service: &str, domains: &[String]) -> Result<()> {
    let mut command = Command::new("networksetup");
    command.args(["-setsearchdomains", service]);
    if domains.is_empty() {
        // `networksetup`'s own sentinel for "no search domains".
        command.arg("Empty");
    } else {
        command.args(domains);
    }

    let status = command.status().await.context("failed to run `networksetup`")?;
    anyhow::ensure!(status.success(), "`networksetup` exited with {status}");

    Ok(())
}

/// Parses `networksetup -listallnetworkservices`: a banner line followed by
/// one service per line, disabled services prefixed with `*`.
fn network_services(output: &str) -> Vec<String> {
    output
        .lines()
        .skip(1)
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('*'))
        .map(str::to_owned)
        .collect()
}

/// Parses `networksetup -getsearchdomains`: either one domain per line or a
/// sentence stating none are set.
fn search_domains(output: &str) -> Vec<String> {
    if output.contains("aren't any Search Domains") {
        return Vec::new();
    }

    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_banner_and_disabled_services() {
        let output = "\
An asterisk (*) denotes that a network service is disabled.
Wi-Fi
*Thunderbolt Bridge
USB 10/100/1000 LAN
";

        assert_eq!(network_services(output), ["Wi-Fi", "USB 10/100/1000 LAN"]);
    }

    #[test]
    fn no_search_domains_parses_to_empty() {
        assert_eq!(
            search_domains("There aren't any Search Domains set on Wi-Fi.\n"),
            Vec::<String>::new()
        );
        assert_eq!(
            search_domains("svc.cluster.local\ncluster.local\n"),
            ["svc.cluster.local", "cluster.local"]
        );
    }

    #[test]
    fn finds_mdns_responder_processes() {
        let ps = "\
    1 /sbin/launchd
  321 /usr/sbin/mDNSResponder
  322 /usr/sbin/mDNSResponderHelper
  999 /usr/bin/ssh-agent
";

        assert_eq!(mdns_responder_pids(ps), [321, 322]);
    }
}
