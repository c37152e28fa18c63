//! On Linux the search path is already served through the NATed resolver, so
//! only cache flushing applies: `nscd` for the legacy hosts cache and
//! `resolvectl` for systemd-resolved.

use anyhow::Result;
use tokio::process::Command;

pub(crate) async fn flush_caches() {
    flush("nscd", &["--invalidate=hosts"]).await;
    flush("resolvectl", &["flush-caches"]).await;
}

async fn flush(program: &str, args: &[&str]) {
    match Command::new(program).args(args).status().await {
        Ok(status) if status.success() => {
            tracing::debug!(%program, "flushed host DNS cache");
        }
        Ok(status) => {
            tracing::warn!(%program, %status, "host DNS cache flush returned non-zero");
        }
        // Most hosts run only one of the two cache daemons.
        Err(e) => {
            tracing::debug!(%program, "host DNS cache flush unavailable: {e}");
        }
    }
}

pub(crate) async fn override_search_domains(_domain: &str) -> Result<Restore> {
    Ok(Restore {})
}

pub(crate) struct Restore {}

impl Restore {
    pub(crate) async fn restore(self) {}
}
