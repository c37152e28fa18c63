//! Platform-specific integration with the host's resolver.
//!
//! Two concerns live here: flushing the host's DNS caches after the routing
//! tables change (so applications stop trusting stale answers), and the macOS
//! search-domain override that makes the intercept DNS server authoritative
//! for the configured suffix.
//!
//! Everything is best-effort: a missing cache tool or an uncooperative
//! `networksetup` is logged, never fatal.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use anyhow::Result;

#[cfg(target_os = "linux")]
#[path = "linux.rs"]
mod platform;

#[cfg(target_os = "macos")]
#[path = "macos.rs"]
mod platform;

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
#[path = "noop.rs"]
mod platform;

/// Asks the host to drop any cached DNS answers.
pub async fn flush_caches() {
    platform::flush_caches().await;
}

/// Points the host's DNS search path at `domain` and remembers what it
/// replaced.
///
/// Only does anything on macOS, where `networksetup` owns the per-service
/// search domains. The returned restorer must be consumed via
/// [`SearchDomainRestore::restore`] on shutdown.
pub async fn override_search_domains(domain: &str) -> Result<SearchDomainRestore> {
    Ok(SearchDomainRestore {
        inner: platform::override_search_domains(domain).await?,
    })
}

/// Undo handle for [`override_search_domains`].
#[must_use = "dropping the restorer leaves the host's search domains overridden"]
pub struct SearchDomainRestore {
    inner: platform::Restore,
}

impl SearchDomainRestore {
    /// Puts every network service's search domains back the way they were.
    pub async fn restore(self) {
        self.inner.restore().await;
    }
}
