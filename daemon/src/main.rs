//! The podlink daemon: makes this workstation resolve and reach cluster
//! services as if it were a pod.
//!
//! An external driver publishes routing tables over the control API; the
//! interceptor turns them into NAT rules and DNS bindings; intercepted TCP
//! flows come back through the transparent proxy and leave through the SOCKS5
//! tunnel into the cluster.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod api;
mod interceptor;
mod proxy;
mod signals;

use anyhow::{Context as _, Result, anyhow};
use clap::Parser;
use dns_control::SearchDomainRestore;
use intercept_model::{NameRegistry, Table};
use interceptor::Interceptor;
use nat_redirect::Translator;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Addresses the intercept DNS server listens on.
    #[arg(long, env = "PODLINK_DNS_LISTEN", default_value = "127.0.0.1:1233")]
    dns_listen: Vec<SocketAddr>,

    /// Fallback resolver that non-intercepted queries are relayed to.
    ///
    /// Defaults to the first nameserver in `/etc/resolv.conf`.
    #[arg(long, env = "PODLINK_DNS_FALLBACK")]
    dns_fallback: Option<SocketAddr>,

    /// Port the NAT rules redirect intercepted TCP connections to.
    #[arg(long, env = "PODLINK_PROXY_PORT", default_value_t = 1234)]
    proxy_port: u16,

    /// Maximum number of concurrently proxied connections.
    #[arg(long, env = "PODLINK_PROXY_LIMIT", default_value_t = 1024)]
    proxy_limit: usize,

    /// SOCKS5 endpoint of the tunnel into the cluster.
    #[arg(long, env = "PODLINK_SOCKS", default_value = "127.0.0.1:1080")]
    socks: SocketAddr,

    /// Control API listen address; port 0 picks an ephemeral port.
    #[arg(long, env = "PODLINK_API_LISTEN", default_value = "127.0.0.1:0")]
    api_listen: SocketAddr,

    /// Suffix the host's DNS search path is pointed at (macOS only).
    #[arg(long, env = "PODLINK_SEARCH_DOMAIN", default_value = "cluster.local")]
    search_domain: String,

    /// Name of the iptables chain / pf anchor owned by this process.
    #[arg(long, env = "PODLINK_NAT_SCOPE", default_value = "podlink")]
    nat_scope: String,

    /// JSON file with routes for the reserved `bootstrap` table, applied
    /// before the control API comes up.
    #[arg(long, env = "PODLINK_BOOTSTRAP")]
    bootstrap: Option<PathBuf>,
}

#[expect(
    clippy::print_stderr,
    reason = "No logger is active when we are printing this error."
)]
fn main() {
    match try_main() {
        Ok(()) => {}
        Err(e) => {
            // Print the chain manually so a startup failure doesn't look like
            // a crash with a stacktrace.
            eprintln!("{e:#}");

            std::process::exit(1);
        }
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting {}",
        env!("CARGO_PKG_NAME")
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    let result = rt.block_on(run(cli));
    rt.shutdown_timeout(Duration::from_secs(1));

    result
}

async fn run(cli: Cli) -> Result<()> {
    let registry = Arc::new(NameRegistry::new());

    let fallback = match cli.dns_fallback {
        Some(addr) => addr,
        None => system_fallback()
            .context("no --dns-fallback given and none usable in /etc/resolv.conf")?,
    };
    tracing::debug!(%fallback, "using fallback resolver");

    let dns = udp_dns_server::Server::bind(&cli.dns_listen, fallback).await?;
    let dns_port = dns
        .local_addrs()
        .first()
        .context("DNS server has no listeners")?
        .port();

    let translator = Arc::new(Translator::new(nat_redirect::Config {
        scope: cli.nat_scope.clone(),
        tcp_port: cli.proxy_port,
        // NATed UDP (cluster DNS, chiefly) lands on our own DNS listener.
        udp_port: dns_port,
    }));

    let mut signals = signals::Signals::install()?;

    let proxy =
        proxy::Proxy::bind(cli.proxy_port, cli.proxy_limit, cli.socks, translator.clone()).await?;
    tracing::info!(
        addr = %proxy.local_addr()?,
        limit = cli.proxy_limit,
        "Proxying intercepted TCP"
    );

    let api_listener = TcpListener::bind(cli.api_listen)
        .await
        .with_context(|| format!("failed to bind control API on {}", cli.api_listen))?;
    tracing::info!(addr = %api_listener.local_addr()?, "Control API listening");

    // The last acquisition: everything after this point must funnel into the
    // teardown path so the kernel redirect policy is released again.
    let interceptor = Interceptor::spawn(translator, registry)?;

    if let Some(path) = &cli.bootstrap {
        match load_bootstrap(path) {
            Ok(table) => {
                if let Err(e) = interceptor.update(table).await {
                    tracing::warn!("failed to apply bootstrap table: {e:#}");
                }
            }
            Err(e) => tracing::warn!(path = %path.display(), "ignoring bootstrap table: {e:#}"),
        }
    }

    let restore = match dns_control::override_search_domains(&cli.search_domain).await {
        Ok(restore) => Some(restore),
        Err(e) => {
            tracing::warn!("failed to override host search domains: {e:#}");
            None
        }
    };

    let (api_shutdown, api_shutdown_rx) = oneshot::channel();
    let mut api_task = tokio::spawn({
        let interceptor = interceptor.clone();
        async move {
            api::serve(api_listener, interceptor, api_shutdown_rx)
                .await
                .map_err(anyhow::Error::from)
        }
    });
    let mut dns_task = tokio::spawn(dns.run(Arc::new(interceptor.clone())));
    let mut proxy_task = tokio::spawn(proxy.run());

    let result = tokio::select! {
        () = signals.terminated() => {
            tracing::info!("Caught SIGINT / SIGTERM");
            Ok(())
        }
        result = &mut dns_task => fatal("DNS server", result),
        result = &mut proxy_task => fatal("TCP proxy", result),
        result = &mut api_task => fatal("control API", result),
    };

    // Orderly teardown; a second signal skips whatever is left of it.
    tokio::select! {
        () = teardown(restore, api_shutdown, &interceptor) => {}
        () = signals.terminated() => {
            tracing::warn!("second signal, exiting without full cleanup");
        }
    }

    result
}

async fn teardown(
    restore: Option<SearchDomainRestore>,
    api_shutdown: oneshot::Sender<()>,
    interceptor: &Interceptor,
) {
    if let Some(restore) = restore {
        restore.restore().await;
    }
    let _ = api_shutdown.send(());

    // Drains all tables and releases the kernel redirect policy.
    if let Err(e) = interceptor.stop().await {
        tracing::warn!("interceptor did not stop cleanly: {e:#}");
    }
}

fn fatal(what: &'static str, result: Result<Result<()>, JoinError>) -> Result<()> {
    match result {
        Ok(Ok(())) => Err(anyhow!("{what} stopped unexpectedly")),
        Ok(Err(e)) => Err(e.context(format!("{what} failed"))),
        Err(e) => Err(anyhow!(e).context(format!("{what} panicked"))),
    }
}

/// First nameserver from `/etc/resolv.conf`, on the standard DNS port.
fn system_fallback() -> Result<SocketAddr> {
    let content = std::fs::read_to_string("/etc/resolv.conf")
        .context("failed to read /etc/resolv.conf")?;
    let config =
        resolv_conf::Config::parse(&content).context("failed to parse /etc/resolv.conf")?;
    let nameserver = config
        .nameservers
        .first()
        .cloned()
        .context("/etc/resolv.conf lists no nameservers")?;

    Ok(SocketAddr::new(nameserver.into(), 53))
}

fn load_bootstrap(path: &Path) -> Result<Table> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut table: Table =
        serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))?;

    // Whatever the file calls itself, it becomes the reserved table.
    table.name = Table::BOOTSTRAP.to_owned();

    Ok(table)
}
