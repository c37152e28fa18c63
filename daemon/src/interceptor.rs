//! The single-writer coordinator for the intercept state.
//!
//! Every mutation of the routing tables, the NAT rule set and the name
//! registry flows through one worker task fed by an unbounded queue, so the
//! three structures can never disagree about a route. Public methods block on
//! a oneshot reply, which gives callers FIFO visibility: a render submitted
//! after an update observes the update.

use anyhow::{Context as _, Result, anyhow};
use intercept_model::{NameRegistry, Proto, Route, Table};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Rule mutations the coordinator drives on the packet redirector.
///
/// [`nat_redirect::Translator`] is the production implementation; tests
/// substitute a recording double.
pub trait Redirector: Send + Sync + 'static {
    fn enable(&self) -> nat_redirect::Result<()>;
    fn disable(&self) -> nat_redirect::Result<()>;
    fn forward_tcp(&self, ip: Ipv4Addr, target: &str) -> nat_redirect::Result<()>;
    fn forward_udp(&self, ip: Ipv4Addr, target: &str) -> nat_redirect::Result<()>;
    fn clear_tcp(&self, ip: Ipv4Addr) -> nat_redirect::Result<()>;
    fn clear_udp(&self, ip: Ipv4Addr) -> nat_redirect::Result<()>;
}

impl Redirector for nat_redirect::Translator {
    fn enable(&self) -> nat_redirect::Result<()> {
        self.enable()
    }

    fn disable(&self) -> nat_redirect::Result<()> {
        self.disable()
    }

    fn forward_tcp(&self, ip: Ipv4Addr, target: &str) -> nat_redirect::Result<()> {
        self.forward_tcp(ip, target)
    }

    fn forward_udp(&self, ip: Ipv4Addr, target: &str) -> nat_redirect::Result<()> {
        self.forward_udp(ip, target)
    }

    fn clear_tcp(&self, ip: Ipv4Addr) -> nat_redirect::Result<()> {
        self.clear_tcp(ip)
    }

    fn clear_udp(&self, ip: Ipv4Addr) -> nat_redirect::Result<()> {
        self.clear_udp(ip)
    }
}

/// The DNS server resolves through the interceptor, which reads the shared
/// registry without touching the queue.
impl udp_dns_server::Resolve for Interceptor {
    fn resolve(&self, domain: &str) -> Option<Route> {
        Interceptor::resolve(self, domain)
    }
}

enum Work {
    Run(Box<dyn FnOnce(&mut State) + Send>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the coordinator. Cheap to clone; all clones feed the same queue.
#[derive(Clone)]
pub struct Interceptor {
    work: mpsc::UnboundedSender<Work>,
    registry: Arc<NameRegistry>,
}

impl Interceptor {
    /// Enables the redirector and starts the worker task. Failing to acquire
    /// the kernel redirect policy is fatal.
    pub fn spawn<R: Redirector>(
        redirector: Arc<R>,
        registry: Arc<NameRegistry>,
    ) -> Result<Self> {
        redirector
            .enable()
            .context("failed to enable packet redirection")?;

        let (work, queue) = mpsc::unbounded_channel();
        let state = State {
            tables: HashMap::new(),
            owners: HashMap::new(),
            redirector,
            registry: registry.clone(),
        };
        tokio::spawn(worker(queue, state));

        Ok(Self { work, registry })
    }

    /// Replaces (or creates) the table named `table.name`. An empty route
    /// list removes the table.
    pub async fn update(&self, table: Table) -> Result<()> {
        self.submit(move |state| state.update(table)).await
    }

    /// Deletes the named table, or every table except `bootstrap` when
    /// `name` is empty. Deleting an absent table is not an error.
    pub async fn delete(&self, name: String) -> Result<()> {
        self.submit(move |state| state.delete(&name)).await
    }

    /// Renders a consistent JSON snapshot: one table when `name` is given
    /// (`None` if absent), otherwise all tables as an array.
    pub async fn render(&self, name: Option<String>) -> Result<Option<String>> {
        self.submit(move |state| state.render(name.as_deref()))
            .await?
    }

    pub fn resolve(&self, name: &str) -> Option<Route> {
        self.registry.resolve(name)
    }

    pub fn search_path(&self) -> Vec<String> {
        self.registry.search_path()
    }

    /// Search-path writes go through the queue like every other mutation.
    pub async fn set_search_path(&self, paths: Vec<String>) -> Result<()> {
        self.submit(move |state| state.registry.set_search_path(paths))
            .await
    }

    /// Tears everything down: drains all tables (including `bootstrap`) and
    /// releases the kernel redirect policy. Returns once the worker has
    /// finished; later submissions fail.
    pub async fn stop(&self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.work
            .send(Work::Shutdown(reply))
            .map_err(|_| anyhow!("interceptor is already stopped"))?;

        done.await.context("interceptor worker went away")
    }

    async fn submit<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut State) -> T + Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        self.work
            .send(Work::Run(Box::new(move |state| {
                let _ = reply.send(f(state));
            })))
            .map_err(|_| anyhow!("interceptor is stopped"))?;

        response.await.context("interceptor dropped the request")
    }
}

async fn worker(mut queue: mpsc::UnboundedReceiver<Work>, mut state: State) {
    while let Some(work) = queue.recv().await {
        match work {
            Work::Run(f) => f(&mut state),
            Work::Shutdown(reply) => {
                state.drain();
                release(&state);
                let _ = reply.send(());
                return;
            }
        }
    }

    // Every handle dropped without a stop; still release the kernel policy.
    state.drain();
    release(&state);
}

fn release(state: &State) {
    if let Err(e) = state.redirector.disable() {
        tracing::warn!("failed to release packet redirection: {e}");
    }
}

struct State {
    tables: HashMap<String, Table>,
    /// Which table currently backs each registry domain. Guards against a
    /// stale table delete clobbering a mapping another table re-stored.
    owners: HashMap<String, String>,
    redirector: Arc<dyn Redirector>,
    registry: Arc<NameRegistry>,
}

impl State {
    fn update(&mut self, table: Table) {
        let table_name = table.name.clone();

        let mut dropped: HashMap<String, Route> = self
            .tables
            .get(&table_name)
            .map(|old| {
                old.routes
                    .iter()
                    .map(|route| (route.name.clone(), route.clone()))
                    .collect()
            })
            .unwrap_or_default();

        for route in &table.routes {
            let old = dropped.remove(&route.name);
            if old.as_ref() == Some(route) {
                // Unchanged: no kernel churn, the registry entry stands.
                continue;
            }

            if let Some(old) = &old {
                self.clear_rule(old);
            }
            if !route.target.is_empty() {
                self.install_rule(route);
            }
            if !route.name.is_empty() {
                self.registry.store(route.domain(), route.clone());
                self.owners.insert(route.domain(), table_name.clone());
            }
        }

        // Whatever is left in `dropped` was in the old table but not the new.
        for route in dropped.into_values() {
            self.discard_route(&table_name, &route);
        }

        if table.routes.is_empty() {
            self.tables.remove(&table_name);
            tracing::debug!(table = %table_name, "removed empty table");
        } else {
            self.tables.insert(table_name, table);
        }
    }

    fn delete(&mut self, name: &str) {
        if name.is_empty() {
            let names: Vec<String> = self
                .tables
                .keys()
                .filter(|name| *name != Table::BOOTSTRAP)
                .cloned()
                .collect();
            for name in names {
                self.delete_table(&name);
            }
        } else {
            self.delete_table(name);
        }
    }

    fn delete_table(&mut self, name: &str) {
        let Some(table) = self.tables.remove(name) else {
            return;
        };

        for route in &table.routes {
            self.discard_route(name, route);
        }

        tracing::debug!(table = name, "deleted table");
    }

    /// Undoes a route that is no longer declared: clears its NAT rule and,
    /// if this table still owns the domain, unbinds the name.
    fn discard_route(&mut self, table_name: &str, route: &Route) {
        self.clear_rule(route);

        if route.name.is_empty() {
            return;
        }
        let domain = route.domain();
        if self.owners.get(&domain).is_some_and(|owner| owner == table_name) {
            self.registry.remove(&domain);
            self.owners.remove(&domain);
        }
    }

    fn install_rule(&self, route: &Route) {
        let Some(ip) = self.route_ip(route) else {
            return;
        };

        let result = match &route.proto {
            Proto::Tcp => self.redirector.forward_tcp(ip, &route.target),
            Proto::Udp => self.redirector.forward_udp(ip, &route.target),
            Proto::Other(proto) => {
                tracing::warn!(%proto, %ip, "skipping route with unknown protocol");
                return;
            }
        };

        if let Err(e) = result {
            tracing::warn!(%ip, proto = %route.proto, "failed to install redirect rule: {e}");
        }
    }

    fn clear_rule(&self, route: &Route) {
        let Some(ip) = self.route_ip(route) else {
            return;
        };

        let result = match &route.proto {
            Proto::Tcp => self.redirector.clear_tcp(ip),
            Proto::Udp => self.redirector.clear_udp(ip),
            Proto::Other(_) => return, // Never installed.
        };

        if let Err(e) = result {
            tracing::warn!(%ip, proto = %route.proto, "failed to clear redirect rule: {e}");
        }
    }

    fn route_ip(&self, route: &Route) -> Option<Ipv4Addr> {
        match route.ip.parse() {
            Ok(ip) => Some(ip),
            Err(_) => {
                if !route.ip.is_empty() {
                    tracing::warn!(name = %route.name, ip = %route.ip, "route has an unusable IP");
                }
                None
            }
        }
    }

    fn render(&self, name: Option<&str>) -> Result<Option<String>> {
        let json = match name {
            Some(name) => match self.tables.get(name) {
                Some(table) => to_pretty_json(table)?,
                None => return Ok(None),
            },
            None => {
                let mut tables: Vec<&Table> = self.tables.values().collect();
                tables.sort_by(|a, b| a.name.cmp(&b.name));
                to_pretty_json(&tables)?
            }
        };

        Ok(Some(json))
    }

    fn drain(&mut self) {
        let names: Vec<String> = self.tables.keys().cloned().collect();
        for name in names {
            self.delete_table(&name);
        }
    }
}

fn to_pretty_json<T: serde::Serialize>(value: &T) -> Result<String> {
    let mut json = serde_json::to_string_pretty(value).context("failed to render table JSON")?;
    json.push('\n');

    Ok(json)
}
