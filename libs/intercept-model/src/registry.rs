use crate::Route;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Concurrent domain → [`Route`] map with a DNS search path for suffix
/// expansion.
///
/// Read by every DNS listener task; written only from the interceptor's
/// single worker task, so readers never contend with more than one writer.
#[derive(Debug)]
pub struct NameRegistry {
    names: RwLock<HashMap<String, Route>>,
    search: RwLock<Vec<String>>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self {
            names: RwLock::new(HashMap::new()),
            // A single empty suffix means "no expansion".
            search: RwLock::new(vec![String::new()]),
        }
    }

    /// Binds `domain` (lowercase, trailing dot) to `route`, replacing any
    /// previous binding.
    pub fn store(&self, domain: String, route: Route) {
        self.names.write().insert(domain, route);
    }

    /// Removes the binding for `domain`. No-op if absent.
    pub fn remove(&self, domain: &str) {
        self.names.write().remove(domain);
    }

    /// Looks up `query`, trying each search-path suffix in order and
    /// returning the first hit.
    ///
    /// The query is normalized to a rooted lowercase name first, so callers
    /// may pass either `web` or `Web.`.
    pub fn resolve(&self, query: &str) -> Option<Route> {
        let mut query = query.to_lowercase();
        if !query.ends_with('.') {
            query.push('.');
        }

        let names = self.names.read();
        for suffix in self.search.read().iter() {
            let candidate = format!("{query}{}", suffix.to_lowercase());
            if let Some(route) = names.get(&candidate) {
                return Some(route.clone());
            }
        }

        None
    }

    pub fn set_search_path(&self, paths: Vec<String>) {
        *self.search.write() = paths;
    }

    pub fn search_path(&self) -> Vec<String> {
        self.search.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(name: &str, ip: &str) -> Route {
        Route {
            name: name.to_owned(),
            ip: ip.to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn resolves_exact_domain() {
        let registry = NameRegistry::new();
        let web = route("web", "10.0.0.1");
        registry.store(web.domain(), web.clone());

        assert_eq!(registry.resolve("web."), Some(web.clone()));
        assert_eq!(registry.resolve("web"), Some(web));
        assert_eq!(registry.resolve("other."), None);
    }

    #[test]
    fn resolve_is_case_insensitive() {
        let registry = NameRegistry::new();
        let web = route("Web", "10.0.0.1");
        registry.store(web.domain(), web.clone());

        assert_eq!(registry.resolve("WEB."), Some(web));
    }

    #[test]
    fn search_path_expands_unqualified_names() {
        let registry = NameRegistry::new();
        let web = route("web.svc.cluster.local", "10.0.0.1");
        registry.store(web.domain(), web.clone());
        registry.set_search_path(vec![String::new(), "svc.cluster.local.".to_owned()]);

        assert_eq!(registry.resolve("web"), Some(web));
    }

    #[test]
    fn suffixes_are_tried_in_order() {
        let registry = NameRegistry::new();
        let first = route("web.one", "10.0.0.1");
        let second = route("web.two", "10.0.0.2");
        registry.store(first.domain(), first.clone());
        registry.store(second.domain(), second);
        registry.set_search_path(vec!["one.".to_owned(), "two.".to_owned()]);

        assert_eq!(registry.resolve("web"), Some(first));
    }

    #[test]
    fn remove_unbinds() {
        let registry = NameRegistry::new();
        let web = route("web", "10.0.0.1");
        registry.store(web.domain(), web);

        registry.remove("web.");

        assert_eq!(registry.resolve("web."), None);
    }
}
