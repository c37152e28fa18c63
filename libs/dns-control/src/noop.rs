use anyhow::Result;

pub(crate) async fn flush_caches() {}

pub(crate) async fn override_search_domains(_domain: &str) -> Result<Restore> {
    Ok(Restore {})
}

pub(crate) struct Restore {}

impl Restore {
    pub(crate) async fn restore(self) {}
}
