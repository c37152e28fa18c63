//! Shared types for the intercept control plane: the declarative routing
//! tables published by the driver and the concurrent name registry the DNS
//! server resolves against.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod registry;
mod route;

pub use registry::NameRegistry;
pub use route::{Proto, Route, Table};
