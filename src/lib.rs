//! qproxy — an HTTP-fronted incident-analysis worker that multiplexes
//! requests onto a small pool of long-lived interactive assistant sessions.

pub mod api;
pub mod config;
pub mod observability;
pub mod orchestrator;
pub mod pool;
pub mod prompt;
pub mod sanitize;
pub mod session;
pub mod store;
pub mod term;
