//! The request scheduling and caching core of foliostats.
//!
//! Everything foliostats fetches from the upstream platform goes through
//! this crate: the [`fetch`] module schedules and retries outbound requests
//! with bounded concurrency, the [`caching`] module persists decoded
//! responses with a time-to-live, and the [`compute`] module serializes
//! access to the statistics engine, which cannot run two computations at
//! once. The [`api`] module puts typed endpoint wrappers on top.

pub mod api;
pub mod caching;
pub mod compute;
pub mod config;
pub mod credentials;
pub mod fetch;
pub mod logging;
pub mod metrics;
pub mod utils;
