//! Tag-based cache invalidation for content sites behind a Varnish-style
//! caching proxy.
//!
//! Rendered documents are annotated with cache tags and lifetimes derived
//! from the content they embed, and content mutations are translated into
//! BAN requests against every configured proxy endpoint. The pieces are
//! deliberately independent: [`store`] keeps tagged entries with their
//! metadata, [`tags`] derives and sanitizes tag sets, [`headers`] decides
//! what a response may advertise, [`varnish`] speaks the ban protocol and
//! [`flush`] batches invalidations so each transaction flushes exactly once.

pub mod config;
pub mod flush;
pub mod headers;
mod lock;
pub mod store;
pub mod tags;
pub mod telemetry;
pub mod token;
pub mod varnish;
