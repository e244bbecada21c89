//! CSFTP library
//!
//! Binary file-transfer protocol with three verbs (PUT/GET/DELETE) and an
//! adaptive GET that sends three gzip tiers paced by client ACKs and by the
//! host's CPU/memory settling back to baseline.

pub mod auth;
pub mod cli;
pub mod compress;
pub mod engine;
pub mod handlers;
pub mod metrics;
pub mod monitor;
pub mod net_async;
pub mod protocol;
pub mod protocol_core;
pub mod store;
