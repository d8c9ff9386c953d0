//! Vendor challenge flows that consume bank tokens, plus the transport core
//! they share with the provider adapters.

pub mod core;
pub mod datadome;
