//! Client for the escrowed randomness service.
//!
//! - [`orchestrator`]: submit a request, retry on stale blockhashes, await the
//!   fulfillment or a timeout.
//! - [`events`]: decode program events from inner instructions and logs.
//! - [`ledger`] / [`rpc`] / [`listener`]: the ledger seam and its Solana
//!   implementation.

pub mod addresses;
pub mod config;
pub mod events;
pub mod instructions;
pub mod ledger;
pub mod listener;
pub mod metrics;
pub mod orchestrator;
pub mod rpc;
