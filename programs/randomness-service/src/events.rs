use anchor_lang::prelude::*;

use crate::state::Callback;

/// Emitted when a new randomness request is created.
///
/// The fulfillment service subscribes to these through the program logs.
#[event]
#[derive(Debug, Clone)]
pub struct RandomnessRequested {
    pub request: Pubkey,
    pub requester: Pubkey,
    pub num_bytes: u16,
    pub request_slot: u64,
    pub callback: Callback,
}

/// Emitted exactly once per settlement, through a self-CPI so the event is
/// recoverable from the transaction's inner instructions.
#[event]
#[derive(Debug, Clone)]
pub struct RandomnessFulfilled {
    pub request: Pubkey,
    pub is_success: bool,
    pub randomness: Vec<u8>,
}

/// Emitted when a request account is reclaimed.
#[event]
#[derive(Debug, Clone)]
pub struct RequestClosed {
    pub request: Pubkey,
    pub requester: Pubkey,
    pub refunded: u64,
}
