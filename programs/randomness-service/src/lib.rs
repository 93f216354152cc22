use anchor_lang::prelude::*;

pub mod errors;
pub mod escrow;
pub mod events;
pub mod instructions;
pub mod settlement;
pub mod state;

use instructions::*;

pub use state::{AccountMetaBorsh, Callback};

declare_id!("8jYDrMqiiUiJF8DxxHbbXZeRy4z5btraiQpvH7eGycfG");

/// Seed of the singleton [`state::ServiceConfig`] PDA.
pub const CONFIG_SEED: &[u8] = b"randomness-config";

/// Escrowed randomness service.
///
/// A requester funds a per-request wrapped-SOL escrow and describes a callback.
/// An off-chain fulfillment service, bound in the configuration, watches for
/// [`events::RandomnessRequested`], produces the randomness bytes and submits
/// `settle`, which pays the service out of the escrow, invokes the requester's
/// callback and emits [`events::RandomnessFulfilled`].
///
/// ## Request lifecycle
///
/// 1. **Request**: `request_randomness` creates the request account and its
///    escrow, funded with `num_bytes * cost_per_byte`.
/// 2. **Settle**: the fulfillment service submits `settle` (or
///    `settle_with_error` when the callback cannot succeed); the fee moves to
///    the service wallet exactly once.
/// 3. **Close**: a successful settlement closes the request itself; otherwise
///    `close_request` reclaims it after completion or expiry.
#[program]
pub mod randomness_service {
    use super::*;

    /// Create the singleton configuration PDA and its fee wallet.
    ///
    /// Fails with `AlreadyInitialized` when the configuration already exists.
    pub fn initialize(ctx: Context<Initialize>, cost_per_byte: u64) -> Result<()> {
        instructions::initialize::handler(ctx, cost_per_byte)
    }

    /// Update the fee charged per requested byte (authority only).
    pub fn set_fees(ctx: Context<SetFees>, cost_per_byte: u64) -> Result<()> {
        instructions::update_config::set_fees_handler(ctx, cost_per_byte)
    }

    /// Bind a new fulfillment service identity (authority only).
    pub fn set_fulfillment_service(ctx: Context<SetFulfillmentService>) -> Result<()> {
        instructions::update_config::set_fulfillment_service_handler(ctx)
    }

    /// Rotate the attested signer allowed to settle on behalf of the service.
    pub fn set_delegated_signer(ctx: Context<SetDelegatedSigner>, signer: Pubkey) -> Result<()> {
        instructions::update_config::set_delegated_signer_handler(ctx, signer)
    }

    /// Submit a new randomness request.
    ///
    /// Creates the request account and its escrow, charges the fee, and emits
    /// [`events::RandomnessRequested`].
    pub fn request_randomness(
        ctx: Context<RequestRandomness>,
        num_bytes: u16,
        callback: Callback,
    ) -> Result<()> {
        instructions::request::handler(ctx, num_bytes, callback)
    }

    /// Settle a pending request and invoke the requester's callback.
    pub fn settle<'info>(
        ctx: Context<'_, '_, '_, 'info, Settle<'info>>,
        randomness: Vec<u8>,
    ) -> Result<()> {
        instructions::settle::handler(ctx, randomness)
    }

    /// Settle a pending request whose callback is known to fail.
    ///
    /// Pays the service, records the diagnostic and skips the callback.
    pub fn settle_with_error(
        ctx: Context<SettleWithError>,
        randomness: Vec<u8>,
        error_message: String,
    ) -> Result<()> {
        instructions::settle_with_error::handler(ctx, randomness, error_message)
    }

    /// Close a completed or expired request, refunding whatever the escrow holds.
    pub fn close_request(ctx: Context<CloseRequest>) -> Result<()> {
        instructions::close_request::handler(ctx)
    }

    /// Close the configuration once no request is outstanding (authority only).
    pub fn close_config(ctx: Context<CloseConfig>) -> Result<()> {
        instructions::close_config::handler(ctx)
    }
}
