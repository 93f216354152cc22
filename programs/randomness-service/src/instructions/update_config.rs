use anchor_lang::prelude::*;

use crate::errors::RandomnessError;
use crate::state::ServiceConfig;
use crate::CONFIG_SEED;

/// Accounts required to update the fee schedule.
#[derive(Accounts)]
pub struct SetFees<'info> {
    /// Current authority; must sign.
    pub authority: Signer<'info>,

    #[account(
        mut,
        seeds = [CONFIG_SEED],
        bump = config.bump,
        constraint = config.authority == authority.key() @ RandomnessError::Unauthorized,
    )]
    pub config: Account<'info, ServiceConfig>,
}

/// Accounts required to bind a new fulfillment service.
#[derive(Accounts)]
pub struct SetFulfillmentService<'info> {
    /// Current authority; must sign.
    pub authority: Signer<'info>,

    #[account(
        mut,
        seeds = [CONFIG_SEED],
        bump = config.bump,
        constraint = config.authority == authority.key() @ RandomnessError::Unauthorized,
    )]
    pub config: Account<'info, ServiceConfig>,

    /// The new fulfillment service identity.
    /// CHECK: Stored as configuration; validated to be non-zero.
    pub fulfillment_service: UncheckedAccount<'info>,
}

/// Accounts required to rotate the delegated settlement signer.
#[derive(Accounts)]
pub struct SetDelegatedSigner<'info> {
    /// The bound fulfillment service; must sign.
    pub fulfillment_service: Signer<'info>,

    #[account(
        mut,
        seeds = [CONFIG_SEED],
        bump = config.bump,
        constraint = config.fulfillment_service == fulfillment_service.key() @ RandomnessError::Unauthorized,
    )]
    pub config: Account<'info, ServiceConfig>,
}

/// Update the per-byte fee. Requests already created keep the fee they escrowed.
pub fn set_fees_handler(ctx: Context<SetFees>, cost_per_byte: u64) -> Result<()> {
    let now = Clock::get()?.unix_timestamp;
    let config = &mut ctx.accounts.config;
    config.cost_per_byte = cost_per_byte;
    config.touch(now);
    Ok(())
}

/// Rebind the fulfillment service. Any delegated signer of the previous
/// service is revoked.
pub fn set_fulfillment_service_handler(ctx: Context<SetFulfillmentService>) -> Result<()> {
    let service = ctx.accounts.fulfillment_service.key();
    require!(
        service != Pubkey::default(),
        RandomnessError::ZeroAddressNotAllowed
    );

    let now = Clock::get()?.unix_timestamp;
    let config = &mut ctx.accounts.config;
    config.fulfillment_service = service;
    config.delegated_signer = Pubkey::default();
    config.touch(now);

    msg!("Fulfillment service rebound to {}", service);
    Ok(())
}

/// Set the attested signer allowed to settle on the service's behalf.
///
/// `Pubkey::default()` revokes the current delegate.
pub fn set_delegated_signer_handler(ctx: Context<SetDelegatedSigner>, signer: Pubkey) -> Result<()> {
    let now = Clock::get()?.unix_timestamp;
    let config = &mut ctx.accounts.config;
    config.delegated_signer = signer;
    config.touch(now);
    Ok(())
}
