use anchor_lang::prelude::*;
use anchor_spl::token::{Token, TokenAccount};

use crate::errors::RandomnessError;
use crate::escrow::close_token_account;
use crate::settlement::validate_close_config;
use crate::state::ServiceConfig;
use crate::CONFIG_SEED;

/// Accounts required to tear down the service configuration.
#[derive(Accounts)]
pub struct CloseConfig<'info> {
    /// Configuration authority; receives the wallet balance and all rent.
    #[account(mut)]
    pub authority: Signer<'info>,

    #[account(
        mut,
        seeds = [CONFIG_SEED],
        bump = config.bump,
        close = authority,
    )]
    pub config: Account<'info, ServiceConfig>,

    #[account(
        mut,
        address = config.wallet @ RandomnessError::InvalidEscrow,
    )]
    pub wallet: Account<'info, TokenAccount>,

    pub token_program: Program<'info, Token>,
}

/// Sweep the fee wallet to the authority and close the configuration.
///
/// Rejected while any request is still outstanding.
pub fn handler(ctx: Context<CloseConfig>) -> Result<()> {
    validate_close_config(&ctx.accounts.config, &ctx.accounts.authority.key())?;

    let swept = ctx.accounts.wallet.amount;
    let config_bump = ctx.accounts.config.bump;
    let signer_seeds: &[&[&[u8]]] = &[&[CONFIG_SEED, &[config_bump]]];

    close_token_account(
        &ctx.accounts.token_program.to_account_info(),
        &ctx.accounts.wallet,
        &ctx.accounts.authority.to_account_info(),
        &ctx.accounts.config.to_account_info(),
        signer_seeds,
    )?;

    msg!("Randomness config closed, swept {} lamports", swept);
    Ok(())
}
