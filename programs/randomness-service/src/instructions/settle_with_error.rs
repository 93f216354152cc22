use anchor_lang::prelude::*;
use anchor_lang::solana_program::sysvar::instructions as sysvar_instructions;
use anchor_spl::token::{Token, TokenAccount};

use crate::errors::RandomnessError;
use crate::escrow::{assert_not_cpi_call, transfer_from_config};
use crate::events::RandomnessFulfilled;
use crate::settlement::{validate_error_message, validate_settlement};
use crate::state::{RandomnessRequest, ServiceConfig};
use crate::CONFIG_SEED;

/// Accounts required to settle a request without invoking its callback.
///
/// A failing callback aborts the whole settle transaction, so the service
/// falls back to this instruction when simulation shows the callback fails.
#[event_cpi]
#[derive(Accounts)]
pub struct SettleWithError<'info> {
    /// Fulfillment service or its delegated signer.
    #[account(mut)]
    pub settler: Signer<'info>,

    #[account(
        mut,
        seeds = [CONFIG_SEED],
        bump = config.bump,
    )]
    pub config: Account<'info, ServiceConfig>,

    #[account(
        mut,
        constraint = request.escrow == escrow.key() @ RandomnessError::InvalidEscrow,
    )]
    pub request: Account<'info, RandomnessRequest>,

    #[account(
        mut,
        token::mint = config.mint,
        token::authority = config,
    )]
    pub escrow: Account<'info, TokenAccount>,

    #[account(
        mut,
        address = config.wallet @ RandomnessError::InvalidEscrow,
    )]
    pub wallet: Account<'info, TokenAccount>,

    pub token_program: Program<'info, Token>,

    /// CHECK: Validated by the address constraint.
    #[account(address = sysvar_instructions::ID)]
    pub instructions_sysvar: UncheckedAccount<'info>,
}

/// Pay the service, mark the request completed and record `error_message`.
///
/// The request record stays open, and counted in `pending_requests`, until
/// `close_request`.
pub fn handler(
    ctx: Context<SettleWithError>,
    randomness: Vec<u8>,
    error_message: String,
) -> Result<()> {
    assert_not_cpi_call(&ctx.accounts.instructions_sysvar)?;
    validate_error_message(&error_message)?;
    validate_settlement(
        &ctx.accounts.config,
        &ctx.accounts.request,
        &ctx.accounts.settler.key(),
        randomness.len(),
        ctx.accounts.escrow.amount,
    )?;

    let config_bump = ctx.accounts.config.bump;
    let signer_seeds: &[&[&[u8]]] = &[&[CONFIG_SEED, &[config_bump]]];

    transfer_from_config(
        &ctx.accounts.token_program.to_account_info(),
        &ctx.accounts.escrow,
        &ctx.accounts.wallet,
        &ctx.accounts.config.to_account_info(),
        signer_seeds,
        ctx.accounts.request.fee,
    )?;

    let now = Clock::get()?.unix_timestamp;
    ctx.accounts.config.touch(now);

    let request_key = ctx.accounts.request.key();
    let request = &mut ctx.accounts.request;
    request.is_completed = true;
    request.error_message = error_message;

    msg!(
        "Request {} settled with error: {}",
        request_key,
        request.error_message
    );

    emit_cpi!(RandomnessFulfilled {
        request: request_key,
        is_success: false,
        randomness,
    });

    Ok(())
}
