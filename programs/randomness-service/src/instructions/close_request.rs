use anchor_lang::prelude::*;
use anchor_spl::token::{Token, TokenAccount};

use crate::errors::RandomnessError;
use crate::escrow::close_token_account;
use crate::events::RequestClosed;
use crate::settlement::validate_close_request;
use crate::state::{RandomnessRequest, ServiceConfig};
use crate::CONFIG_SEED;

/// Accounts required to reclaim a request account.
///
/// The requester or the authority may close a request once it is completed,
/// or once it expired without ever being fulfilled.
#[derive(Accounts)]
pub struct CloseRequest<'info> {
    /// Requester or configuration authority.
    #[account(mut)]
    pub signer: Signer<'info>,

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

    /// Receives the rent and any refunded escrow balance.
    /// CHECK: Validated by matching request.requester.
    #[account(
        mut,
        address = request.requester @ RandomnessError::Unauthorized,
    )]
    pub requester: UncheckedAccount<'info>,

    #[account(
        mut,
        token::authority = config,
    )]
    pub escrow: Account<'info, TokenAccount>,

    pub token_program: Program<'info, Token>,
}

/// Close the request and its escrow. Emits [`RequestClosed`].
pub fn handler(ctx: Context<CloseRequest>) -> Result<()> {
    let current_slot = Clock::get()?.slot;
    validate_close_request(
        &ctx.accounts.request,
        &ctx.accounts.signer.key(),
        &ctx.accounts.config.authority,
        current_slot,
    )?;

    let config_bump = ctx.accounts.config.bump;
    let signer_seeds: &[&[&[u8]]] = &[&[CONFIG_SEED, &[config_bump]]];
    let refunded = ctx.accounts.escrow.amount;

    close_token_account(
        &ctx.accounts.token_program.to_account_info(),
        &ctx.accounts.escrow,
        &ctx.accounts.requester.to_account_info(),
        &ctx.accounts.config.to_account_info(),
        signer_seeds,
    )?;

    let request_key = ctx.accounts.request.key();
    ctx.accounts
        .request
        .close(ctx.accounts.requester.to_account_info())?;

    let now = Clock::get()?.unix_timestamp;
    ctx.accounts.config.release_request(now);

    emit!(RequestClosed {
        request: request_key,
        requester: ctx.accounts.requester.key(),
        refunded,
    });

    Ok(())
}
