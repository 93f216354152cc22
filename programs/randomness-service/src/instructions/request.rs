use anchor_lang::prelude::*;
use anchor_spl::associated_token::AssociatedToken;
use anchor_spl::token::spl_token::instruction::AuthorityType;
use anchor_spl::token::{self, Mint, SetAuthority, Token, TokenAccount};

use crate::errors::RandomnessError;
use crate::escrow::wrap_native;
use crate::events::RandomnessRequested;
use crate::settlement::validate_request;
use crate::state::{Callback, RandomnessRequest, ServiceConfig};
use crate::CONFIG_SEED;

/// Accounts required to submit a randomness request.
///
/// `request` is a fresh keypair account and must co-sign the transaction.
/// Its escrow is the associated token account of (mint, request); ownership is
/// handed to the configuration PDA once funded.
#[derive(Accounts)]
pub struct RequestRandomness<'info> {
    /// The requester; pays rent and the fee.
    #[account(mut)]
    pub payer: Signer<'info>,

    #[account(
        mut,
        seeds = [CONFIG_SEED],
        bump = config.bump,
    )]
    pub config: Account<'info, ServiceConfig>,

    #[account(
        init,
        payer = payer,
        space = 8 + RandomnessRequest::INIT_SPACE,
    )]
    pub request: Account<'info, RandomnessRequest>,

    #[account(
        init,
        payer = payer,
        associated_token::mint = mint,
        associated_token::authority = request,
    )]
    pub escrow: Account<'info, TokenAccount>,

    #[account(address = config.mint)]
    pub mint: Account<'info, Mint>,

    pub token_program: Program<'info, Token>,
    pub associated_token_program: Program<'info, AssociatedToken>,
    pub system_program: Program<'info, System>,
}

/// Create a randomness request and fund its escrow with the fee.
pub fn handler(ctx: Context<RequestRandomness>, num_bytes: u16, callback: Callback) -> Result<()> {
    let config_key = ctx.accounts.config.key();
    validate_request(&config_key, num_bytes, &callback)?;

    let fee = ctx.accounts.config.request_cost(num_bytes)?;

    wrap_native(
        &ctx.accounts.system_program.to_account_info(),
        &ctx.accounts.token_program.to_account_info(),
        &ctx.accounts.escrow,
        &ctx.accounts.payer.to_account_info(),
        fee,
    )?;

    // Only the configuration may move escrowed funds from here on.
    token::set_authority(
        CpiContext::new(
            ctx.accounts.token_program.to_account_info(),
            SetAuthority {
                current_authority: ctx.accounts.request.to_account_info(),
                account_or_mint: ctx.accounts.escrow.to_account_info(),
            },
        ),
        AuthorityType::AccountOwner,
        Some(config_key),
    )?;

    let request_slot = Clock::get()?.slot;
    let request_key = ctx.accounts.request.key();
    let requester = ctx.accounts.payer.key();

    let request = &mut ctx.accounts.request;
    request.requester = requester;
    request.escrow = ctx.accounts.escrow.key();
    request.num_bytes = num_bytes;
    request.request_slot = request_slot;
    request.is_completed = false;
    request.fee = fee;
    request.callback = callback.clone();
    request.error_message = String::new();

    let config = &mut ctx.accounts.config;
    config.pending_requests = config
        .pending_requests
        .checked_add(1)
        .ok_or(RandomnessError::ArithmeticOverflow)?;

    emit!(RandomnessRequested {
        request: request_key,
        requester,
        num_bytes,
        request_slot,
        callback,
    });

    msg!(
        "Randomness requested: request={}, num_bytes={}, fee={}",
        request_key,
        num_bytes,
        fee
    );
    Ok(())
}
