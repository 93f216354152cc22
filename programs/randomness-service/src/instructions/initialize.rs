use anchor_lang::prelude::*;
use anchor_spl::associated_token::AssociatedToken;
use anchor_spl::token::spl_token::native_mint;
use anchor_spl::token::{Mint, Token, TokenAccount};

use crate::errors::RandomnessError;
use crate::settlement::ensure_uninitialized;
use crate::state::ServiceConfig;
use crate::CONFIG_SEED;

/// Accounts required to initialize the service configuration singleton.
#[derive(Accounts)]
pub struct Initialize<'info> {
    /// The initial authority who pays for account creation.
    #[account(mut)]
    pub authority: Signer<'info>,

    /// Identity of the fulfillment service allowed to settle requests.
    /// CHECK: Stored as configuration; validated to be non-zero.
    pub fulfillment_service: UncheckedAccount<'info>,

    /// Singleton configuration PDA. Seeds: `["randomness-config"]`.
    /// An existing configuration is rejected by the handler.
    #[account(
        init_if_needed,
        payer = authority,
        space = 8 + ServiceConfig::INIT_SPACE,
        seeds = [CONFIG_SEED],
        bump,
    )]
    pub config: Account<'info, ServiceConfig>,

    #[account(address = native_mint::ID)]
    pub mint: Account<'info, Mint>,

    /// Fee wallet: associated token account of (mint, config).
    #[account(
        init_if_needed,
        payer = authority,
        associated_token::mint = mint,
        associated_token::authority = config,
    )]
    pub wallet: Account<'info, TokenAccount>,

    pub token_program: Program<'info, Token>,
    pub associated_token_program: Program<'info, AssociatedToken>,
    pub system_program: Program<'info, System>,
}

/// Initialize the service configuration.
pub fn handler(ctx: Context<Initialize>, cost_per_byte: u64) -> Result<()> {
    ensure_uninitialized(&ctx.accounts.config)?;
    require!(
        ctx.accounts.fulfillment_service.key() != Pubkey::default(),
        RandomnessError::ZeroAddressNotAllowed
    );

    let now = Clock::get()?.unix_timestamp;
    let config = &mut ctx.accounts.config;
    config.authority = ctx.accounts.authority.key();
    config.mint = ctx.accounts.mint.key();
    config.wallet = ctx.accounts.wallet.key();
    config.fulfillment_service = ctx.accounts.fulfillment_service.key();
    config.delegated_signer = Pubkey::default();
    config.cost_per_byte = cost_per_byte;
    config.pending_requests = 0;
    config.bump = ctx.bumps.config;
    config.touch(now);

    msg!(
        "Randomness service initialized: cost_per_byte={}, service={}",
        cost_per_byte,
        config.fulfillment_service
    );
    Ok(())
}
