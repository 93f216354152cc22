use anchor_lang::prelude::*;
use anchor_lang::Discriminator;
use anchor_spl::associated_token::AssociatedToken;
use anchor_spl::token::{Mint, Token};
use randomness_service::program::RandomnessService;
use randomness_service::state::ServiceConfig;
use randomness_service::{AccountMetaBorsh, Callback, CONFIG_SEED};

declare_id!("3dTkJ8PzNiZ3o1BdvwRiGz2E6ALjYg6bqpQKpbYCjw8r");

/// Randomness bytes requested per roll.
pub const ROLL_NUM_BYTES: u16 = 8;

/// A dice roll backed by service randomness.
///
/// Seeds: `["dice-roll", request]`
///
/// The `result` field is `0` while the roll is pending and `1..=6` once the
/// randomness service has delivered the callback.
#[account]
#[derive(InitSpace)]
pub struct DiceRoll {
    /// The player who requested the roll.
    pub player: Pubkey,
    /// The randomness request account backing this roll.
    pub request: Pubkey,
    /// Dice outcome: 0 = pending, 1-6 = settled face value.
    pub result: u8,
    /// PDA bump seed cached for efficient re-derivation.
    pub bump: u8,
}

/// Error codes for the dice-consumer program.
#[error_code]
pub enum DiceError {
    /// Attempted to settle a roll that already has a non-zero result.
    #[msg("Dice roll has already been settled")]
    AlreadySettled,
    /// Fewer than 8 randomness bytes were delivered.
    #[msg("Not enough randomness to roll")]
    InsufficientRandomness,
    /// The service reported the delivery as failed.
    #[msg("Randomness delivery failed")]
    DeliveryFailed,
}

/// Emitted when a player requests a new dice roll.
#[event]
pub struct DiceRollRequested {
    pub player: Pubkey,
    pub request: Pubkey,
}

/// Emitted when a dice roll is settled with a final result.
#[event]
pub struct DiceRollSettled {
    pub player: Pubkey,
    pub request: Pubkey,
    pub result: u8,
}

/// Map the first 8 randomness bytes to a face value in `1..=6`.
pub fn dice_value(randomness: &[u8]) -> Option<u8> {
    let bytes: [u8; 8] = randomness.get(..8)?.try_into().ok()?;
    Some((u64::from_le_bytes(bytes) % 6 + 1) as u8)
}

/// Callback descriptor registered with each roll request.
///
/// The service resolves the config (signer) and the request to the live
/// accounts and appends `randomness` and the status flag to `ix_data`.
pub fn roll_callback(config: Pubkey, request: Pubkey, dice_roll: Pubkey) -> Callback {
    Callback {
        program_id: crate::ID,
        accounts: vec![
            AccountMetaBorsh {
                pubkey: config,
                is_signer: true,
                is_writable: false,
            },
            AccountMetaBorsh {
                pubkey: request,
                is_signer: false,
                is_writable: false,
            },
            AccountMetaBorsh {
                pubkey: dice_roll,
                is_signer: false,
                is_writable: true,
            },
        ],
        ix_data: instruction::SettleRoll::DISCRIMINATOR.to_vec(),
    }
}

/// On-chain dice game powered by the randomness service.
///
/// 1. **Request**: `request_roll` CPIs into `randomness_service::request_randomness`
///    with a callback pointing back at `settle_roll`.
/// 2. **Settle**: the service invokes `settle_roll`, signed by its config
///    PDA, which turns the first 8 bytes into a fair dice result (1-6).
#[program]
pub mod dice_consumer {
    use super::*;

    /// Request a dice roll by CPI-ing into the randomness service.
    pub fn request_roll(ctx: Context<RequestRoll>) -> Result<()> {
        let callback = roll_callback(
            ctx.accounts.randomness_config.key(),
            ctx.accounts.request.key(),
            ctx.accounts.dice_roll.key(),
        );

        let cpi_accounts = randomness_service::cpi::accounts::RequestRandomness {
            payer: ctx.accounts.player.to_account_info(),
            config: ctx.accounts.randomness_config.to_account_info(),
            request: ctx.accounts.request.to_account_info(),
            escrow: ctx.accounts.escrow.to_account_info(),
            mint: ctx.accounts.mint.to_account_info(),
            token_program: ctx.accounts.token_program.to_account_info(),
            associated_token_program: ctx.accounts.associated_token_program.to_account_info(),
            system_program: ctx.accounts.system_program.to_account_info(),
        };
        let cpi_ctx = CpiContext::new(
            ctx.accounts.randomness_program.to_account_info(),
            cpi_accounts,
        );
        randomness_service::cpi::request_randomness(cpi_ctx, ROLL_NUM_BYTES, callback)?;

        let dice = &mut ctx.accounts.dice_roll;
        dice.player = ctx.accounts.player.key();
        dice.request = ctx.accounts.request.key();
        dice.result = 0;
        dice.bump = ctx.bumps.dice_roll;

        emit!(DiceRollRequested {
            player: dice.player,
            request: dice.request,
        });

        msg!("Dice roll requested, request={}", dice.request);
        Ok(())
    }

    /// Callback invoked by the randomness service on settlement.
    pub fn settle_roll(ctx: Context<SettleRoll>, randomness: Vec<u8>, is_success: bool) -> Result<()> {
        require!(is_success, DiceError::DeliveryFailed);
        let value = dice_value(&randomness).ok_or(DiceError::InsufficientRandomness)?;

        let dice = &mut ctx.accounts.dice_roll;
        dice.result = value;

        emit!(DiceRollSettled {
            player: dice.player,
            request: dice.request,
            result: value,
        });

        msg!("Dice rolled: {} (request={})", value, dice.request);
        Ok(())
    }
}

/// Accounts for [`dice_consumer::request_roll`].
#[derive(Accounts)]
pub struct RequestRoll<'info> {
    /// The player requesting the roll; pays for accounts and the fee.
    #[account(mut)]
    pub player: Signer<'info>,

    /// Randomness service configuration (mutated by the CPI).
    #[account(mut)]
    pub randomness_config: Account<'info, ServiceConfig>,

    /// Fresh request keypair, created by the randomness service CPI.
    #[account(mut)]
    pub request: Signer<'info>,

    /// Escrow token account, created by the randomness service CPI.
    /// CHECK: Created and validated by the randomness service during CPI.
    #[account(mut)]
    pub escrow: UncheckedAccount<'info>,

    pub mint: Account<'info, Mint>,

    /// Dice roll PDA. Seeds: `["dice-roll", request]`.
    #[account(
        init,
        payer = player,
        space = 8 + DiceRoll::INIT_SPACE,
        seeds = [b"dice-roll", request.key().as_ref()],
        bump,
    )]
    pub dice_roll: Account<'info, DiceRoll>,

    pub randomness_program: Program<'info, RandomnessService>,
    pub token_program: Program<'info, Token>,
    pub associated_token_program: Program<'info, AssociatedToken>,
    pub system_program: Program<'info, System>,
}

/// Accounts for [`dice_consumer::settle_roll`], in callback descriptor order.
#[derive(Accounts)]
pub struct SettleRoll<'info> {
    /// The randomness service configuration PDA, signing the callback.
    #[account(
        signer,
        seeds = [CONFIG_SEED],
        bump = randomness_config.bump,
        seeds::program = randomness_service::ID,
    )]
    pub randomness_config: Account<'info, ServiceConfig>,

    /// CHECK: Validated by matching dice_roll.request.
    pub request: UncheckedAccount<'info>,

    /// The dice roll PDA to settle. Must be unsettled (result == 0).
    #[account(
        mut,
        seeds = [b"dice-roll", request.key().as_ref()],
        bump = dice_roll.bump,
        constraint = dice_roll.request == request.key(),
        constraint = dice_roll.result == 0 @ DiceError::AlreadySettled,
    )]
    pub dice_roll: Account<'info, DiceRoll>,
}
