use anchor_lang::prelude::*;
use anchor_lang::solana_program::instruction::Instruction;
use anchor_lang::solana_program::program::invoke_signed;
use anchor_lang::solana_program::sysvar::instructions as sysvar_instructions;
use anchor_spl::token::{Token, TokenAccount};

use crate::errors::RandomnessError;
use crate::escrow::{assert_not_cpi_call, close_token_account, transfer_from_config};
use crate::events::RandomnessFulfilled;
use crate::settlement::{
    callback_data, plan_callback_accounts, validate_settlement, AccountSource, CallbackFault,
};
use crate::state::{Callback, RandomnessRequest, ServiceConfig};
use crate::CONFIG_SEED;

/// Accounts required to settle a pending randomness request.
///
/// After validation the engine:
/// 1. Pays the escrowed fee into the configuration wallet
/// 2. Invokes the requester callback, signed by the configuration PDA
/// 3. Closes the escrow and the request when the callback succeeds, otherwise
///    records the failure on the request
///
/// A successfully settled request no longer exists, so settling it again is
/// rejected by account validation (`AccountNotInitialized`, 3012) before the
/// handler runs. `AlreadySettled` covers records kept after a callback fault
/// or `settle_with_error`.
#[event_cpi]
#[derive(Accounts)]
pub struct Settle<'info> {
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

    /// Receives the escrow and request rent when they are closed.
    /// CHECK: Validated by matching request.requester.
    #[account(
        mut,
        address = request.requester @ RandomnessError::Unauthorized,
    )]
    pub requester: UncheckedAccount<'info>,

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

    /// Program named by the request callback (`Pubkey::default()` when none).
    /// CHECK: Validated by matching request.callback.program_id.
    #[account(
        constraint = callback_program.key() == request.callback.program_id @ RandomnessError::IncorrectCallbackProgram,
    )]
    pub callback_program: UncheckedAccount<'info>,

    pub token_program: Program<'info, Token>,

    /// CHECK: Validated by the address constraint.
    #[account(address = sysvar_instructions::ID)]
    pub instructions_sysvar: UncheckedAccount<'info>,
    // remaining_accounts: callback accounts other than the config and the request
}

/// Settle a pending request with `randomness` and deliver it to the requester.
pub fn handler<'info>(
    ctx: Context<'_, '_, '_, 'info, Settle<'info>>,
    randomness: Vec<u8>,
) -> Result<()> {
    assert_not_cpi_call(&ctx.accounts.instructions_sysvar)?;

    let settler = ctx.accounts.settler.key();
    validate_settlement(
        &ctx.accounts.config,
        &ctx.accounts.request,
        &settler,
        randomness.len(),
        ctx.accounts.escrow.amount,
    )?;

    let config_bump = ctx.accounts.config.bump;
    let signer_seeds: &[&[&[u8]]] = &[&[CONFIG_SEED, &[config_bump]]];
    let request_key = ctx.accounts.request.key();
    let fee = ctx.accounts.request.fee;

    // 1. Fee settlement is final whatever happens to the callback.
    transfer_from_config(
        &ctx.accounts.token_program.to_account_info(),
        &ctx.accounts.escrow,
        &ctx.accounts.wallet,
        &ctx.accounts.config.to_account_info(),
        signer_seeds,
        fee,
    )?;

    let now = Clock::get()?.unix_timestamp;
    ctx.accounts.config.touch(now);

    ctx.accounts.request.is_completed = true;
    // The callback may read the request; it must observe the completed state.
    ctx.accounts.request.exit(&crate::ID)?;

    // 2. Callback
    let callback = ctx.accounts.request.callback.clone();
    let outcome = if callback.is_defined() {
        invoke_callback(
            &callback,
            &ctx.accounts.config.to_account_info(),
            &ctx.accounts.request.to_account_info(),
            &ctx.accounts.callback_program.to_account_info(),
            ctx.remaining_accounts,
            &settler,
            &randomness,
            signer_seeds,
        )
    } else {
        Ok(())
    };

    // 3. Close or record
    let is_success = match outcome {
        Ok(()) => {
            close_token_account(
                &ctx.accounts.token_program.to_account_info(),
                &ctx.accounts.escrow,
                &ctx.accounts.requester.to_account_info(),
                &ctx.accounts.config.to_account_info(),
                signer_seeds,
            )?;
            ctx.accounts
                .request
                .close(ctx.accounts.requester.to_account_info())?;
            ctx.accounts.config.release_request(now);
            true
        }
        Err(fault) => {
            let message = fault.message();
            msg!("Callback not delivered for {}: {}", request_key, message);
            // The record stays live until `close_request`.
            ctx.accounts.request.error_message = message;
            false
        }
    };

    emit_cpi!(RandomnessFulfilled {
        request: request_key,
        is_success,
        randomness,
    });

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn invoke_callback<'info>(
    callback: &Callback,
    config: &AccountInfo<'info>,
    request: &AccountInfo<'info>,
    callback_program: &AccountInfo<'info>,
    remaining_accounts: &[AccountInfo<'info>],
    settler: &Pubkey,
    randomness: &[u8],
    signer_seeds: &[&[&[u8]]],
) -> std::result::Result<(), CallbackFault> {
    let plan = plan_callback_accounts(callback, config.key, request.key, settler)?;

    let mut metas = Vec::with_capacity(plan.len());
    let mut infos = Vec::with_capacity(plan.len() + 1);
    for (meta, source) in plan {
        let info = match source {
            AccountSource::Config => config.clone(),
            AccountSource::Request => request.clone(),
            AccountSource::Remaining => remaining_accounts
                .iter()
                .find(|account| *account.key == meta.pubkey)
                .cloned()
                .ok_or(CallbackFault::MissingAccount(meta.pubkey))?,
        };
        metas.push(meta);
        infos.push(info);
    }
    infos.push(callback_program.clone());

    let callback_ix = Instruction {
        program_id: *callback_program.key,
        accounts: metas,
        data: callback_data(&callback.ix_data, randomness, true),
    };

    invoke_signed(&callback_ix, &infos, signer_seeds)
        .map_err(|err| CallbackFault::InvocationFailed(err.to_string()))
}
