use anchor_lang::prelude::*;
use anchor_lang::solana_program::sysvar::instructions as sysvar_instructions;
use anchor_lang::system_program;
use anchor_spl::token::{self, CloseAccount, SyncNative, TokenAccount, Transfer};

use crate::errors::RandomnessError;

/// Fund a native (wrapped SOL) escrow with `amount` lamports from `payer`.
///
/// The lamports are moved with a system transfer, then `sync_native` brings
/// the token balance in line. No-op when `amount` is zero.
pub fn wrap_native<'info>(
    system_program: &AccountInfo<'info>,
    token_program: &AccountInfo<'info>,
    escrow: &Account<'info, TokenAccount>,
    payer: &AccountInfo<'info>,
    amount: u64,
) -> Result<()> {
    if amount == 0 {
        return Ok(());
    }
    require!(escrow.is_native(), RandomnessError::InvalidEscrow);

    system_program::transfer(
        CpiContext::new(
            system_program.clone(),
            system_program::Transfer {
                from: payer.clone(),
                to: escrow.to_account_info(),
            },
        ),
        amount,
    )?;

    token::sync_native(CpiContext::new(
        token_program.clone(),
        SyncNative {
            account: escrow.to_account_info(),
        },
    ))
}

/// Move `amount` tokens out of a config-owned token account.
pub fn transfer_from_config<'info>(
    token_program: &AccountInfo<'info>,
    from: &Account<'info, TokenAccount>,
    to: &Account<'info, TokenAccount>,
    config: &AccountInfo<'info>,
    signer_seeds: &[&[&[u8]]],
    amount: u64,
) -> Result<()> {
    if amount == 0 {
        return Ok(());
    }
    token::transfer(
        CpiContext::new_with_signer(
            token_program.clone(),
            Transfer {
                from: from.to_account_info(),
                to: to.to_account_info(),
                authority: config.clone(),
            },
            signer_seeds,
        ),
        amount,
    )
}

/// Close a config-owned native token account.
///
/// Any remaining wrapped balance is returned as lamports together with the rent.
pub fn close_token_account<'info>(
    token_program: &AccountInfo<'info>,
    account: &Account<'info, TokenAccount>,
    destination: &AccountInfo<'info>,
    config: &AccountInfo<'info>,
    signer_seeds: &[&[&[u8]]],
) -> Result<()> {
    token::close_account(CpiContext::new_with_signer(
        token_program.clone(),
        CloseAccount {
            account: account.to_account_info(),
            destination: destination.clone(),
            authority: config.clone(),
        },
        signer_seeds,
    ))
}

/// Reject settlement invoked through a CPI.
///
/// The Instructions sysvar only records top-level instructions, so when the
/// current top-level instruction belongs to another program this call is a
/// CPI, possibly re-entering from a requester callback.
pub fn assert_not_cpi_call(instructions_sysvar: &AccountInfo) -> Result<()> {
    let current_index = sysvar_instructions::load_current_index_checked(instructions_sysvar)?;
    let current_ix = sysvar_instructions::load_instruction_at_checked(
        usize::from(current_index),
        instructions_sysvar,
    )?;

    require_keys_eq!(current_ix.program_id, crate::ID, RandomnessError::CpiUnauthorized);
    Ok(())
}
