//! Validation and callback planning shared by the request, settle and close
//! instructions.
//!
//! Everything here is pure over the deserialized accounts so the rules can be
//! exercised without a running validator.

use anchor_lang::prelude::*;

use crate::errors::RandomnessError;
use crate::state::{
    Callback, RandomnessRequest, ServiceConfig, MAX_CALLBACK_ACCOUNTS, MAX_CALLBACK_DATA_LEN,
    MAX_ERROR_MESSAGE_LEN, MAX_NUM_BYTES,
};

/// Reject re-initialization of an existing configuration.
pub fn ensure_uninitialized(config: &ServiceConfig) -> Result<()> {
    require!(!config.is_initialized(), RandomnessError::AlreadyInitialized);
    Ok(())
}

/// Validate a new request before anything is funded.
///
/// A defined callback must list the config PDA as a signer (it signs the
/// callback invocation) and must not require any other signer.
pub fn validate_request(config_key: &Pubkey, num_bytes: u16, callback: &Callback) -> Result<()> {
    require!(
        num_bytes > 0 && num_bytes <= MAX_NUM_BYTES,
        RandomnessError::InvalidNumberOfBytes
    );
    require!(
        callback.accounts.len() <= MAX_CALLBACK_ACCOUNTS
            && callback.ix_data.len() <= MAX_CALLBACK_DATA_LEN,
        RandomnessError::CallbackTooLarge
    );

    if !callback.is_defined() {
        require!(callback.accounts.is_empty(), RandomnessError::InvalidCallback);
        return Ok(());
    }

    let mut has_config_signer = false;
    for account in callback.accounts.iter() {
        if account.pubkey == *config_key {
            if !account.is_signer {
                msg!("Randomness config must be a signer of the callback");
                return err!(RandomnessError::InvalidCallback);
            }
            has_config_signer = true;
        } else if account.is_signer {
            msg!("Callback must not require signers other than the randomness config");
            return err!(RandomnessError::InvalidCallback);
        }
    }

    if !has_config_signer {
        msg!("Randomness config must be provided as a callback signer");
        return err!(RandomnessError::InvalidCallback);
    }

    Ok(())
}

/// Validate a settlement submission against the live request.
///
/// Checked in order: caller identity, exactly-once, length, escrow balance.
pub fn validate_settlement(
    config: &ServiceConfig,
    request: &RandomnessRequest,
    settler: &Pubkey,
    randomness_len: usize,
    escrow_amount: u64,
) -> Result<()> {
    require!(config.is_settler(settler), RandomnessError::Unauthorized);
    require!(!request.is_completed, RandomnessError::AlreadySettled);
    require!(
        randomness_len == usize::from(request.num_bytes),
        RandomnessError::LengthMismatch
    );
    require!(escrow_amount >= request.fee, RandomnessError::InsufficientEscrow);
    Ok(())
}

pub fn validate_error_message(error_message: &str) -> Result<()> {
    require!(
        error_message.len() <= MAX_ERROR_MESSAGE_LEN,
        RandomnessError::ErrorMessageOverflow
    );
    Ok(())
}

/// Who may close a request, and when.
///
/// The requester or the authority may close; a request that never completed
/// must also be past its expiry window.
pub fn validate_close_request(
    request: &RandomnessRequest,
    signer: &Pubkey,
    authority: &Pubkey,
    current_slot: u64,
) -> Result<()> {
    require!(
        *signer == request.requester || *signer == *authority,
        RandomnessError::Unauthorized
    );
    require!(
        request.is_completed || request.is_expired(current_slot),
        RandomnessError::RequestStillActive
    );
    Ok(())
}

pub fn validate_close_config(config: &ServiceConfig, signer: &Pubkey) -> Result<()> {
    require_keys_eq!(*signer, config.authority, RandomnessError::Unauthorized);
    require!(
        config.pending_requests == 0,
        RandomnessError::OutstandingRequests
    );
    Ok(())
}

/// Where the settlement engine sources the `AccountInfo` for a callback meta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountSource {
    /// Reserved slot: the config PDA, signing via seeds.
    Config,
    /// Reserved slot: the request being settled.
    Request,
    /// Any other account, looked up in `remaining_accounts`.
    Remaining,
}

/// Reasons a callback cannot be invoked. Recorded, never fatal to settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackFault {
    SettlerReferenced,
    ConfigNotSigner,
    MissingAccount(Pubkey),
    InvocationFailed(String),
}

impl CallbackFault {
    /// Diagnostic stored on the request, bounded to the record capacity.
    pub fn message(&self) -> String {
        let message = match self {
            Self::SettlerReferenced => "callback references the settlement signer".to_string(),
            Self::ConfigNotSigner => "callback must take the config as signer".to_string(),
            Self::MissingAccount(pubkey) => format!("missing callback account {pubkey}"),
            Self::InvocationFailed(reason) => format!("callback failed: {reason}"),
        };
        truncate_message(message, MAX_ERROR_MESSAGE_LEN)
    }
}

fn truncate_message(mut message: String, max_len: usize) -> String {
    if message.len() > max_len {
        let mut end = max_len;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    message
}

/// Resolve the callback descriptor into invocation metas.
///
/// The config PDA and the request itself are reserved slots filled from the
/// live instruction accounts. The config is always passed read-only.
pub fn plan_callback_accounts(
    callback: &Callback,
    config_key: &Pubkey,
    request_key: &Pubkey,
    settler: &Pubkey,
) -> std::result::Result<Vec<(AccountMeta, AccountSource)>, CallbackFault> {
    let mut planned = Vec::with_capacity(callback.accounts.len());
    for account in callback.accounts.iter() {
        if account.pubkey == *settler {
            return Err(CallbackFault::SettlerReferenced);
        }

        if account.pubkey == *config_key {
            if !account.is_signer {
                return Err(CallbackFault::ConfigNotSigner);
            }
            planned.push((AccountMeta::new_readonly(*config_key, true), AccountSource::Config));
        } else if account.pubkey == *request_key {
            planned.push((account.into(), AccountSource::Request));
        } else {
            planned.push((account.into(), AccountSource::Remaining));
        }
    }
    Ok(planned)
}

/// Callback payload: `ix_data || borsh(Vec<u8> randomness) || borsh(bool is_success)`.
pub fn callback_data(ix_data: &[u8], randomness: &[u8], is_success: bool) -> Vec<u8> {
    let mut data = Vec::with_capacity(ix_data.len() + 4 + randomness.len() + 1);
    data.extend_from_slice(ix_data);
    data.extend_from_slice(&(randomness.len() as u32).to_le_bytes());
    data.extend_from_slice(randomness);
    data.push(u8::from(is_success));
    data
}
