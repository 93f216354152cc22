use anchor_lang::prelude::*;

use crate::errors::RandomnessError;

/// Maximum number of randomness bytes a single request may ask for.
pub const MAX_NUM_BYTES: u16 = 256;
/// Maximum number of accounts a callback descriptor may reference.
pub const MAX_CALLBACK_ACCOUNTS: usize = 16;
/// Maximum length of the opaque callback instruction payload.
pub const MAX_CALLBACK_DATA_LEN: usize = 256;
/// Maximum length of a recorded callback error message.
pub const MAX_ERROR_MESSAGE_LEN: usize = 128;
/// Slots after which an unfulfilled request may be closed and refunded.
pub const REQUEST_EXPIRY_SLOTS: u64 = 1_500;

/// Global service configuration, stored as a singleton PDA.
///
/// Seeds: `["randomness-config"]`
///
/// Only the `authority` may update fees or rebind the fulfillment service. The
/// config PDA owns the fee `wallet` and every request escrow, and signs the
/// requester callbacks so consumers can authenticate the caller.
#[account]
#[derive(Debug, InitSpace)]
pub struct ServiceConfig {
    /// Privileged key that may update or close this configuration.
    pub authority: Pubkey,
    /// Mint the fees are denominated in (the native mint).
    pub mint: Pubkey,
    /// Associated token account of the config PDA collecting fees.
    pub wallet: Pubkey,
    /// The only service allowed to settle requests.
    pub fulfillment_service: Pubkey,
    /// Attested signer delegated by the fulfillment service; default = none.
    pub delegated_signer: Pubkey,
    /// Fee charged per requested byte, in base units of `mint`.
    pub cost_per_byte: u64,
    /// Request records created and not yet closed.
    pub pending_requests: u64,
    /// Unix timestamp of the last configuration change.
    pub last_updated: i64,
    /// PDA bump seed cached for efficient re-derivation.
    pub bump: u8,
}

impl ServiceConfig {
    /// Whether `initialize` has already populated this account.
    pub fn is_initialized(&self) -> bool {
        self.authority != Pubkey::default()
    }

    /// Fee for a request of `num_bytes`, fixed at request time.
    pub fn request_cost(&self, num_bytes: u16) -> Result<u64> {
        self.cost_per_byte
            .checked_mul(u64::from(num_bytes))
            .ok_or_else(|| error!(RandomnessError::ArithmeticOverflow))
    }

    /// Whether `signer` may settle requests on behalf of the service.
    pub fn is_settler(&self, signer: &Pubkey) -> bool {
        *signer == self.fulfillment_service
            || (self.delegated_signer != Pubkey::default() && *signer == self.delegated_signer)
    }

    /// Record a mutation at `now`, never moving `last_updated` backwards.
    pub fn touch(&mut self, now: i64) {
        self.last_updated = self.last_updated.max(now);
    }

    /// A request record was closed. Only then does it stop counting as live.
    pub fn release_request(&mut self, now: i64) {
        self.pending_requests = self.pending_requests.saturating_sub(1);
        self.touch(now);
    }
}

/// Borsh-serializable mirror of an instruction account meta.
#[derive(Clone, Debug, Default, PartialEq, Eq, AnchorSerialize, AnchorDeserialize, InitSpace)]
pub struct AccountMetaBorsh {
    pub pubkey: Pubkey,
    pub is_signer: bool,
    pub is_writable: bool,
}

impl From<&AccountMetaBorsh> for AccountMeta {
    fn from(meta: &AccountMetaBorsh) -> Self {
        AccountMeta {
            pubkey: meta.pubkey,
            is_signer: meta.is_signer,
            is_writable: meta.is_writable,
        }
    }
}

impl From<AccountMeta> for AccountMetaBorsh {
    fn from(meta: AccountMeta) -> Self {
        Self {
            pubkey: meta.pubkey,
            is_signer: meta.is_signer,
            is_writable: meta.is_writable,
        }
    }
}

/// How the requester wants to be notified once the randomness is delivered.
///
/// A `program_id` of `Pubkey::default()` means no callback.
#[derive(Clone, Debug, Default, PartialEq, Eq, AnchorSerialize, AnchorDeserialize, InitSpace)]
pub struct Callback {
    pub program_id: Pubkey,
    #[max_len(16)]
    pub accounts: Vec<AccountMetaBorsh>,
    #[max_len(256)]
    pub ix_data: Vec<u8>,
}

impl Callback {
    pub fn is_defined(&self) -> bool {
        self.program_id != Pubkey::default()
    }
}

/// One in-flight randomness request, held in a keypair account.
///
/// The fixed-size prefix is laid out so off-chain scanners can filter on it:
///
/// ```text
/// [0..8]    discriminator
/// [8..40]   requester     (Pubkey)
/// [40..72]  escrow        (Pubkey)
/// [72..74]  num_bytes     (u16)
/// [74..82]  request_slot  (u64)
/// [82]      is_completed  (bool)
/// [83..91]  fee           (u64)
/// ```
#[account]
#[derive(Debug, Default, InitSpace)]
pub struct RandomnessRequest {
    /// The account that created the request; receives rent and refunds.
    pub requester: Pubkey,
    /// Associated token account of (mint, request) holding the fee.
    pub escrow: Pubkey,
    /// Number of randomness bytes requested.
    pub num_bytes: u16,
    /// Solana slot at which the request was created.
    pub request_slot: u64,
    /// Set once by settlement.
    pub is_completed: bool,
    /// Fee escrowed at creation, `num_bytes * cost_per_byte`.
    pub fee: u64,
    /// Requester notification descriptor.
    pub callback: Callback,
    /// Diagnostic recorded when the callback could not be invoked.
    #[max_len(128)]
    pub error_message: String,
}

impl RandomnessRequest {
    /// Byte offset of `is_completed`, discriminator included.
    pub const IS_COMPLETED_OFFSET: usize = 8 + 32 + 32 + 2 + 8;

    /// Whether the request may be reclaimed without ever being settled.
    pub fn is_expired(&self, current_slot: u64) -> bool {
        current_slot >= self.request_slot.saturating_add(REQUEST_EXPIRY_SLOTS)
    }
}
