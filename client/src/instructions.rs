//! Instruction builders for the randomness service and the dice consumer.
//!
//! Data is Anchor-encoded by hand: an 8-byte `sha256("global:<name>")`
//! discriminator followed by the Borsh-encoded arguments.

use sha2::{Digest, Sha256};
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;

use crate::addresses::{
    ASSOCIATED_TOKEN_PROGRAM_ID, NATIVE_MINT, SYSTEM_PROGRAM_ID, TOKEN_PROGRAM_ID,
    dice_roll_address, escrow_address, wallet_address,
};

/// Maximum number of randomness bytes a request may ask for.
pub const MAX_NUM_BYTES: u16 = 256;
/// Maximum number of accounts a callback descriptor may reference.
pub const MAX_CALLBACK_ACCOUNTS: usize = 16;
/// Maximum length of the callback instruction payload.
pub const MAX_CALLBACK_DATA_LEN: usize = 256;

/// Compute the Anchor instruction discriminator: `sha256("global:<name>")[..8]`.
pub fn instruction_discriminator(name: &str) -> [u8; 8] {
    let mut hasher = Sha256::new();
    hasher.update(format!("global:{name}"));
    let hash = hasher.finalize();
    let mut disc = [0u8; 8];
    disc.copy_from_slice(&hash[..8]);
    disc
}

/// Requester callback descriptor, mirrored from the on-chain `Callback`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackSpec {
    pub program_id: Pubkey,
    pub accounts: Vec<AccountMeta>,
    pub ix_data: Vec<u8>,
}

impl CallbackSpec {
    /// No callback: the program id is the zero address.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_defined(&self) -> bool {
        self.program_id != Pubkey::default()
    }

    /// Whether the descriptor fits the request record.
    pub fn fits(&self) -> bool {
        self.accounts.len() <= MAX_CALLBACK_ACCOUNTS && self.ix_data.len() <= MAX_CALLBACK_DATA_LEN
    }

    fn encode_into(&self, data: &mut Vec<u8>) {
        data.extend_from_slice(self.program_id.as_ref());
        data.extend_from_slice(&(self.accounts.len() as u32).to_le_bytes());
        for meta in &self.accounts {
            data.extend_from_slice(meta.pubkey.as_ref());
            data.push(u8::from(meta.is_signer));
            data.push(u8::from(meta.is_writable));
        }
        data.extend_from_slice(&(self.ix_data.len() as u32).to_le_bytes());
        data.extend_from_slice(&self.ix_data);
    }
}

/// Build `initialize(cost_per_byte)`.
pub fn initialize(
    program_id: &Pubkey,
    authority: &Pubkey,
    config: &Pubkey,
    fulfillment_service: &Pubkey,
    cost_per_byte: u64,
) -> Instruction {
    let mut data = Vec::with_capacity(8 + 8);
    data.extend_from_slice(&instruction_discriminator("initialize"));
    data.extend_from_slice(&cost_per_byte.to_le_bytes());

    let accounts = vec![
        AccountMeta::new(*authority, true),                          // authority (signer, payer)
        AccountMeta::new_readonly(*fulfillment_service, false),      // fulfillment service
        AccountMeta::new(*config, false),                            // config PDA
        AccountMeta::new_readonly(NATIVE_MINT, false),               // mint
        AccountMeta::new(wallet_address(config), false),             // fee wallet
        AccountMeta::new_readonly(TOKEN_PROGRAM_ID, false),          // token program
        AccountMeta::new_readonly(ASSOCIATED_TOKEN_PROGRAM_ID, false), // associated token program
        AccountMeta::new_readonly(SYSTEM_PROGRAM_ID, false),         // system program
    ];

    Instruction {
        program_id: *program_id,
        accounts,
        data,
    }
}

/// Build `request_randomness(num_bytes, callback)`.
///
/// `request` is a fresh keypair that must co-sign the transaction.
pub fn request_randomness(
    program_id: &Pubkey,
    payer: &Pubkey,
    config: &Pubkey,
    request: &Pubkey,
    num_bytes: u16,
    callback: &CallbackSpec,
) -> Instruction {
    let mut data = Vec::with_capacity(8 + 2 + 32 + 8 + callback.ix_data.len());
    data.extend_from_slice(&instruction_discriminator("request_randomness"));
    data.extend_from_slice(&num_bytes.to_le_bytes());
    callback.encode_into(&mut data);

    let accounts = vec![
        AccountMeta::new(*payer, true),                              // payer (signer)
        AccountMeta::new(*config, false),                            // config PDA
        AccountMeta::new(*request, true),                            // request (new keypair)
        AccountMeta::new(escrow_address(request), false),            // escrow ATA
        AccountMeta::new_readonly(NATIVE_MINT, false),               // mint
        AccountMeta::new_readonly(TOKEN_PROGRAM_ID, false),          // token program
        AccountMeta::new_readonly(ASSOCIATED_TOKEN_PROGRAM_ID, false), // associated token program
        AccountMeta::new_readonly(SYSTEM_PROGRAM_ID, false),         // system program
    ];

    Instruction {
        program_id: *program_id,
        accounts,
        data,
    }
}

/// Build `close_request()`, refunding to `requester`.
pub fn close_request(
    program_id: &Pubkey,
    signer: &Pubkey,
    config: &Pubkey,
    request: &Pubkey,
    requester: &Pubkey,
) -> Instruction {
    let accounts = vec![
        AccountMeta::new(*signer, true),                     // requester or authority
        AccountMeta::new(*config, false),                    // config PDA
        AccountMeta::new(*request, false),                   // request
        AccountMeta::new(*requester, false),                 // refund destination
        AccountMeta::new(escrow_address(request), false),    // escrow ATA
        AccountMeta::new_readonly(TOKEN_PROGRAM_ID, false),  // token program
    ];

    Instruction {
        program_id: *program_id,
        accounts,
        data: instruction_discriminator("close_request").to_vec(),
    }
}

/// Build `set_fulfillment_service()`, binding `fulfillment_service`.
pub fn set_fulfillment_service(
    program_id: &Pubkey,
    authority: &Pubkey,
    config: &Pubkey,
    fulfillment_service: &Pubkey,
) -> Instruction {
    let accounts = vec![
        AccountMeta::new_readonly(*authority, true),
        AccountMeta::new(*config, false),
        AccountMeta::new_readonly(*fulfillment_service, false),
    ];

    Instruction {
        program_id: *program_id,
        accounts,
        data: instruction_discriminator("set_fulfillment_service").to_vec(),
    }
}

/// Build `close_config()`. The fee wallet balance and all rent go to `authority`.
pub fn close_config(program_id: &Pubkey, authority: &Pubkey, config: &Pubkey) -> Instruction {
    let accounts = vec![
        AccountMeta::new(*authority, true),                  // authority (signer)
        AccountMeta::new(*config, false),                    // config PDA
        AccountMeta::new(wallet_address(config), false),     // fee wallet
        AccountMeta::new_readonly(TOKEN_PROGRAM_ID, false),  // token program
    ];

    Instruction {
        program_id: *program_id,
        accounts,
        data: instruction_discriminator("close_config").to_vec(),
    }
}

/// Build `dice_consumer::request_roll()`.
pub fn request_roll(
    dice_program_id: &Pubkey,
    randomness_program_id: &Pubkey,
    player: &Pubkey,
    config: &Pubkey,
    request: &Pubkey,
) -> Instruction {
    let accounts = vec![
        AccountMeta::new(*player, true),                                        // player (signer)
        AccountMeta::new(*config, false),                                       // randomness config
        AccountMeta::new(*request, true),                                       // request (new keypair)
        AccountMeta::new(escrow_address(request), false),                       // escrow ATA
        AccountMeta::new_readonly(NATIVE_MINT, false),                          // mint
        AccountMeta::new(dice_roll_address(dice_program_id, request), false),   // dice roll PDA
        AccountMeta::new_readonly(*randomness_program_id, false),               // randomness program
        AccountMeta::new_readonly(TOKEN_PROGRAM_ID, false),                     // token program
        AccountMeta::new_readonly(ASSOCIATED_TOKEN_PROGRAM_ID, false),          // associated token program
        AccountMeta::new_readonly(SYSTEM_PROGRAM_ID, false),                    // system program
    ];

    Instruction {
        program_id: *dice_program_id,
        accounts,
        data: instruction_discriminator("request_roll").to_vec(),
    }
}
