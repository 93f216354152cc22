//! Deterministic address derivation for the randomness service accounts.
//!
//! Everything here is pure: the same inputs always yield the same addresses,
//! so callers can derive the escrow and configuration before submitting.

use solana_sdk::pubkey::Pubkey;

/// Seed of the singleton service configuration PDA.
pub const CONFIG_SEED: &[u8] = b"randomness-config";
/// Seed prefix of the dice-consumer roll PDA.
pub const DICE_ROLL_SEED: &[u8] = b"dice-roll";

/// Wrapped SOL mint.
pub const NATIVE_MINT: Pubkey =
    Pubkey::from_str_const("So11111111111111111111111111111111111111112");
pub const TOKEN_PROGRAM_ID: Pubkey =
    Pubkey::from_str_const("TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA");
pub const ASSOCIATED_TOKEN_PROGRAM_ID: Pubkey =
    Pubkey::from_str_const("ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL");
pub const SYSTEM_PROGRAM_ID: Pubkey = Pubkey::from_str_const("11111111111111111111111111111111");

/// Configuration PDA and bump. Seeds: `["randomness-config"]`.
pub fn config_address(program_id: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[CONFIG_SEED], program_id)
}

/// Associated token account of `(wallet, mint)` under the classic token program.
pub fn associated_token_address(wallet: &Pubkey, mint: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(
        &[wallet.as_ref(), TOKEN_PROGRAM_ID.as_ref(), mint.as_ref()],
        &ASSOCIATED_TOKEN_PROGRAM_ID,
    )
    .0
}

/// Escrow of a request: ATA(native mint, request).
pub fn escrow_address(request: &Pubkey) -> Pubkey {
    associated_token_address(request, &NATIVE_MINT)
}

/// Fee wallet of the configuration: ATA(native mint, config).
pub fn wallet_address(config: &Pubkey) -> Pubkey {
    associated_token_address(config, &NATIVE_MINT)
}

/// Dice roll PDA. Seeds: `["dice-roll", request]`.
pub fn dice_roll_address(dice_program_id: &Pubkey, request: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(&[DICE_ROLL_SEED, request.as_ref()], dice_program_id).0
}
