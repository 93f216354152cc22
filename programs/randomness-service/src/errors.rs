use anchor_lang::prelude::*;

/// Error codes for the randomness service.
///
/// Anchor encodes these as `6000 + variant index` in on-chain error responses.
#[error_code]
#[derive(Eq, PartialEq)]
pub enum RandomnessError {
    /// `num_bytes` is zero or above [`crate::state::MAX_NUM_BYTES`].
    #[msg("num_bytes must be between 1 and the maximum request length")]
    InvalidNumberOfBytes,
    /// The callback descriptor cannot be executed by the settlement engine.
    #[msg("Callback cannot be executed")]
    InvalidCallback,
    /// The callback exceeds the fixed account or payload capacity.
    #[msg("Callback exceeds the request record capacity")]
    CallbackTooLarge,
    /// Signer does not have permission for this action.
    #[msg("Unauthorized")]
    Unauthorized,
    /// The configuration has already been initialized.
    #[msg("Configuration already initialized")]
    AlreadyInitialized,
    /// The request has already been settled.
    #[msg("Request already settled")]
    AlreadySettled,
    /// The delivered randomness length differs from the requested length.
    #[msg("Randomness length does not match the request")]
    LengthMismatch,
    /// The escrow holds less than the request fee.
    #[msg("Escrow has insufficient funds")]
    InsufficientEscrow,
    /// The escrow token account is not a native account owned by the configuration.
    #[msg("Invalid escrow account")]
    InvalidEscrow,
    /// Settlement must be a top-level instruction of this program.
    #[msg("This instruction cannot be invoked with a CPI call")]
    CpiUnauthorized,
    /// Close attempted before the request completed or expired.
    #[msg("Request is still active")]
    RequestStillActive,
    /// The callback error message exceeds [`crate::state::MAX_ERROR_MESSAGE_LEN`].
    #[msg("Error message exceeds 128 bytes")]
    ErrorMessageOverflow,
    /// The callback program account does not match the request's callback.
    #[msg("Incorrect callback program")]
    IncorrectCallbackProgram,
    /// The configuration still has live requests.
    #[msg("Configuration has outstanding requests")]
    OutstandingRequests,
    /// A public key argument was the zero address.
    #[msg("Zero address not allowed")]
    ZeroAddressNotAllowed,
    /// Fee or counter arithmetic overflowed.
    #[msg("Arithmetic overflow")]
    ArithmeticOverflow,
}
