//! Decoding of randomness service events.
//!
//! `RandomnessFulfilled` is emitted through a self-CPI, so it is not visible
//! in the log stream. It is recovered from the transaction's inner
//! instructions instead:
//!
//! 1. pick the innermost invocation of the program (its final instruction),
//! 2. base58-decode the instruction data and strip the 8-byte event tag,
//! 3. base64 re-encode, and decode the result exactly like a
//!    `Program data:` log line (8-byte event discriminator + Borsh body).
//!
//! [`decode_cpi_events`] walks every self-CPI instead, for transactions that
//! settle more than one request.

use base64::Engine;
use sha2::{Digest, Sha256};
use solana_sdk::pubkey::Pubkey;
use thiserror::Error;

/// Tag Anchor prepends to self-CPI event instructions (`EVENT_IX_TAG`, little-endian).
pub const EVENT_IX_TAG_LE: [u8; 8] = 0x1d9a_cb51_2ea5_45e4u64.to_le_bytes();

/// Names of every event the program emits.
pub const KNOWN_EVENTS: [&str; 3] = ["RandomnessRequested", "RandomnessFulfilled", "RequestClosed"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("no inner instruction from the program in this transaction")]
    EventNotFound,
    #[error("expected {expected} event, found {found}")]
    EventNameMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("malformed event payload: {0}")]
    Malformed(String),
}

/// Compute the Anchor event discriminator: `sha256("event:<Name>")[..8]`.
pub fn event_discriminator(event_name: &str) -> [u8; 8] {
    let mut hasher = Sha256::new();
    hasher.update(format!("event:{event_name}"));
    let hash = hasher.finalize();
    let mut disc = [0u8; 8];
    disc.copy_from_slice(&hash[..8]);
    disc
}

/// Compute the Anchor account discriminator: `sha256("account:<Name>")[..8]`.
pub fn account_discriminator(account_name: &str) -> [u8; 8] {
    let mut hasher = Sha256::new();
    hasher.update(format!("account:{account_name}"));
    let hash = hasher.finalize();
    let mut disc = [0u8; 8];
    disc.copy_from_slice(&hash[..8]);
    disc
}

/// A program event with a fixed name and a Borsh body.
pub trait ProgramEvent: Sized {
    const NAME: &'static str;

    /// Parse the body that follows the 8-byte discriminator.
    fn parse(body: &[u8]) -> Option<Self>;
}

/// Parsed `RandomnessRequested` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomnessRequested {
    pub request: Pubkey,
    pub requester: Pubkey,
    pub num_bytes: u16,
    pub request_slot: u64,
    pub callback_program: Pubkey,
}

/// Parsed `RandomnessFulfilled` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomnessFulfilled {
    pub request: Pubkey,
    pub is_success: bool,
    pub randomness: Vec<u8>,
}

/// Parsed `RequestClosed` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestClosed {
    pub request: Pubkey,
    pub requester: Pubkey,
    pub refunded: u64,
}

/// Little-endian Borsh reader over an event body.
struct BorshReader<'a> {
    data: &'a [u8],
}

impl<'a> BorshReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.data.len() < len {
            return None;
        }
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Some(head)
    }

    fn pubkey(&mut self) -> Option<Pubkey> {
        Pubkey::try_from(self.take(32)?).ok()
    }

    fn bool(&mut self) -> Option<bool> {
        match self.take(1)?[0] {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        }
    }

    fn u16(&mut self) -> Option<u16> {
        Some(u16::from_le_bytes(self.take(2)?.try_into().ok()?))
    }

    fn u32(&mut self) -> Option<u32> {
        Some(u32::from_le_bytes(self.take(4)?.try_into().ok()?))
    }

    fn u64(&mut self) -> Option<u64> {
        Some(u64::from_le_bytes(self.take(8)?.try_into().ok()?))
    }

    fn bytes(&mut self) -> Option<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }
}

impl ProgramEvent for RandomnessRequested {
    const NAME: &'static str = "RandomnessRequested";

    /// Layout: `request (32) + requester (32) + num_bytes (2) + request_slot (8) + callback`.
    /// Only the callback program id is kept.
    fn parse(body: &[u8]) -> Option<Self> {
        let mut reader = BorshReader::new(body);
        let request = reader.pubkey()?;
        let requester = reader.pubkey()?;
        let num_bytes = reader.u16()?;
        let request_slot = reader.u64()?;
        let callback_program = reader.pubkey()?;
        Some(Self {
            request,
            requester,
            num_bytes,
            request_slot,
            callback_program,
        })
    }
}

impl ProgramEvent for RandomnessFulfilled {
    const NAME: &'static str = "RandomnessFulfilled";

    /// Layout: `request (32) + is_success (1) + randomness (4 + n)`.
    fn parse(body: &[u8]) -> Option<Self> {
        let mut reader = BorshReader::new(body);
        let request = reader.pubkey()?;
        let is_success = reader.bool()?;
        let randomness = reader.bytes()?.to_vec();
        Some(Self {
            request,
            is_success,
            randomness,
        })
    }
}

impl ProgramEvent for RequestClosed {
    const NAME: &'static str = "RequestClosed";

    fn parse(body: &[u8]) -> Option<Self> {
        let mut reader = BorshReader::new(body);
        Some(Self {
            request: reader.pubkey()?,
            requester: reader.pubkey()?,
            refunded: reader.u64()?,
        })
    }
}

/// Decode raw event bytes (discriminator + body) as `E`.
pub fn decode_event_bytes<E: ProgramEvent>(data: &[u8]) -> Result<E, DecodeError> {
    if data.len() < 8 {
        return Err(DecodeError::Malformed(format!(
            "{} bytes is shorter than a discriminator",
            data.len()
        )));
    }

    let (disc, body) = data.split_at(8);
    if disc != event_discriminator(E::NAME) {
        return match KNOWN_EVENTS
            .iter()
            .copied()
            .find(|name| disc == event_discriminator(name))
        {
            Some(found) => Err(DecodeError::EventNameMismatch {
                expected: E::NAME,
                found,
            }),
            None => Err(DecodeError::Malformed("unknown event discriminator".into())),
        };
    }

    E::parse(body).ok_or_else(|| DecodeError::Malformed(format!("truncated {} body", E::NAME)))
}

/// Decode a base64 event payload, as found after `Program data: `.
pub fn decode_base64_event<E: ProgramEvent>(encoded: &str) -> Result<E, DecodeError> {
    let data = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| DecodeError::Malformed(format!("invalid base64: {e}")))?;
    decode_event_bytes(&data)
}

/// Scan log lines for the first `Program data:` entry decoding as `E`.
///
/// Entries belonging to other events are skipped.
pub fn find_event_in_logs<E: ProgramEvent>(logs: &[String]) -> Result<E, DecodeError> {
    let mut last_error = DecodeError::EventNotFound;
    for line in logs {
        let Some(encoded) = line.strip_prefix("Program data: ") else {
            continue;
        };
        match decode_base64_event::<E>(encoded) {
            Ok(event) => return Ok(event),
            Err(DecodeError::EventNameMismatch { .. }) => continue,
            Err(e) => last_error = e,
        }
    }
    Err(last_error)
}

/// One compiled inner instruction, with its program id resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerInstructionView {
    pub program_id: Pubkey,
    /// Instruction data, base58-encoded as returned by the RPC.
    pub data: String,
    pub stack_height: Option<u32>,
}

/// Decode an event emitted through a self-CPI of `program_id`.
pub fn decode_cpi_event<E: ProgramEvent>(
    inner_instructions: &[InnerInstructionView],
    program_id: &Pubkey,
) -> Result<E, DecodeError> {
    let own = inner_instructions
        .iter()
        .filter(|ix| ix.program_id == *program_id);
    let innermost = own.clone().filter_map(|ix| ix.stack_height).max();
    let instruction = match innermost {
        Some(height) => own.filter(|ix| ix.stack_height == Some(height)).last(),
        None => own.last(),
    }
    .ok_or(DecodeError::EventNotFound)?;

    let raw = bs58::decode(&instruction.data)
        .into_vec()
        .map_err(|e| DecodeError::Malformed(format!("invalid base58: {e}")))?;
    let payload = raw
        .strip_prefix(&EVENT_IX_TAG_LE[..])
        .ok_or_else(|| DecodeError::Malformed("missing event instruction tag".into()))?;

    let encoded = base64::engine::general_purpose::STANDARD.encode(payload);
    decode_base64_event(&encoded)
}

/// Decode every `E` emitted through a self-CPI of `program_id`, in
/// execution order.
///
/// Program instructions that are not event instructions, and events of
/// other types, are skipped. A transaction with several settlements yields
/// one event per settlement.
pub fn decode_cpi_events<E: ProgramEvent>(
    inner_instructions: &[InnerInstructionView],
    program_id: &Pubkey,
) -> Result<Vec<E>, DecodeError> {
    let mut own = inner_instructions
        .iter()
        .filter(|ix| ix.program_id == *program_id)
        .peekable();
    if own.peek().is_none() {
        return Err(DecodeError::EventNotFound);
    }

    let mut events = Vec::new();
    for instruction in own {
        let raw = bs58::decode(&instruction.data)
            .into_vec()
            .map_err(|e| DecodeError::Malformed(format!("invalid base58: {e}")))?;
        let Some(payload) = raw.strip_prefix(&EVENT_IX_TAG_LE[..]) else {
            continue;
        };
        match decode_event_bytes::<E>(payload) {
            Ok(event) => events.push(event),
            Err(DecodeError::EventNameMismatch { .. }) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(events)
}
