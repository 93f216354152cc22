//! On-ledger observation for the randomness service.
//!
//! - **Fulfillment watch** ([`watch_fulfillment`]): subscribes to program logs
//!   over WebSocket and, for every settlement transaction, fetches it and
//!   decodes the `RandomnessFulfilled` self-CPI events. Dropped streams are
//!   re-established, and the request's history is searched after each
//!   reconnect.
//! - **History lookup** ([`find_fulfillment`]): walks the signatures that
//!   touched a request.
//! - **Replay** ([`fetch_transaction_events`]): the same decoding for one
//!   signature, plus the events logged as `Program data:` lines.
//! - **Record scan** ([`pending_requests`], [`request_records`]):
//!   `getProgramAccounts` with Memcmp filters.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use solana_account_decoder::UiAccountEncoding;
use solana_client::nonblocking::pubsub_client::PubsubClient;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::{
    RpcAccountInfoConfig, RpcProgramAccountsConfig, RpcTransactionConfig,
    RpcTransactionLogsConfig, RpcTransactionLogsFilter,
};
use solana_client::rpc_filter::{Memcmp, RpcFilterType};
use solana_commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_transaction_status_client_types::{
    EncodedConfirmedTransactionWithStatusMeta, EncodedTransaction, UiInnerInstructions,
    UiInstruction, UiLoadedAddresses, UiMessage, UiTransactionEncoding,
};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::events::{
    DecodeError, InnerInstructionView, ProgramEvent, RandomnessFulfilled, RandomnessRequested,
    RequestClosed, account_discriminator, decode_cpi_events, find_event_in_logs,
};
use crate::ledger::{FulfillmentNotice, LedgerError, SubscriptionHandle};
use crate::rpc::classify_client_error;

/// Byte offset of `is_completed` in a `RandomnessRequest` account.
///
/// Layout (offsets include the 8-byte discriminator):
///   [0..8]    discriminator
///   [8..40]   requester    (Pubkey)
///   [40..72]  escrow       (Pubkey)
///   [72..74]  num_bytes    (u16)
///   [74..82]  request_slot (u64)
///   [82]      is_completed (bool)
///   [83..91]  fee          (u64)
pub const IS_COMPLETED_OFFSET: usize = 82;
const MIN_ACCOUNT_DATA_LEN: usize = 91;

/// Slots after which an unfulfilled request may be closed for a refund.
pub const REQUEST_EXPIRY_SLOTS: u64 = 1_500;

/// Log lines Anchor prints for the two settlement instructions.
const SETTLE_LOG_LINES: [&str; 2] = [
    "Program log: Instruction: Settle",
    "Program log: Instruction: SettleWithError",
];

const WS_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// A settlement's transaction may not be served yet when its logs arrive.
const FETCH_ATTEMPTS: u32 = 4;
const FETCH_RETRY_DELAY: Duration = Duration::from_millis(500);

/// The fixed prefix of a `RandomnessRequest` account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestRecord {
    #[serde(serialize_with = "display")]
    pub request: Pubkey,
    #[serde(serialize_with = "display")]
    pub requester: Pubkey,
    #[serde(serialize_with = "display")]
    pub escrow: Pubkey,
    pub num_bytes: u16,
    pub request_slot: u64,
    pub is_completed: bool,
    pub fee: u64,
}

impl RequestRecord {
    pub fn is_expired(&self, current_slot: u64) -> bool {
        current_slot >= self.request_slot.saturating_add(REQUEST_EXPIRY_SLOTS)
    }

    /// Whether `signer` may close this record at `current_slot`.
    pub fn is_closable_by(&self, signer: &Pubkey, authority: &Pubkey, current_slot: u64) -> bool {
        let permitted = signer == &self.requester || signer == authority;
        permitted && (self.is_completed || self.is_expired(current_slot))
    }
}

/// Records `signer` may close at `current_slot`.
pub fn closable(
    records: &[RequestRecord],
    signer: &Pubkey,
    authority: &Pubkey,
    current_slot: u64,
) -> Vec<RequestRecord> {
    records
        .iter()
        .filter(|record| record.is_closable_by(signer, authority, current_slot))
        .cloned()
        .collect()
}

fn display<T: std::fmt::Display, S: serde::Serializer>(value: &T, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(value)
}

/// Parse the fixed prefix of a `RandomnessRequest` account.
pub fn parse_request_prefix(request: Pubkey, data: &[u8]) -> Option<RequestRecord> {
    if data.len() < MIN_ACCOUNT_DATA_LEN || data[..8] != account_discriminator("RandomnessRequest") {
        return None;
    }
    Some(RequestRecord {
        request,
        requester: Pubkey::try_from(&data[8..40]).ok()?,
        escrow: Pubkey::try_from(&data[40..72]).ok()?,
        num_bytes: u16::from_le_bytes(data[72..74].try_into().ok()?),
        request_slot: u64::from_le_bytes(data[74..82].try_into().ok()?),
        is_completed: data[IS_COMPLETED_OFFSET] != 0,
        fee: u64::from_le_bytes(data[83..91].try_into().ok()?),
    })
}

/// Authority stored in a `ServiceConfig` account.
pub fn parse_config_authority(data: &[u8]) -> Option<Pubkey> {
    if data.len() < 40 || data[..8] != account_discriminator("ServiceConfig") {
        return None;
    }
    Pubkey::try_from(&data[8..40]).ok()
}

/// Scan for requests that are not completed yet.
pub async fn pending_requests(
    rpc: &RpcClient,
    program_id: &Pubkey,
) -> Result<Vec<RequestRecord>, LedgerError> {
    info!("Scanning for pending requests");
    let pending = scan_requests(rpc, program_id, true).await?;
    info!(count = pending.len(), "Found pending requests");
    Ok(pending)
}

/// Scan for every live request record, completed or not.
pub async fn request_records(
    rpc: &RpcClient,
    program_id: &Pubkey,
) -> Result<Vec<RequestRecord>, LedgerError> {
    info!("Scanning for request records");
    let records = scan_requests(rpc, program_id, false).await?;
    info!(count = records.len(), "Found request records");
    Ok(records)
}

async fn scan_requests(
    rpc: &RpcClient,
    program_id: &Pubkey,
    pending_only: bool,
) -> Result<Vec<RequestRecord>, LedgerError> {
    let mut filters = vec![RpcFilterType::Memcmp(Memcmp::new_raw_bytes(
        0,
        account_discriminator("RandomnessRequest").to_vec(),
    ))];
    if pending_only {
        filters.push(RpcFilterType::Memcmp(Memcmp::new_raw_bytes(
            IS_COMPLETED_OFFSET,
            vec![0u8],
        )));
    }

    let account_config = RpcProgramAccountsConfig {
        filters: Some(filters),
        account_config: RpcAccountInfoConfig {
            encoding: Some(UiAccountEncoding::Base64),
            commitment: Some(CommitmentConfig::confirmed()),
            ..Default::default()
        },
        ..Default::default()
    };

    let accounts = rpc
        .get_program_ui_accounts_with_config(program_id, account_config)
        .await
        .map_err(|e| classify_client_error(&e))?;

    let mut records = Vec::with_capacity(accounts.len());
    for (pubkey, ui_account) in accounts {
        let Some(data) = ui_account.data.decode() else {
            warn!(account = %pubkey, "Failed to decode account data, skipping");
            continue;
        };
        match parse_request_prefix(pubkey, &data) {
            Some(record) => records.push(record),
            None => warn!(account = %pubkey, len = data.len(), "Unexpected request layout, skipping"),
        }
    }
    Ok(records)
}

/// Flatten a fetched transaction's inner instructions, resolving program ids
/// against the static and loaded account keys.
pub fn inner_instruction_views(
    tx: &EncodedConfirmedTransactionWithStatusMeta,
) -> Vec<InnerInstructionView> {
    let Some(meta) = tx.transaction.meta.as_ref() else {
        return Vec::new();
    };

    let mut account_keys: Vec<String> = match &tx.transaction.transaction {
        EncodedTransaction::Json(ui_tx) => match &ui_tx.message {
            UiMessage::Raw(raw) => raw.account_keys.clone(),
            UiMessage::Parsed(parsed) => parsed
                .account_keys
                .iter()
                .map(|key| key.pubkey.clone())
                .collect(),
        },
        _ => Vec::new(),
    };
    if let Some(loaded) = Option::<UiLoadedAddresses>::from(meta.loaded_addresses.clone()) {
        account_keys.extend(loaded.writable);
        account_keys.extend(loaded.readonly);
    }

    let inner = Option::<Vec<UiInnerInstructions>>::from(meta.inner_instructions.clone())
        .unwrap_or_default();

    inner
        .iter()
        .flat_map(|group| group.instructions.iter())
        .filter_map(|ix| match ix {
            UiInstruction::Compiled(compiled) => {
                let key = account_keys.get(usize::from(compiled.program_id_index))?;
                Some(InnerInstructionView {
                    program_id: Pubkey::from_str(key).ok()?,
                    data: compiled.data.clone(),
                    stack_height: compiled.stack_height,
                })
            }
            UiInstruction::Parsed(_) => None,
        })
        .collect()
}

/// Every program event recovered from one committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionEvents {
    pub slot: u64,
    /// One notice per settlement, in execution order.
    pub fulfilled: Vec<FulfillmentNotice>,
    pub requested: Option<RandomnessRequested>,
    pub closed: Option<RequestClosed>,
}

impl TransactionEvents {
    pub fn is_empty(&self) -> bool {
        self.fulfilled.is_empty() && self.requested.is_none() && self.closed.is_none()
    }

    /// The settlement of `request`, if this transaction carries one.
    pub fn fulfillment_of(&self, request: &Pubkey) -> Option<&FulfillmentNotice> {
        self.fulfilled.iter().find(|notice| notice.request == *request)
    }
}

/// Log lines recorded for a fetched transaction.
pub fn log_messages(tx: &EncodedConfirmedTransactionWithStatusMeta) -> Vec<String> {
    tx.transaction
        .meta
        .as_ref()
        .and_then(|meta| Option::<Vec<String>>::from(meta.log_messages.clone()))
        .unwrap_or_default()
}

fn logged_event<E: ProgramEvent>(logs: &[String], signature: &Signature) -> Option<E> {
    match find_event_in_logs::<E>(logs) {
        Ok(event) => Some(event),
        Err(DecodeError::EventNotFound) => None,
        Err(e) => {
            debug!(signature = %signature, event = E::NAME, error = %e, "Skipping logged event");
            None
        }
    }
}

/// Turn the self-CPI trace of a transaction into fulfillment notices.
pub fn fulfillment_notices(
    views: &[InnerInstructionView],
    program_id: &Pubkey,
    slot: u64,
    signature: &Signature,
) -> Vec<FulfillmentNotice> {
    let events = match decode_cpi_events::<RandomnessFulfilled>(views, program_id) {
        Ok(events) => events,
        Err(DecodeError::EventNotFound) => Vec::new(),
        Err(e) => {
            warn!(signature = %signature, error = %e, "Undecodable settlement event");
            Vec::new()
        }
    };
    events
        .into_iter()
        .map(|event| FulfillmentNotice {
            request: event.request,
            is_success: event.is_success,
            randomness: event.randomness,
            slot,
            signature: *signature,
        })
        .collect()
}

/// Fetch `signature` and decode the program events it carries.
///
/// `RandomnessFulfilled` comes from the self-CPI trace, the other events from
/// `Program data:` log lines.
pub async fn fetch_transaction_events(
    rpc: &RpcClient,
    program_id: &Pubkey,
    signature: &Signature,
) -> Result<TransactionEvents, LedgerError> {
    let config = RpcTransactionConfig {
        encoding: Some(UiTransactionEncoding::Json),
        commitment: Some(CommitmentConfig::confirmed()),
        max_supported_transaction_version: Some(0),
    };
    let tx = rpc
        .get_transaction_with_config(signature, config)
        .await
        .map_err(|e| classify_client_error(&e))?;

    let views = inner_instruction_views(&tx);
    let logs = log_messages(&tx);
    Ok(TransactionEvents {
        slot: tx.slot,
        fulfilled: fulfillment_notices(&views, program_id, tx.slot, signature),
        requested: logged_event(&logs, signature),
        closed: logged_event(&logs, signature),
    })
}

/// Fetch `signature` and return the settlement of `request` it carries, if any.
pub async fn fetch_fulfillment(
    rpc: &RpcClient,
    program_id: &Pubkey,
    signature: &Signature,
    request: &Pubkey,
) -> Result<Option<FulfillmentNotice>, LedgerError> {
    let events = fetch_transaction_events(rpc, program_id, signature).await?;
    Ok(events.fulfillment_of(request).cloned())
}

/// Search the committed transactions that touched `request` for its settlement.
pub async fn find_fulfillment(
    rpc: &RpcClient,
    program_id: &Pubkey,
    request: &Pubkey,
) -> Result<Option<FulfillmentNotice>, LedgerError> {
    let statuses = rpc
        .get_signatures_for_address(request)
        .await
        .map_err(|e| classify_client_error(&e))?;

    for status in statuses.iter().filter(|status| status.err.is_none()) {
        let Ok(signature) = Signature::from_str(&status.signature) else {
            continue;
        };
        if let Some(notice) = fetch_fulfillment(rpc, program_id, &signature, request).await? {
            return Ok(Some(notice));
        }
    }
    Ok(None)
}

/// Run `op` up to `attempts` times, doubling `delay` after each failure.
pub async fn with_retries<T, F, Fut>(
    attempts: u32,
    mut delay: Duration,
    mut op: F,
) -> Result<T, LedgerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                debug!(attempt, delay = ?delay, error = %e, "Retrying");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_settlement(logs: &[String]) -> bool {
    logs.iter()
        .any(|line| SETTLE_LOG_LINES.contains(&line.as_str()))
}

/// How one log subscription ended.
#[derive(Debug)]
enum WatchEnd {
    Delivered,
    Cancelled,
    StreamEnded,
    Failed(LedgerError),
}

/// Watch program logs until the fulfillment of `handle.request()` is
/// delivered or the subscriber deregisters.
///
/// `ready` is answered once the first log subscription is live; a failure to
/// establish it is reported there. Later failures reconnect after
/// `WS_RECONNECT_DELAY`.
pub async fn watch_fulfillment(
    ws_url: String,
    rpc: Arc<RpcClient>,
    program_id: Pubkey,
    handle: SubscriptionHandle,
    ready: oneshot::Sender<Result<(), LedgerError>>,
) {
    let request = handle.request();
    let mut ready = Some(ready);

    loop {
        match watch_stream(&ws_url, &rpc, &program_id, &handle, &mut ready).await {
            WatchEnd::Delivered | WatchEnd::Cancelled => break,
            WatchEnd::StreamEnded => warn!(request = %request, "Log stream ended, reconnecting"),
            WatchEnd::Failed(e) => match ready.take() {
                Some(ready) => {
                    let _ = ready.send(Err(e));
                    return;
                }
                None => warn!(request = %request, error = %e, "Log subscription failed"),
            },
        }

        info!(request = %request, delay = ?WS_RECONNECT_DELAY, "Reconnecting");
        tokio::select! {
            _ = handle.cancelled() => break,
            _ = tokio::time::sleep(WS_RECONNECT_DELAY) => {}
        }
    }

    debug!(request = %request, "Fulfillment watch finished");
}

async fn watch_stream(
    ws_url: &str,
    rpc: &RpcClient,
    program_id: &Pubkey,
    handle: &SubscriptionHandle,
    ready: &mut Option<oneshot::Sender<Result<(), LedgerError>>>,
) -> WatchEnd {
    let request = handle.request();

    let pubsub = match PubsubClient::new(ws_url).await {
        Ok(pubsub) => pubsub,
        Err(e) => return WatchEnd::Failed(LedgerError::Transport(e.to_string())),
    };

    let filter = RpcTransactionLogsFilter::Mentions(vec![program_id.to_string()]);
    let logs_config = RpcTransactionLogsConfig {
        commitment: Some(CommitmentConfig::confirmed()),
    };
    let (mut stream, unsubscribe) = match pubsub.logs_subscribe(filter, logs_config).await {
        Ok(subscription) => subscription,
        Err(e) => return WatchEnd::Failed(LedgerError::Transport(e.to_string())),
    };

    // A settlement landing while disconnected never reaches the new stream.
    let recovered = match ready.take() {
        Some(ready) => {
            if ready.send(Ok(())).is_err() {
                debug!(request = %request, "Subscriber gone before registration completed");
            }
            None
        }
        None => match find_fulfillment(rpc, program_id, &request).await {
            Ok(found) => found,
            Err(e) => {
                warn!(request = %request, error = %e, "History lookup after reconnect failed");
                None
            }
        },
    };

    let end = match recovered {
        Some(notice) => {
            info!(request = %request, signature = %notice.signature, "Fulfillment recovered from history");
            handle.deliver(notice);
            WatchEnd::Delivered
        }
        None => {
            debug!(request = %request, "Watching for fulfillment");
            loop {
                tokio::select! {
                    _ = handle.cancelled() => break WatchEnd::Cancelled,
                    next = stream.next() => {
                        let Some(notification) = next else {
                            break WatchEnd::StreamEnded;
                        };
                        let logs = notification.value;
                        if logs.err.is_some() || !is_settlement(&logs.logs) {
                            continue;
                        }
                        let Ok(signature) = Signature::from_str(&logs.signature) else {
                            continue;
                        };
                        let fetched = with_retries(FETCH_ATTEMPTS, FETCH_RETRY_DELAY, || {
                            fetch_fulfillment(rpc, program_id, &signature, &request)
                        })
                        .await;
                        match fetched {
                            Ok(Some(notice)) => {
                                info!(request = %request, signature = %signature, "Fulfillment observed");
                                handle.deliver(notice);
                                break WatchEnd::Delivered;
                            }
                            Ok(None) => {}
                            Err(e) => warn!(signature = %signature, error = %e, "Failed to fetch settlement"),
                        }
                    }
                }
            }
        }
    };

    drop(stream);
    unsubscribe().await;
    debug!(request = %request, "Log subscription closed");
    end
}
