//! The ledger seam the orchestrator talks to.
//!
//! [`RpcLedger`](crate::rpc::RpcLedger) implements it over Solana JSON-RPC and
//! PubSub; tests substitute an in-memory ledger.

use std::future::Future;

use solana_sdk::instruction::Instruction;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Buffered notices per subscription. One is expected.
const SUBSCRIPTION_CAPACITY: usize = 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The transaction's blockhash expired before it landed. Safe to rebuild and resend.
    #[error("blockhash not found")]
    StaleBlockhash,
    /// The ledger executed and rejected the transaction.
    #[error("transaction rejected: {0}")]
    Rejected(String),
    /// RPC or WebSocket failure; the transaction outcome is unknown.
    #[error("transport error: {0}")]
    Transport(String),
}

/// A committed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submitted {
    pub signature: Signature,
    pub slot: u64,
}

/// `RandomnessFulfilled` as observed for one request, with where it landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FulfillmentNotice {
    pub request: Pubkey,
    pub is_success: bool,
    pub randomness: Vec<u8>,
    pub slot: u64,
    pub signature: Signature,
}

pub trait Ledger: Send + Sync {
    /// Sign with `signers` (the first pays fees) against a fresh blockhash,
    /// submit, and wait for confirmation.
    fn submit(
        &self,
        instructions: &[Instruction],
        signers: &[&Keypair],
    ) -> impl Future<Output = Result<Submitted, LedgerError>> + Send;

    /// Register for the fulfillment of `request`.
    ///
    /// Resolves once the subscription is live, so a settlement landing after
    /// this returns is never missed.
    fn subscribe_fulfillment(
        &self,
        request: Pubkey,
    ) -> impl Future<Output = Result<EventSubscription, LedgerError>> + Send;

    /// Search committed history for the fulfillment of `request`.
    fn find_fulfillment(
        &self,
        request: Pubkey,
    ) -> impl Future<Output = Result<Option<FulfillmentNotice>, LedgerError>> + Send;
}

/// Receiving side of a fulfillment subscription.
///
/// Dropping it deregisters: the producing task observes
/// [`SubscriptionHandle::cancelled`] and tears down its stream.
#[derive(Debug)]
pub struct EventSubscription {
    request: Pubkey,
    notices: mpsc::Receiver<FulfillmentNotice>,
}

/// Producing side of a fulfillment subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    request: Pubkey,
    notices: mpsc::Sender<FulfillmentNotice>,
}

impl EventSubscription {
    pub fn channel(request: Pubkey) -> (Self, SubscriptionHandle) {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        (
            Self {
                request,
                notices: rx,
            },
            SubscriptionHandle {
                request,
                notices: tx,
            },
        )
    }

    pub fn request(&self) -> Pubkey {
        self.request
    }

    /// Next notice for this request; `None` once every producer is gone.
    pub async fn next(&mut self) -> Option<FulfillmentNotice> {
        while let Some(notice) = self.notices.recv().await {
            if notice.request == self.request {
                return Some(notice);
            }
        }
        None
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.notices.close();
        debug!(request = %self.request, "Fulfillment subscription deregistered");
    }
}

impl SubscriptionHandle {
    pub fn request(&self) -> Pubkey {
        self.request
    }

    /// Hand a notice to the subscriber. Returns `false` once it has deregistered.
    pub fn deliver(&self, notice: FulfillmentNotice) -> bool {
        self.notices.try_send(notice).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.notices.is_closed()
    }

    /// Resolves when the subscriber deregisters.
    pub async fn cancelled(&self) {
        self.notices.closed().await
    }
}
