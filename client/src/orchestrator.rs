//! Request orchestration: submit a randomness request, survive stale
//! blockhashes, and wait for its fulfillment or a timeout.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use solana_sdk::instruction::Instruction;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature, Signer};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::addresses::{config_address, escrow_address};
use crate::instructions::{self, CallbackSpec, MAX_NUM_BYTES};
use crate::ledger::{FulfillmentNotice, Ledger, LedgerError, Submitted};
use crate::metrics::Metrics;

/// Resubmission policy for transactions whose blockhash went stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total submissions, the first included.
    pub max_attempts: u32,
    /// Fixed pause between submissions.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("blockhash still stale after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("fulfillment subscription for {0} closed before delivery")]
    SubscriptionClosed(Pubkey),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// A fulfilled request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fulfillment {
    #[serde(serialize_with = "display")]
    pub request: Pubkey,
    pub is_success: bool,
    pub randomness: Vec<u8>,
    /// Slots between the request transaction and the settlement.
    pub slots_elapsed: u64,
    #[serde(serialize_with = "display")]
    pub request_signature: Signature,
    #[serde(serialize_with = "display")]
    pub settle_signature: Signature,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Fulfilled(Fulfillment),
    /// Nothing arrived in time. The request itself stays live on the ledger.
    TimedOut { request: Pubkey, signature: Signature },
}

fn display<T: std::fmt::Display, S: serde::Serializer>(value: &T, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(value)
}

/// Everything a request needs, passed explicitly.
pub struct ClientContext<L> {
    pub ledger: L,
    pub payer: Arc<Keypair>,
    pub program_id: Pubkey,
    pub config_address: Pubkey,
    pub metrics: Arc<Metrics>,
    pub retry: RetryPolicy,
}

impl<L: Ledger> ClientContext<L> {
    pub fn new(ledger: L, payer: Arc<Keypair>, program_id: Pubkey, retry: RetryPolicy) -> Self {
        Self {
            ledger,
            payer,
            program_id,
            config_address: config_address(&program_id).0,
            metrics: Arc::new(Metrics::new()),
            retry,
        }
    }
}

pub struct Orchestrator<L> {
    ctx: ClientContext<L>,
}

impl<L: Ledger> Orchestrator<L> {
    pub fn new(ctx: ClientContext<L>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &ClientContext<L> {
        &self.ctx
    }

    /// Request `num_bytes` of randomness directly from the service and wait
    /// up to `timeout` for the fulfillment.
    pub async fn request_and_await(
        &self,
        num_bytes: u16,
        callback: CallbackSpec,
        timeout: Duration,
    ) -> Result<RequestOutcome, OrchestratorError> {
        if num_bytes == 0 || num_bytes > MAX_NUM_BYTES {
            return Err(OrchestratorError::InvalidRequest(format!(
                "num_bytes must be in 1..={MAX_NUM_BYTES}, got {num_bytes}"
            )));
        }
        if !callback.fits() {
            return Err(OrchestratorError::InvalidRequest(
                "callback exceeds the request record capacity".into(),
            ));
        }

        let request = Keypair::new();
        debug!(
            num_bytes,
            has_callback = callback.is_defined(),
            "Building randomness request"
        );
        let ix = instructions::request_randomness(
            &self.ctx.program_id,
            &self.ctx.payer.pubkey(),
            &self.ctx.config_address,
            &request.pubkey(),
            num_bytes,
            &callback,
        );
        self.submit_and_await(&request, vec![ix], timeout).await
    }

    /// Submit `instructions` that create the request `request` (directly or
    /// through a requester program) and wait for its fulfillment.
    pub async fn submit_and_await(
        &self,
        request: &Keypair,
        instructions: Vec<Instruction>,
        timeout: Duration,
    ) -> Result<RequestOutcome, OrchestratorError> {
        let request_key = request.pubkey();
        info!(
            request = %request_key,
            escrow = %escrow_address(&request_key),
            "Submitting randomness request"
        );

        // Registered before submission so an immediate settlement is not missed.
        let mut subscription = self.ctx.ledger.subscribe_fulfillment(request_key).await?;

        let signers = [self.ctx.payer.as_ref(), request];
        let submitted = self.submit_with_retry(&instructions, &signers).await?;
        self.ctx.metrics.record_submitted();
        info!(
            request = %request_key,
            signature = %submitted.signature,
            slot = submitted.slot,
            "Request committed, awaiting fulfillment"
        );

        match tokio::time::timeout(timeout, subscription.next()).await {
            Ok(Some(notice)) => Ok(self.fulfilled(&submitted, notice)),
            Ok(None) => Err(OrchestratorError::SubscriptionClosed(request_key)),
            Err(_) => {
                drop(subscription);
                // The watch may have missed a settlement across a dropped stream.
                match self.ctx.ledger.find_fulfillment(request_key).await {
                    Ok(Some(notice)) => {
                        info!(request = %request_key, "Fulfillment found in history after timeout");
                        return Ok(self.fulfilled(&submitted, notice));
                    }
                    Ok(None) => {}
                    Err(e) => warn!(request = %request_key, error = %e, "History lookup failed"),
                }
                self.ctx.metrics.record_timeout();
                warn!(request = %request_key, timeout = ?timeout, "Timed out waiting for fulfillment");
                Ok(RequestOutcome::TimedOut {
                    request: request_key,
                    signature: submitted.signature,
                })
            }
        }
    }

    fn fulfilled(&self, submitted: &Submitted, notice: FulfillmentNotice) -> RequestOutcome {
        let slots_elapsed = notice.slot.saturating_sub(submitted.slot);
        self.ctx
            .metrics
            .record_fulfillment(slots_elapsed, notice.is_success);
        info!(
            request = %notice.request,
            is_success = notice.is_success,
            slots = slots_elapsed,
            "Request fulfilled"
        );
        RequestOutcome::Fulfilled(Fulfillment {
            request: notice.request,
            is_success: notice.is_success,
            randomness: notice.randomness,
            slots_elapsed,
            request_signature: submitted.signature,
            settle_signature: notice.signature,
        })
    }

    /// Submit, resending on a stale blockhash with a fixed backoff.
    ///
    /// `signers[0]` pays the fees. Any error other than a stale blockhash is
    /// returned immediately.
    #[instrument(skip_all, fields(instructions = instructions.len()))]
    pub async fn submit_with_retry(
        &self,
        instructions: &[Instruction],
        signers: &[&Keypair],
    ) -> Result<Submitted, OrchestratorError> {
        let policy = self.ctx.retry;

        for attempt in 1..=policy.max_attempts {
            match self.ctx.ledger.submit(instructions, signers).await {
                Ok(submitted) => return Ok(submitted),
                Err(LedgerError::StaleBlockhash) => {
                    self.ctx.metrics.record_stale_retry();
                    warn!(attempt, delay = ?policy.delay, "Stale blockhash, retrying");
                    if attempt < policy.max_attempts {
                        tokio::time::sleep(policy.delay).await;
                    }
                }
                Err(e) => {
                    self.ctx.metrics.record_submit_failure();
                    return Err(e.into());
                }
            }
        }

        self.ctx.metrics.record_submit_failure();
        Err(OrchestratorError::RetriesExhausted {
            attempts: policy.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{EventSubscription, SubscriptionHandle};
    use std::collections::VecDeque;
    use std::future::Future;
    use std::sync::Mutex;
    use std::sync::atomic::Ordering;

    /// In-memory ledger replaying scripted submission results.
    #[derive(Default)]
    struct MockLedger {
        responses: Mutex<VecDeque<Result<(), LedgerError>>>,
        submissions: Mutex<u32>,
        handles: Mutex<Vec<SubscriptionHandle>>,
        /// Randomness published to live subscriptions after a successful submit.
        fulfill_with: Option<Vec<u8>>,
        /// Settlement the history lookup reports, `(randomness, slot)`.
        history: Option<(Vec<u8>, u64)>,
        lookups: Mutex<u32>,
    }

    impl MockLedger {
        fn scripted(responses: Vec<Result<(), LedgerError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                ..Default::default()
            }
        }

        fn fulfilling(mut self, randomness: Vec<u8>) -> Self {
            self.fulfill_with = Some(randomness);
            self
        }

        fn with_history(mut self, randomness: Vec<u8>, slot: u64) -> Self {
            self.history = Some((randomness, slot));
            self
        }

        fn lookups(&self) -> u32 {
            *self.lookups.lock().unwrap()
        }

        fn submissions(&self) -> u32 {
            *self.submissions.lock().unwrap()
        }

        /// Deliver a notice to every registered subscription; returns how many accepted it.
        fn publish(&self, randomness: &[u8], slot: u64) -> usize {
            self.handles
                .lock()
                .unwrap()
                .iter()
                .filter(|handle| {
                    handle.deliver(FulfillmentNotice {
                        request: handle.request(),
                        is_success: true,
                        randomness: randomness.to_vec(),
                        slot,
                        signature: Signature::from([0xAB; 64]),
                    })
                })
                .count()
        }
    }

    impl Ledger for MockLedger {
        fn submit(
            &self,
            _instructions: &[Instruction],
            _signers: &[&Keypair],
        ) -> impl Future<Output = Result<Submitted, LedgerError>> + Send {
            async move {
                let slot = {
                    let mut submissions = self.submissions.lock().unwrap();
                    *submissions += 1;
                    100 + u64::from(*submissions)
                };
                let response = self.responses.lock().unwrap().pop_front().unwrap_or(Ok(()));
                response?;

                if let Some(randomness) = &self.fulfill_with {
                    self.publish(randomness, slot + 3);
                }
                Ok(Submitted {
                    signature: Signature::from([slot as u8; 64]),
                    slot,
                })
            }
        }

        fn subscribe_fulfillment(
            &self,
            request: Pubkey,
        ) -> impl Future<Output = Result<EventSubscription, LedgerError>> + Send {
            async move {
                let (subscription, handle) = EventSubscription::channel(request);
                self.handles.lock().unwrap().push(handle);
                Ok(subscription)
            }
        }

        fn find_fulfillment(
            &self,
            request: Pubkey,
        ) -> impl Future<Output = Result<Option<FulfillmentNotice>, LedgerError>> + Send {
            async move {
                *self.lookups.lock().unwrap() += 1;
                Ok(self.history.clone().map(|(randomness, slot)| FulfillmentNotice {
                    request,
                    is_success: true,
                    randomness,
                    slot,
                    signature: Signature::from([0xCD; 64]),
                }))
            }
        }
    }

    fn orchestrator(ledger: MockLedger) -> Orchestrator<MockLedger> {
        Orchestrator::new(ClientContext::new(
            ledger,
            Arc::new(Keypair::new()),
            Pubkey::new_unique(),
            RetryPolicy::default(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn three_stale_blockhashes_then_success() {
        let ledger = MockLedger::scripted(vec![
            Err(LedgerError::StaleBlockhash),
            Err(LedgerError::StaleBlockhash),
            Err(LedgerError::StaleBlockhash),
            Ok(()),
        ])
        .fulfilling(vec![7; 8]);
        let orchestrator = orchestrator(ledger);

        let start = tokio::time::Instant::now();
        let outcome = orchestrator
            .request_and_await(8, CallbackSpec::none(), Duration::from_secs(30))
            .await
            .unwrap();

        let RequestOutcome::Fulfilled(fulfillment) = outcome else {
            panic!("expected a fulfillment, got {outcome:?}");
        };
        assert!(fulfillment.is_success);
        assert_eq!(fulfillment.randomness, vec![7; 8]);
        assert_eq!(fulfillment.slots_elapsed, 3);

        let ctx = orchestrator.context();
        assert_eq!(ctx.ledger.submissions(), 4);
        assert_eq!(ctx.metrics.stale_blockhash_retries.load(Ordering::Relaxed), 3);
        assert_eq!(ctx.metrics.submit_failures.load(Ordering::Relaxed), 0);
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_blockhash_retries_are_bounded() {
        let ledger = MockLedger::scripted(vec![Err(LedgerError::StaleBlockhash); 10]);
        let orchestrator = orchestrator(ledger);

        let err = orchestrator
            .request_and_await(8, CallbackSpec::none(), Duration::from_secs(30))
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::RetriesExhausted { attempts: 5 }));
        assert_eq!(orchestrator.context().ledger.submissions(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn other_ledger_errors_are_not_retried() {
        let ledger = MockLedger::scripted(vec![Err(LedgerError::Rejected(
            "custom program error: 0x1770".into(),
        ))]);
        let orchestrator = orchestrator(ledger);

        let err = orchestrator
            .request_and_await(8, CallbackSpec::none(), Duration::from_secs(30))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OrchestratorError::Ledger(LedgerError::Rejected(_))
        ));
        assert_eq!(orchestrator.context().ledger.submissions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_an_outcome_and_deregisters() {
        let orchestrator = orchestrator(MockLedger::default());

        let outcome = orchestrator
            .request_and_await(8, CallbackSpec::none(), Duration::from_secs(30))
            .await
            .unwrap();

        assert!(matches!(outcome, RequestOutcome::TimedOut { .. }));
        let ctx = orchestrator.context();
        assert_eq!(ctx.ledger.lookups(), 1);
        assert_eq!(ctx.metrics.requests_timed_out.load(Ordering::Relaxed), 1);
        assert_eq!(ctx.ledger.publish(&[1; 8], 500), 0);
        assert!(ctx.ledger.handles.lock().unwrap().iter().all(|h| h.is_closed()));
    }

    #[tokio::test(start_paused = true)]
    async fn settlement_missed_by_the_watch_is_found_after_timeout() {
        let orchestrator = orchestrator(MockLedger::default().with_history(vec![4; 8], 140));

        let outcome = orchestrator
            .request_and_await(8, CallbackSpec::none(), Duration::from_secs(30))
            .await
            .unwrap();

        let RequestOutcome::Fulfilled(fulfillment) = outcome else {
            panic!("expected a fulfillment, got {outcome:?}");
        };
        assert_eq!(fulfillment.randomness, vec![4; 8]);
        assert_eq!(fulfillment.slots_elapsed, 39);
        assert_eq!(fulfillment.settle_signature, Signature::from([0xCD; 64]));

        let ctx = orchestrator.context();
        assert_eq!(ctx.ledger.lookups(), 1);
        assert_eq!(ctx.metrics.requests_timed_out.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn invalid_length_is_rejected_before_submission() {
        let orchestrator = orchestrator(MockLedger::default());
        for num_bytes in [0, MAX_NUM_BYTES + 1] {
            let err = orchestrator
                .request_and_await(num_bytes, CallbackSpec::none(), Duration::from_secs(1))
                .await
                .unwrap_err();
            assert!(matches!(err, OrchestratorError::InvalidRequest(_)));
        }
        assert_eq!(orchestrator.context().ledger.submissions(), 0);
    }
}
