//! [`Ledger`] over Solana JSON-RPC (submission) and PubSub (fulfillment events).

use std::future::Future;
use std::sync::Arc;

use solana_client::client_error::ClientError;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_commitment_config::CommitmentConfig;
use solana_sdk::instruction::Instruction;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature, Signer};
use solana_sdk::transaction::{Transaction, TransactionError};
use tokio::sync::oneshot;

use crate::ledger::{EventSubscription, FulfillmentNotice, Ledger, LedgerError, Submitted};
use crate::listener;

/// Map an RPC client error onto the ledger taxonomy.
///
/// Dispatches on the structured transaction error, never on message text.
pub fn classify_client_error(err: &ClientError) -> LedgerError {
    match err.get_transaction_error() {
        Some(TransactionError::BlockhashNotFound) => LedgerError::StaleBlockhash,
        Some(tx_err) => LedgerError::Rejected(tx_err.to_string()),
        None => LedgerError::Transport(err.to_string()),
    }
}

/// Classify a failed send-and-confirm.
///
/// `blockhash_valid` is the ledger's verdict on the transaction's blockhash
/// after the failure. A transport failure against an expired blockhash means
/// the transaction can no longer land, so it is safe to rebuild.
pub fn classify_submit_error(err: &ClientError, blockhash_valid: Option<bool>) -> LedgerError {
    match classify_client_error(err) {
        LedgerError::Transport(_) if blockhash_valid == Some(false) => LedgerError::StaleBlockhash,
        other => other,
    }
}

pub struct RpcLedger {
    rpc: Arc<RpcClient>,
    ws_url: String,
    program_id: Pubkey,
}

impl RpcLedger {
    pub fn new(rpc_url: String, ws_url: String, program_id: Pubkey) -> Self {
        Self {
            rpc: Arc::new(RpcClient::new_with_commitment(
                rpc_url,
                CommitmentConfig::confirmed(),
            )),
            ws_url,
            program_id,
        }
    }

    pub fn rpc(&self) -> &Arc<RpcClient> {
        &self.rpc
    }

    /// Slot a confirmed signature landed in, falling back to the current slot.
    async fn signature_slot(&self, signature: &Signature) -> Result<u64, LedgerError> {
        let statuses = self
            .rpc
            .get_signature_statuses(&[*signature])
            .await
            .map_err(|e| classify_client_error(&e))?;

        match statuses.value.first().and_then(|status| status.as_ref()) {
            Some(status) => Ok(status.slot),
            None => self
                .rpc
                .get_slot()
                .await
                .map_err(|e| classify_client_error(&e)),
        }
    }
}

impl Ledger for RpcLedger {
    fn submit(
        &self,
        instructions: &[Instruction],
        signers: &[&Keypair],
    ) -> impl Future<Output = Result<Submitted, LedgerError>> + Send {
        async move {
            let payer = signers
                .first()
                .ok_or_else(|| LedgerError::Rejected("no fee payer".into()))?
                .pubkey();

            let blockhash = self
                .rpc
                .get_latest_blockhash()
                .await
                .map_err(|e| classify_client_error(&e))?;

            let tx = Transaction::new_signed_with_payer(instructions, Some(&payer), signers, blockhash);

            let signature = match self.rpc.send_and_confirm_transaction(&tx).await {
                Ok(signature) => signature,
                Err(e) => {
                    let blockhash_valid = self
                        .rpc
                        .is_blockhash_valid(&blockhash, CommitmentConfig::processed())
                        .await
                        .ok();
                    return Err(classify_submit_error(&e, blockhash_valid));
                }
            };

            let slot = self.signature_slot(&signature).await?;
            Ok(Submitted { signature, slot })
        }
    }

    fn subscribe_fulfillment(
        &self,
        request: Pubkey,
    ) -> impl Future<Output = Result<EventSubscription, LedgerError>> + Send {
        async move {
            let (subscription, handle) = EventSubscription::channel(request);
            let (ready_tx, ready_rx) = oneshot::channel();

            tokio::spawn(listener::watch_fulfillment(
                self.ws_url.clone(),
                self.rpc.clone(),
                self.program_id,
                handle,
                ready_tx,
            ));

            match ready_rx.await {
                Ok(Ok(())) => Ok(subscription),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(LedgerError::Transport(
                    "subscription task exited before registering".into(),
                )),
            }
        }
    }

    fn find_fulfillment(
        &self,
        request: Pubkey,
    ) -> impl Future<Output = Result<Option<FulfillmentNotice>, LedgerError>> + Send {
        async move { listener::find_fulfillment(&self.rpc, &self.program_id, &request).await }
    }
}
