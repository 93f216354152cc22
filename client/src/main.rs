//! Randomness client
//!
//! Command-line front end over the client library:
//!
//! - `request` (default): request randomness and wait for the fulfillment.
//!   Goes through the dice consumer when `DICE_PROGRAM_ID` is set.
//! - `init`: create the service configuration and bind the fulfillment service.
//! - `pending`: list requests that are not completed yet.
//! - `replay <signature>`: decode the service events of a committed transaction.
//! - `close-request <pubkey>`: reclaim a completed or expired request.
//! - `close-requests`: reclaim every request the payer may close.
//! - `set-service <pubkey>`: rebind the fulfillment service (authority only).
//! - `close-config`: sweep the fee wallet and tear down the configuration.

use anyhow::{Context, Result, bail};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature, Signer};
use std::str::FromStr;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use randomness_client::config::{AppConfig, ServiceBinding};
use randomness_client::instructions::{self, CallbackSpec};
use randomness_client::listener;
use randomness_client::orchestrator::{ClientContext, Orchestrator, RequestOutcome};
use randomness_client::rpc::RpcLedger;

const USAGE: &str = "usage: randomness-client [request | init | pending | replay <signature> | close-request <pubkey> | close-requests | set-service <pubkey> | close-config]";

/// Close instructions packed into one transaction.
const CLOSES_PER_TX: usize = 4;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,solana_client=warn,solana_rpc_client=warn")),
        )
        .with_target(true)
        .with_ansi(true)
        .init();

    let config = AppConfig::from_env().context("invalid configuration")?;

    info!(
        program = %config.program_id,
        payer = %config.payer_keypair.pubkey(),
        "Starting randomness client"
    );
    info!(rpc = %config.rpc_url, ws = %config.ws_url, "Endpoints configured");

    let ledger = RpcLedger::new(config.rpc_url.clone(), config.ws_url.clone(), config.program_id);
    let orchestrator = Orchestrator::new(ClientContext::new(
        ledger,
        config.payer_keypair.clone(),
        config.program_id,
        config.retry,
    ));

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str).unwrap_or("request") {
        "request" => request(&config, &orchestrator).await?,
        "init" => init(&config, &orchestrator).await?,
        "pending" => pending(&config, &orchestrator).await?,
        "replay" => {
            let signature = args.get(1).context(USAGE)?;
            replay(&config, &orchestrator, signature).await?
        }
        "close-request" => {
            let request = args.get(1).context(USAGE)?;
            close_request(&config, &orchestrator, request).await?
        }
        "close-requests" => close_requests(&config, &orchestrator).await?,
        "set-service" => {
            let service = args.get(1).context(USAGE)?;
            set_service(&config, &orchestrator, service).await?
        }
        "close-config" => close_config(&config, &orchestrator).await?,
        other => bail!("unknown command {other}\n{USAGE}"),
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&orchestrator.context().metrics.to_json())?
    );
    Ok(())
}

async fn request(config: &AppConfig, orchestrator: &Orchestrator<RpcLedger>) -> Result<()> {
    let outcome = match config.dice_program_id {
        Some(dice_program_id) => {
            let request = Keypair::new();
            let ix = instructions::request_roll(
                &dice_program_id,
                &config.program_id,
                &config.payer_keypair.pubkey(),
                &orchestrator.context().config_address,
                &request.pubkey(),
            );
            orchestrator
                .submit_and_await(&request, vec![ix], config.request_timeout)
                .await?
        }
        None => {
            orchestrator
                .request_and_await(config.num_bytes, CallbackSpec::none(), config.request_timeout)
                .await?
        }
    };

    match outcome {
        RequestOutcome::Fulfilled(fulfillment) => {
            info!(
                request = %fulfillment.request,
                explorer = %config.explorer_url(&fulfillment.settle_signature.to_string()),
                "Settlement transaction"
            );
            println!("{}", serde_json::to_string_pretty(&fulfillment)?);
        }
        RequestOutcome::TimedOut { request, signature } => {
            warn!(
                request = %request,
                explorer = %config.explorer_url(&signature.to_string()),
                "No fulfillment within {:?}; the request stays open until settled or closed",
                config.request_timeout
            );
        }
    }
    Ok(())
}

async fn init(config: &AppConfig, orchestrator: &Orchestrator<RpcLedger>) -> Result<()> {
    let binding = config.service_binding.as_ref().context(
        "init needs FULFILLMENT_SERVICE_PUBKEY or FULFILLMENT_SERVICE_KEYPAIR_PATH",
    )?;
    if let ServiceBinding::Generated { keypair, path } = binding {
        warn!(
            service = %keypair.pubkey(),
            path = %path.display(),
            "Bound a freshly generated fulfillment service identity"
        );
    }

    let ctx = orchestrator.context();
    let ix = instructions::initialize(
        &config.program_id,
        &config.payer_keypair.pubkey(),
        &ctx.config_address,
        &binding.pubkey(),
        config.cost_per_byte,
    );
    let submitted = orchestrator
        .submit_with_retry(&[ix], &[config.payer_keypair.as_ref()])
        .await?;

    info!(
        config = %ctx.config_address,
        service = %binding.pubkey(),
        cost_per_byte = config.cost_per_byte,
        explorer = %config.explorer_url(&submitted.signature.to_string()),
        "Randomness service initialized"
    );
    Ok(())
}

async fn pending(config: &AppConfig, orchestrator: &Orchestrator<RpcLedger>) -> Result<()> {
    let rpc = orchestrator.context().ledger.rpc();
    let pending = listener::pending_requests(rpc, &config.program_id).await?;
    println!("{}", serde_json::to_string_pretty(&pending)?);
    Ok(())
}

async fn replay(
    config: &AppConfig,
    orchestrator: &Orchestrator<RpcLedger>,
    signature: &str,
) -> Result<()> {
    let signature =
        Signature::from_str(signature).with_context(|| format!("invalid signature: {signature}"))?;
    let rpc = orchestrator.context().ledger.rpc();

    let events = listener::fetch_transaction_events(rpc, &config.program_id, &signature).await?;

    if let Some(requested) = &events.requested {
        info!(
            request = %requested.request,
            requester = %requested.requester,
            num_bytes = requested.num_bytes,
            callback_program = %requested.callback_program,
            "RandomnessRequested"
        );
    }
    if let Some(closed) = &events.closed {
        info!(
            request = %closed.request,
            requester = %closed.requester,
            refunded = closed.refunded,
            "RequestClosed"
        );
    }
    for notice in &events.fulfilled {
        println!(
            "{}",
            serde_json::json!({
                "request": notice.request.to_string(),
                "is_success": notice.is_success,
                "randomness": notice.randomness,
                "slot": notice.slot,
            })
        );
    }
    if events.is_empty() {
        warn!(signature = %signature, slot = events.slot, "No randomness service events in transaction");
    }
    Ok(())
}

async fn close_request(
    config: &AppConfig,
    orchestrator: &Orchestrator<RpcLedger>,
    request: &str,
) -> Result<()> {
    let request =
        Pubkey::from_str(request).with_context(|| format!("invalid request pubkey: {request}"))?;
    let ctx = orchestrator.context();

    let data = ctx
        .ledger
        .rpc()
        .get_account_data(&request)
        .await
        .with_context(|| format!("failed to fetch request {request}"))?;
    let record = listener::parse_request_prefix(request, &data)
        .with_context(|| format!("{request} is not a randomness request"))?;

    let ix = instructions::close_request(
        &config.program_id,
        &config.payer_keypair.pubkey(),
        &ctx.config_address,
        &request,
        &record.requester,
    );
    let submitted = orchestrator
        .submit_with_retry(&[ix], &[config.payer_keypair.as_ref()])
        .await?;

    info!(
        request = %request,
        requester = %record.requester,
        explorer = %config.explorer_url(&submitted.signature.to_string()),
        "Request closed"
    );
    Ok(())
}

async fn close_requests(config: &AppConfig, orchestrator: &Orchestrator<RpcLedger>) -> Result<()> {
    let ctx = orchestrator.context();
    let rpc = ctx.ledger.rpc();
    let signer = config.payer_keypair.pubkey();

    let config_data = rpc
        .get_account_data(&ctx.config_address)
        .await
        .context("failed to fetch the service configuration")?;
    let authority = listener::parse_config_authority(&config_data)
        .context("service configuration has an unexpected layout")?;

    let records = listener::request_records(rpc, &config.program_id).await?;
    let current_slot = rpc.get_slot().await.context("failed to fetch the current slot")?;
    let closable = listener::closable(&records, &signer, &authority, current_slot);
    info!(
        records = records.len(),
        closable = closable.len(),
        slot = current_slot,
        "Closing requests"
    );

    for batch in closable.chunks(CLOSES_PER_TX) {
        let ixs: Vec<_> = batch
            .iter()
            .map(|record| {
                instructions::close_request(
                    &config.program_id,
                    &signer,
                    &ctx.config_address,
                    &record.request,
                    &record.requester,
                )
            })
            .collect();
        let submitted = orchestrator
            .submit_with_retry(&ixs, &[config.payer_keypair.as_ref()])
            .await?;
        info!(
            count = batch.len(),
            explorer = %config.explorer_url(&submitted.signature.to_string()),
            "Requests closed"
        );
    }
    Ok(())
}

async fn set_service(
    config: &AppConfig,
    orchestrator: &Orchestrator<RpcLedger>,
    service: &str,
) -> Result<()> {
    let service =
        Pubkey::from_str(service).with_context(|| format!("invalid service pubkey: {service}"))?;
    let ctx = orchestrator.context();

    let ix = instructions::set_fulfillment_service(
        &config.program_id,
        &config.payer_keypair.pubkey(),
        &ctx.config_address,
        &service,
    );
    let submitted = orchestrator
        .submit_with_retry(&[ix], &[config.payer_keypair.as_ref()])
        .await?;

    info!(
        service = %service,
        explorer = %config.explorer_url(&submitted.signature.to_string()),
        "Fulfillment service rebound"
    );
    Ok(())
}

async fn close_config(config: &AppConfig, orchestrator: &Orchestrator<RpcLedger>) -> Result<()> {
    let ctx = orchestrator.context();

    let records = listener::request_records(ctx.ledger.rpc(), &config.program_id).await?;
    if !records.is_empty() {
        bail!(
            "{} request records are still open; run close-requests once they are closable",
            records.len()
        );
    }

    let ix = instructions::close_config(
        &config.program_id,
        &config.payer_keypair.pubkey(),
        &ctx.config_address,
    );
    let submitted = orchestrator
        .submit_with_retry(&[ix], &[config.payer_keypair.as_ref()])
        .await?;

    info!(
        config = %ctx.config_address,
        explorer = %config.explorer_url(&submitted.signature.to_string()),
        "Randomness service configuration closed"
    );
    Ok(())
}
