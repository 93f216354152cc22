//! Client configuration loaded from environment variables.
//!
//! Required: `PROGRAM_ID`
//! Optional: `RPC_URL`, `WS_URL`, `PAYER_KEYPAIR_PATH`, `DICE_PROGRAM_ID`,
//!           `CLUSTER`, `NUM_BYTES`, `REQUEST_TIMEOUT_MS`,
//!           `MAX_SUBMIT_ATTEMPTS`, `SUBMIT_RETRY_DELAY_MS`, `COST_PER_BYTE`,
//!           `FULFILLMENT_SERVICE_PUBKEY`, `FULFILLMENT_SERVICE_KEYPAIR_PATH`

use anyhow::{Context, Result};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signer, read_keypair_file, write_keypair_file};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::orchestrator::RetryPolicy;

/// Fulfillment service identity used when initializing the program.
///
/// Resolved once at startup; `init` only reads it.
#[derive(Debug, Clone)]
pub enum ServiceBinding {
    /// An identity supplied by the operator.
    Existing(Pubkey),
    /// A fresh identity, already persisted at `path`.
    Generated { keypair: Arc<Keypair>, path: PathBuf },
}

impl ServiceBinding {
    /// `FULFILLMENT_SERVICE_PUBKEY` wins over `FULFILLMENT_SERVICE_KEYPAIR_PATH`.
    ///
    /// A keypair path naming a missing file gets a new keypair written to it,
    /// so the settling side can load the same identity. With neither set
    /// there is no binding.
    pub fn resolve(pubkey: Option<&str>, keypair_path: Option<&str>) -> Result<Option<Self>> {
        if let Some(pubkey) = pubkey {
            let pubkey = Pubkey::from_str(pubkey)
                .with_context(|| format!("invalid FULFILLMENT_SERVICE_PUBKEY: {pubkey}"))?;
            return Ok(Some(Self::Existing(pubkey)));
        }

        let Some(path) = keypair_path else {
            return Ok(None);
        };
        let expanded = PathBuf::from(shellexpand::tilde(path).to_string());
        if expanded.exists() {
            let keypair = load_keypair(path)?;
            return Ok(Some(Self::Existing(keypair.pubkey())));
        }

        let keypair = Keypair::new();
        persist_keypair(&keypair, &expanded)?;
        Ok(Some(Self::Generated {
            keypair: Arc::new(keypair),
            path: expanded,
        }))
    }

    pub fn pubkey(&self) -> Pubkey {
        match self {
            Self::Existing(pubkey) => *pubkey,
            Self::Generated { keypair, .. } => keypair.pubkey(),
        }
    }
}

fn persist_keypair(keypair: &Keypair, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    write_keypair_file(keypair, path)
        .map_err(|e| anyhow::anyhow!("{e}"))
        .with_context(|| format!("failed to write keypair to {}", path.display()))?;
    Ok(())
}

/// Application configuration for the randomness client.
#[derive(Clone)]
pub struct AppConfig {
    /// Solana JSON-RPC endpoint (HTTP).
    pub rpc_url: String,
    /// Solana PubSub endpoint (WebSocket) for log subscriptions.
    pub ws_url: String,
    /// Fee payer and requester.
    pub payer_keypair: Arc<Keypair>,
    /// The deployed randomness service program ID.
    pub program_id: Pubkey,
    /// The dice-consumer program ID; requests go through it when set.
    pub dice_program_id: Option<Pubkey>,
    /// Cluster name for explorer URLs.
    pub cluster: String,
    /// Bytes of randomness per request.
    pub num_bytes: u16,
    /// How long to wait for a fulfillment.
    pub request_timeout: Duration,
    /// Submission retry policy for stale blockhashes.
    pub retry: RetryPolicy,
    /// Fee rate used by `init`.
    pub cost_per_byte: u64,
    /// Fulfillment service bound by `init`, if configured.
    pub service_binding: Option<ServiceBinding>,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let rpc_url = lookup("RPC_URL").unwrap_or_else(|| "http://127.0.0.1:8899".into());
        let ws_url = lookup("WS_URL").unwrap_or_else(|| "ws://127.0.0.1:8900".into());

        let keypair_path =
            lookup("PAYER_KEYPAIR_PATH").unwrap_or_else(|| "~/.config/solana/id.json".into());
        let payer_keypair = load_keypair(&keypair_path)?;

        let program_id_str = lookup("PROGRAM_ID").context("PROGRAM_ID env var must be set")?;
        let program_id = Pubkey::from_str(&program_id_str)
            .with_context(|| format!("invalid PROGRAM_ID: {program_id_str}"))?;

        let dice_program_id = match lookup("DICE_PROGRAM_ID") {
            Some(s) => Some(
                Pubkey::from_str(&s).with_context(|| format!("invalid DICE_PROGRAM_ID: {s}"))?,
            ),
            None => None,
        };

        let cluster = lookup("CLUSTER").unwrap_or_else(|| "devnet".into());

        let num_bytes = lookup("NUM_BYTES")
            .and_then(|v| v.parse().ok())
            .unwrap_or(8);

        let request_timeout_ms = lookup("REQUEST_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(60_000);

        let default_retry = RetryPolicy::default();
        let max_attempts = lookup("MAX_SUBMIT_ATTEMPTS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(default_retry.max_attempts)
            .max(1);
        let retry_delay_ms = lookup("SUBMIT_RETRY_DELAY_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(default_retry.delay.as_millis() as u64);

        let cost_per_byte = lookup("COST_PER_BYTE")
            .and_then(|v| v.parse().ok())
            .unwrap_or(10_000);

        let service_binding = ServiceBinding::resolve(
            lookup("FULFILLMENT_SERVICE_PUBKEY").as_deref(),
            lookup("FULFILLMENT_SERVICE_KEYPAIR_PATH").as_deref(),
        )?;

        Ok(Self {
            rpc_url,
            ws_url,
            payer_keypair: Arc::new(payer_keypair),
            program_id,
            dice_program_id,
            cluster,
            num_bytes,
            request_timeout: Duration::from_millis(request_timeout_ms),
            retry: RetryPolicy {
                max_attempts,
                delay: Duration::from_millis(retry_delay_ms),
            },
            cost_per_byte,
            service_binding,
        })
    }

    /// Return the Solscan explorer URL for a given transaction signature.
    pub fn explorer_url(&self, signature: &str) -> String {
        match self.cluster.as_str() {
            "mainnet-beta" => format!("https://solscan.io/tx/{signature}"),
            cluster => format!("https://solscan.io/tx/{signature}?cluster={cluster}"),
        }
    }
}

fn load_keypair(path: &str) -> Result<Keypair> {
    let path = shellexpand::tilde(path).to_string();
    read_keypair_file(&path)
        .map_err(|e| anyhow::anyhow!("{e}"))
        .with_context(|| format!("failed to read keypair from {path}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn keypair_file(name: &str) -> (String, Keypair) {
        let keypair = Keypair::new();
        let path = std::env::temp_dir().join(format!("randomness-client-{name}-{}.json", std::process::id()));
        let path = path.to_string_lossy().to_string();
        write_keypair_file(&keypair, &path).unwrap();
        (path, keypair)
    }

    fn lookup(vars: HashMap<&'static str, String>) -> impl Fn(&str) -> Option<String> {
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let (path, payer) = keypair_file("defaults");
        let program_id = Pubkey::new_unique();
        let config = AppConfig::from_lookup(lookup(HashMap::from([
            ("PAYER_KEYPAIR_PATH", path),
            ("PROGRAM_ID", program_id.to_string()),
        ])))
        .unwrap();

        assert_eq!(config.program_id, program_id);
        assert_eq!(config.payer_keypair.pubkey(), payer.pubkey());
        assert_eq!(config.num_bytes, 8);
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.cost_per_byte, 10_000);
        assert!(config.dice_program_id.is_none());
        assert!(config.service_binding.is_none());
    }

    #[test]
    fn missing_program_id_is_an_error() {
        let (path, _) = keypair_file("missing");
        let result = AppConfig::from_lookup(lookup(HashMap::from([("PAYER_KEYPAIR_PATH", path)])));
        assert!(result.is_err());
    }

    #[test]
    fn retry_attempts_are_at_least_one() {
        let (path, _) = keypair_file("retry");
        let config = AppConfig::from_lookup(lookup(HashMap::from([
            ("PAYER_KEYPAIR_PATH", path),
            ("PROGRAM_ID", Pubkey::new_unique().to_string()),
            ("MAX_SUBMIT_ATTEMPTS", "0".to_string()),
            ("SUBMIT_RETRY_DELAY_MS", "250".to_string()),
        ])))
        .unwrap();
        assert_eq!(config.retry.max_attempts, 1);
        assert_eq!(config.retry.delay, Duration::from_millis(250));
    }

    #[test]
    fn service_binding_prefers_explicit_pubkey() {
        let (path, service) = keypair_file("service");
        let explicit = Pubkey::new_unique();

        let binding = ServiceBinding::resolve(Some(&explicit.to_string()), Some(&path)).unwrap();
        assert_eq!(binding.map(|b| b.pubkey()), Some(explicit));

        let binding = ServiceBinding::resolve(None, Some(&path)).unwrap();
        assert!(matches!(binding, Some(ServiceBinding::Existing(pk)) if pk == service.pubkey()));

        assert!(ServiceBinding::resolve(None, None).unwrap().is_none());
        assert!(ServiceBinding::resolve(Some("not-a-key"), None).is_err());
    }

    #[test]
    fn generated_service_identity_is_persisted_and_reused() {
        let dir = std::env::temp_dir().join(format!("randomness-client-gen-{}", std::process::id()));
        let path = dir.join("service.json");
        let _ = std::fs::remove_dir_all(&dir);
        let path_str = path.to_string_lossy().to_string();

        let Some(ServiceBinding::Generated { keypair, path: written }) =
            ServiceBinding::resolve(None, Some(&path_str)).unwrap()
        else {
            panic!("expected a generated identity");
        };
        assert_eq!(written, path);
        let stored = read_keypair_file(&path).unwrap();
        assert_eq!(stored.pubkey(), keypair.pubkey());

        // A second startup binds the same identity instead of a new one.
        let binding = ServiceBinding::resolve(None, Some(&path_str)).unwrap();
        assert!(matches!(binding, Some(ServiceBinding::Existing(pk)) if pk == keypair.pubkey()));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn binding_is_resolved_with_the_rest_of_the_config() {
        let (path, _) = keypair_file("startup");
        let (service_path, service) = keypair_file("startup-service");
        let config = AppConfig::from_lookup(lookup(HashMap::from([
            ("PAYER_KEYPAIR_PATH", path.clone()),
            ("PROGRAM_ID", Pubkey::new_unique().to_string()),
            ("FULFILLMENT_SERVICE_KEYPAIR_PATH", service_path),
        ])))
        .unwrap();
        assert_eq!(
            config.service_binding.map(|b| b.pubkey()),
            Some(service.pubkey())
        );

        let result = AppConfig::from_lookup(lookup(HashMap::from([
            ("PAYER_KEYPAIR_PATH", path),
            ("PROGRAM_ID", Pubkey::new_unique().to_string()),
            ("FULFILLMENT_SERVICE_PUBKEY", "bogus".to_string()),
        ])));
        assert!(result.is_err());
    }
}
