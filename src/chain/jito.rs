//! Block-builder bundle submission over JSON-RPC.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use tracing::{debug, info, instrument, warn};

use super::{BlockBuilder, SignedTx};

/// Accounts the block engine accepts tips on.
pub const JITO_TIP_ACCOUNTS: [&str; 8] = [
    "96gYZGLnJYVFmbjzopPSU6QiEV5fGqZNyN9nmNhvrZU5",
    "HFqU5x63VTqvQss8hp11i4wVV8bD44PvwucfZ2bU7gRe",
    "Cw8CFyM9FkoMi7K7Crf6HNQqf4uEMzpKw6QNghXLvLkY",
    "ADaUMid9yfUytqMBgopwjb2DTLSokTSzL1zt6iGPaS49",
    "DfXygSm4jCyNCybVYYK6DwvWqjKee8pbDmJGcLWNDXjh",
    "ADuUkR4vqLUMWXxW9gh6D6L8pMSawimctcNZ5pGwDcEt",
    "DttWaMuVvTiduZRnguLF7jNxTgiMBZ1hyAumKUiL2KRL",
    "3AVi9Tg9Uo68tJfuvoKvqKNWKkC5wPdSSdeBnizKZ6jT",
];

const SUBMIT_ATTEMPTS: usize = 3;

/// Pick a tip recipient at random to spread load across the tip accounts.
pub fn random_tip_account() -> &'static str {
    JITO_TIP_ACCOUNTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(JITO_TIP_ACCOUNTS[0])
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// Either the bundle id or the builder's refusal. Transport failures are the
/// outer `Err` and get retried; refusals are final.
type SubmitOutcome = std::result::Result<String, String>;

pub struct JitoBlockBuilder {
    http: reqwest::Client,
    url: String,
    auth: Option<String>,
}

impl JitoBlockBuilder {
    pub fn new(http: reqwest::Client, url: impl Into<String>, auth: Option<String>) -> Self {
        Self {
            http,
            url: url.into(),
            auth,
        }
    }

    async fn submit_once(&self, body: &Value) -> Result<SubmitOutcome> {
        let mut request = self.http.post(&self.url).json(body);
        if let Some(auth) = &self.auth {
            request = request.header("x-jito-auth", auth);
        }
        let response = request.send().await.context("bundle submission failed")?;
        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(anyhow!("block builder returned {}", status));
        }
        let parsed: JsonRpcResponse = response
            .json()
            .await
            .context("unreadable block builder response")?;
        Ok(parse_submit_response(parsed))
    }
}

fn parse_submit_response(response: JsonRpcResponse) -> SubmitOutcome {
    if let Some(error) = response.error {
        return Err(format!("{} ({})", error.message, error.code));
    }
    match response.result {
        Some(Value::String(bundle_id)) => Ok(bundle_id),
        other => Err(format!("unexpected sendBundle result: {:?}", other)),
    }
}

#[async_trait]
impl BlockBuilder for JitoBlockBuilder {
    #[instrument(skip(self, transactions), fields(size = transactions.len()))]
    async fn send_bundle(&self, transactions: &[SignedTx]) -> Result<String> {
        let encoded: Vec<String> = transactions.iter().map(SignedTx::to_base58).collect();
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "sendBundle",
            "params": [encoded],
        });

        let strategy = ExponentialBackoff::from_millis(100)
            .max_delay(Duration::from_secs(2))
            .take(SUBMIT_ATTEMPTS);
        let outcome = Retry::spawn(strategy, || async {
            self.submit_once(&body).await.map_err(|e| {
                warn!("Bundle submission attempt failed: {:#}", e);
                e
            })
        })
        .await?;

        match outcome {
            Ok(bundle_id) => {
                info!("Bundle accepted: {}", bundle_id);
                Ok(bundle_id)
            }
            Err(reason) => {
                debug!("Bundle refused: {}", reason);
                Err(anyhow!("bundle refused: {}", reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::pubkey::Pubkey;
    use std::str::FromStr;

    #[test]
    fn test_parse_submit_response() {
        let ok: JsonRpcResponse = serde_json::from_value(json!({"jsonrpc": "2.0", "id": 1, "result": "b-123"})).unwrap();
        assert_eq!(parse_submit_response(ok), Ok("b-123".to_string()));

        let refused: JsonRpcResponse = serde_json::from_value(json!({
            "jsonrpc": "2.0", "id": 1,
            "error": {"code": -32602, "message": "bundle contains an already processed transaction"}
        }))
        .unwrap();
        let reason = parse_submit_response(refused).unwrap_err();
        assert!(reason.contains("already processed"));
    }

    #[test]
    fn test_tip_accounts_are_valid() {
        for account in JITO_TIP_ACCOUNTS {
            assert!(Pubkey::from_str(account).is_ok(), "{}", account);
        }
        assert!(JITO_TIP_ACCOUNTS.contains(&random_tip_account()));
    }
}
