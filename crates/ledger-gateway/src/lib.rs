//! Ledger client implementations: a JSON-RPC gateway client for the
//! permissioned ledger and an in-memory stub for development and tests.
//!
//! Neither implementation retries; error classification here drives the
//! scheduler's retry decisions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ledgerlog_core::{BatchAnchor, LedgerBatchRecord, LedgerClient, LedgerError};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

/// Per-call deadlines, taken from the `[ledger]` configuration.
#[derive(Debug, Clone)]
pub struct GatewayTimeouts {
    pub invoke: Duration,
    pub query: Duration,
}

impl Default for GatewayTimeouts {
    fn default() -> Self {
        Self {
            invoke: Duration::from_secs(30),
            query: Duration::from_secs(10),
        }
    }
}

/// JSON-RPC client for the ledger gateway. Authorization is ambient (mTLS at
/// the transport); the channel and contract name scope every call.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    client: Client,
    endpoint: String,
    channel: String,
    contract: String,
    timeouts: GatewayTimeouts,
}

#[derive(Debug, Serialize)]
pub struct GatewayRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Deserialize)]
pub struct GatewayRpcResponse {
    #[allow(dead_code)]
    pub jsonrpc: String,
    #[allow(dead_code)]
    pub id: u64,
    pub result: Option<Value>,
    pub error: Option<GatewayRpcError>,
}

#[derive(Debug, Deserialize)]
pub struct GatewayRpcError {
    pub code: i32,
    pub message: String,
    #[allow(dead_code)]
    pub data: Option<Value>,
}

impl GatewayClient {
    pub fn new(
        endpoint: String,
        channel: String,
        contract: String,
        timeouts: GatewayTimeouts,
    ) -> Result<Self, LedgerError> {
        let client = Client::builder()
            .build()
            .map_err(|e| LedgerError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            channel,
            contract,
            timeouts,
        })
    }

    async fn rpc_call(
        &self,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, LedgerError> {
        let request = GatewayRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: 1,
            method: method.to_string(),
            params,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .timeout(deadline)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LedgerError::Timeout(format!("{method} exceeded {deadline:?}"))
                } else {
                    LedgerError::Network(format!("HTTP request failed: {e}"))
                }
            })?;

        if !response.status().is_success() {
            return Err(LedgerError::Network(format!(
                "HTTP error: {}",
                response.status()
            )));
        }

        let rpc_response: GatewayRpcResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::Network(format!("failed to parse JSON: {e}")))?;

        if let Some(error) = rpc_response.error {
            return Err(classify_rpc_error(&error));
        }

        rpc_response
            .result
            .ok_or_else(|| LedgerError::Validation("RPC response missing result field".to_string()))
    }
}

/// Validation errors from the gateway are fatal, except the duplicate-batch
/// case, which the scheduler folds into a successful anchor.
fn classify_rpc_error(error: &GatewayRpcError) -> LedgerError {
    let message = error.message.to_lowercase();
    if message.contains("already exists") || message.contains("duplicate") {
        LedgerError::Duplicate(format!("RPC error {}: {}", error.code, error.message))
    } else {
        LedgerError::Validation(format!("RPC error {}: {}", error.code, error.message))
    }
}

#[async_trait]
impl LedgerClient for GatewayClient {
    async fn store_batch(&self, batch: &BatchAnchor) -> Result<String, LedgerError> {
        let params = json!({
            "channel": self.channel,
            "contract": self.contract,
            "batch": batch,
        });
        let result = self
            .rpc_call("StoreBatch", params, self.timeouts.invoke)
            .await?;
        let tx_id = result
            .get("tx_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| LedgerError::Validation("StoreBatch result missing tx_id".into()))?
            .to_string();
        tracing::info!(
            batch_id = %batch.batch_id,
            record_count = batch.record_count,
            tx_id = %tx_id,
            "batch anchored on ledger"
        );
        Ok(tx_id)
    }

    async fn query_batch(
        &self,
        batch_id: &str,
    ) -> Result<Option<LedgerBatchRecord>, LedgerError> {
        let params = json!({
            "channel": self.channel,
            "contract": self.contract,
            "batch_id": batch_id,
        });
        let result = self
            .rpc_call("GetBatch", params, self.timeouts.query)
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        let record: LedgerBatchRecord = serde_json::from_value(result)
            .map_err(|e| LedgerError::Validation(format!("failed to parse batch record: {e}")))?;
        Ok(Some(record))
    }

    async fn health_check(&self) -> Result<(), LedgerError> {
        self.rpc_call("Ping", json!({ "channel": self.channel }), self.timeouts.query)
            .await
            .map(|_| ())
    }
}

/// In-memory ledger for tests and ledger-less development. Duplicate batch
/// ids are rejected with `Duplicate`, mirroring the chaincode contract; a
/// failure switch makes every call return a retriable transport error.
#[derive(Default)]
pub struct StubLedger {
    batches: Mutex<HashMap<String, LedgerBatchRecord>>,
    failing: AtomicBool,
}

impl StubLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, every call fails with a retriable `Network` error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn anchored_count(&self) -> usize {
        self.batches.lock().await.len()
    }

    fn check_up(&self) -> Result<(), LedgerError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(LedgerError::Network("stub ledger unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerClient for StubLedger {
    async fn store_batch(&self, batch: &BatchAnchor) -> Result<String, LedgerError> {
        self.check_up()?;
        let mut batches = self.batches.lock().await;
        if batches.contains_key(&batch.batch_id) {
            return Err(LedgerError::Duplicate(batch.batch_id.clone()));
        }
        let tx_id = format!("stub-tx-{}", &batch.merkle_root[..batch.merkle_root.len().min(12)]);
        batches.insert(
            batch.batch_id.clone(),
            LedgerBatchRecord {
                batch_id: batch.batch_id.clone(),
                merkle_root: batch.merkle_root.clone(),
                timestamp: batch.timestamp,
                record_count: batch.record_count,
                record_ids: batch.record_ids.clone(),
            },
        );
        Ok(tx_id)
    }

    async fn query_batch(
        &self,
        batch_id: &str,
    ) -> Result<Option<LedgerBatchRecord>, LedgerError> {
        self.check_up()?;
        Ok(self.batches.lock().await.get(batch_id).cloned())
    }

    async fn health_check(&self) -> Result<(), LedgerError> {
        self.check_up()
    }
}
