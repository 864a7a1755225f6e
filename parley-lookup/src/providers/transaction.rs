//! Transaction status over JSON-RPC (`eth_getTransactionReceipt`).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parley_core::{
    Address, ChainId, EndpointConfig, LookupError, LookupStatus, ParleyError, ParleyResult,
    Timestamp, TxHash,
};
use serde::{Deserialize, Serialize};

use super::http_client;
use super::rpc::{RpcRequest, RpcResponse};
use crate::backend::{LookupBackend, Resolvable};

const BACKEND: &str = "json-rpc";

/// A transaction referenced from a chat message, with what the sender
/// attached locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub tx_hash: TxHash,
    pub chain_id: ChainId,
    /// When the referencing message was sent.
    pub sent_at: Option<Timestamp>,
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub amount: Option<String>,
    pub currency: Option<String>,
}

impl TransactionRequest {
    pub fn new(tx_hash: TxHash, chain_id: ChainId) -> Self {
        Self {
            tx_hash,
            chain_id,
            sent_at: None,
            from: None,
            to: None,
            amount: None,
            currency: None,
        }
    }

    pub fn sent_at(mut self, sent_at: Timestamp) -> Self {
        self.sent_at = Some(sent_at);
        self
    }
}

/// The parts of a receipt the client cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionReceipt {
    pub status: LookupStatus,
    pub block_number: Option<u64>,
    pub from: Option<Address>,
    pub to: Option<Address>,
}

/// Transaction as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionStatus {
    pub tx_hash: TxHash,
    pub chain_id: ChainId,
    pub status: LookupStatus,
    pub block_number: Option<u64>,
    pub sent_at: Option<Timestamp>,
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub amount: Option<String>,
    pub currency: Option<String>,
}

impl Resolvable for TransactionStatus {
    fn status(&self) -> LookupStatus {
        self.status
    }
}

/// Receipt fields as returned by the node, all hex strings.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    status: Option<String>,
    block_number: Option<String>,
    from: Option<String>,
    to: Option<String>,
}

fn invalid(reason: impl Into<String>) -> ParleyError {
    LookupError::InvalidResponse {
        backend: BACKEND.to_string(),
        reason: reason.into(),
    }
    .into()
}

fn parse_quantity(field: &str, raw: &str) -> ParleyResult<u64> {
    let digits = raw
        .strip_prefix("0x")
        .ok_or_else(|| invalid(format!("{} is not 0x-prefixed: {}", field, raw)))?;
    u64::from_str_radix(digits, 16).map_err(|e| invalid(format!("{}: {}", field, e)))
}

fn parse_address(field: &str, raw: Option<String>) -> ParleyResult<Option<Address>> {
    raw.map(|s| Address::parse(&s).map_err(|e| invalid(format!("{}: {}", field, e))))
        .transpose()
}

/// Interpret an `eth_getTransactionReceipt` result. No receipt means the
/// transaction is not mined yet. Receipts without a `status` field predate
/// status codes and count as confirmed.
fn parse_receipt(raw: Option<RawReceipt>) -> ParleyResult<TransactionReceipt> {
    let Some(raw) = raw else {
        return Ok(TransactionReceipt {
            status: LookupStatus::Pending,
            block_number: None,
            from: None,
            to: None,
        });
    };

    let status = match raw.status.as_deref() {
        None => LookupStatus::Confirmed,
        Some(code) => match parse_quantity("status", code)? {
            1 => LookupStatus::Confirmed,
            0 => LookupStatus::Failed,
            other => return Err(invalid(format!("unknown receipt status {}", other))),
        },
    };

    Ok(TransactionReceipt {
        status,
        block_number: raw
            .block_number
            .as_deref()
            .map(|b| parse_quantity("blockNumber", b))
            .transpose()?,
        from: parse_address("from", raw.from)?,
        to: parse_address("to", raw.to)?,
    })
}

/// Looks up transaction receipts through per-chain JSON-RPC endpoints.
pub struct TransactionStatusLookup {
    client: reqwest::Client,
    endpoints: HashMap<ChainId, String>,
}

impl TransactionStatusLookup {
    pub fn new(endpoints: HashMap<ChainId, String>, timeout: Duration) -> ParleyResult<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            endpoints,
        })
    }

    pub fn from_config(config: &EndpointConfig) -> ParleyResult<Self> {
        Self::new(config.rpc_endpoints()?, config.request_timeout())
    }

    pub fn supports(&self, chain_id: ChainId) -> bool {
        self.endpoints.contains_key(&chain_id)
    }
}

impl std::fmt::Debug for TransactionStatusLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionStatusLookup")
            .field("chains", &self.endpoints.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl LookupBackend for TransactionStatusLookup {
    type Request = TransactionRequest;
    type Key = (TxHash, ChainId);
    type Fetched = TransactionReceipt;
    type Output = TransactionStatus;

    fn name(&self) -> &'static str {
        BACKEND
    }

    fn key(&self, request: &TransactionRequest) -> Self::Key {
        (request.tx_hash.clone(), request.chain_id)
    }

    fn created_at(&self, request: &TransactionRequest) -> Option<Timestamp> {
        request.sent_at
    }

    async fn lookup(&self, request: &TransactionRequest) -> ParleyResult<TransactionReceipt> {
        let url = self.endpoints.get(&request.chain_id).ok_or_else(|| {
            ParleyError::from(LookupError::Unsupported {
                backend: BACKEND.to_string(),
                reason: format!("no RPC endpoint for chain {}", request.chain_id),
            })
        })?;

        let body = RpcRequest::new("eth_getTransactionReceipt", [request.tx_hash.as_str()]);
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LookupError::RequestFailed {
                backend: BACKEND.to_string(),
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: format!("HTTP request failed: {}", e),
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(LookupError::RequestFailed {
                backend: BACKEND.to_string(),
                status: status.as_u16(),
                message: text,
            }
            .into());
        }

        let envelope: RpcResponse<RawReceipt> = response
            .json()
            .await
            .map_err(|e| invalid(format!("Failed to parse response: {}", e)))?;
        if let Some(error) = envelope.error {
            return Err(LookupError::RequestFailed {
                backend: BACKEND.to_string(),
                status: status.as_u16(),
                message: format!("RPC error {}: {}", error.code, error.message),
            }
            .into());
        }
        parse_receipt(envelope.result)
    }

    fn merge(&self, request: &TransactionRequest, fetched: TransactionReceipt) -> TransactionStatus {
        TransactionStatus {
            tx_hash: request.tx_hash.clone(),
            chain_id: request.chain_id,
            status: fetched.status,
            block_number: fetched.block_number,
            sent_at: request.sent_at,
            from: request.from.clone().or(fetched.from),
            to: request.to.clone().or(fetched.to),
            amount: request.amount.clone(),
            currency: request.currency.clone(),
        }
    }

    fn synthesize(&self, request: &TransactionRequest, status: LookupStatus) -> TransactionStatus {
        TransactionStatus {
            tx_hash: request.tx_hash.clone(),
            chain_id: request.chain_id,
            status,
            block_number: None,
            sent_at: request.sent_at,
            from: request.from.clone(),
            to: request.to.clone(),
            amount: request.amount.clone(),
            currency: request.currency.clone(),
        }
    }
}
