// Copyright (C) 2025, 2026 Poolpay Developers (see AUTHORS)
//
// This file is part of Poolpay
//
// Poolpay is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Poolpay is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// Poolpay. If not, see <https://www.gnu.org/licenses/>.

//! JSON-RPC client for the chain node the pool pays out through.
//!
//! The [`ChainRpc`] trait is the seam the payout logic depends on; tests
//! substitute a hand-rolled mock.

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;

/// JSON-RPC 1.0 request structure
#[derive(Serialize)]
struct JsonRpcRequest {
    method: String,
    params: Vec<serde_json::Value>,
    id: u64,
}

/// JSON-RPC 1.0 response structure. Both result and error are always
/// present; one is the value, the other null.
#[derive(Deserialize, Debug)]
struct JsonRpcResponse<T> {
    result: T,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize, Debug)]
struct JsonRpcError {
    code: i32,
    message: String,
}

/// Error type for the chain RPC client
#[derive(Debug)]
pub enum ChainRpcError {
    HttpError { status_code: u16, message: String },
    ParseError { message: String },
    RpcError { code: i32, message: String },
    Other(String),
}

impl Error for ChainRpcError {}

impl fmt::Display for ChainRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainRpcError::HttpError {
                status_code,
                message,
            } => {
                write!(f, "HTTP error {status_code}: {message}")
            }
            ChainRpcError::ParseError { message } => {
                write!(f, "Parse error: {message}")
            }
            ChainRpcError::RpcError { code, message } => {
                write!(f, "RPC error {code}: {message}")
            }
            ChainRpcError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

/// Confirmed spendable balance of the pool account
#[derive(Debug, Clone, PartialEq)]
pub struct AccountBalance {
    pub confirmed: BigUint,
}

/// One recipient of a payout transaction
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TransactionOutput {
    pub public_address: String,
    /// Amount in the chain's smallest unit, as a decimal string
    pub amount: String,
    pub memo: String,
    /// None pays in the chain's native asset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockStatus {
    pub main: bool,
    pub confirmed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransactionStatus {
    pub confirmed: bool,
    pub expired: bool,
}

/// Chain node operations the payout logic needs
pub trait ChainRpc: Send + Sync {
    fn get_account_balance(
        &self,
        account: &str,
    ) -> impl std::future::Future<Output = Result<AccountBalance, ChainRpcError>> + Send;

    /// Submit a payout transaction. Returns the transaction hash.
    fn send_transaction(
        &self,
        from_account: &str,
        outputs: &[TransactionOutput],
        fee: u64,
    ) -> impl std::future::Future<Output = Result<String, ChainRpcError>> + Send;

    fn get_block_status(
        &self,
        hash: &str,
        sequence: u64,
    ) -> impl std::future::Future<Output = Result<BlockStatus, ChainRpcError>> + Send;

    fn get_transaction_status(
        &self,
        hash: &str,
    ) -> impl std::future::Future<Output = Result<TransactionStatus, ChainRpcError>> + Send;
}

#[derive(Debug, Clone)]
pub struct HttpChainRpc {
    client: reqwest::Client,
    url: String,
    request_id: Arc<AtomicU64>,
}

#[derive(Deserialize)]
struct BalanceResult {
    confirmed: String,
}

#[derive(Deserialize)]
struct SendTransactionResult {
    hash: String,
}

#[derive(Deserialize)]
struct BlockStatusResult {
    main: bool,
    confirmed: bool,
}

#[derive(Deserialize)]
struct TransactionStatusResult {
    confirmed: bool,
    expired: bool,
}

impl HttpChainRpc {
    pub fn new(url: &str) -> Result<Self, ChainRpcError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ChainRpcError::Other(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: url.to_string(),
            request_id: Arc::new(AtomicU64::new(0)),
        })
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<T, ChainRpcError> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);

        let request = JsonRpcRequest {
            method: method.to_string(),
            params,
            id,
        };

        let response = match self.client.post(&self.url).json(&request).send().await {
            Ok(resp) => resp,
            Err(e) => {
                error!("HTTP request to chain node failed: {}", e);
                return Err(ChainRpcError::Other(format!("HTTP request failed: {e}")));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            error!(
                "Error reaching chain node with status={:?}. Message={:?}",
                status_code, error_body
            );
            return Err(ChainRpcError::HttpError {
                status_code,
                message: error_body,
            });
        }

        // Deserialize the envelope untyped first: an error response carries
        // result = null, which would not decode as T
        let rpc_response: JsonRpcResponse<serde_json::Value> =
            response.json().await.map_err(|e| ChainRpcError::ParseError {
                message: format!("Failed to parse response: {e}"),
            })?;

        if let Some(error) = rpc_response.error {
            return Err(ChainRpcError::RpcError {
                code: error.code,
                message: error.message,
            });
        }

        serde_json::from_value(rpc_response.result).map_err(|e| ChainRpcError::ParseError {
            message: format!("Failed to parse result: {e}"),
        })
    }
}

impl ChainRpc for HttpChainRpc {
    async fn get_account_balance(&self, account: &str) -> Result<AccountBalance, ChainRpcError> {
        let params = vec![serde_json::json!({ "account": account })];
        let result: BalanceResult = self.request("getaccountbalance", params).await?;
        let confirmed =
            BigUint::from_str(&result.confirmed).map_err(|e| ChainRpcError::ParseError {
                message: format!("bad balance '{}': {e}", result.confirmed),
            })?;
        Ok(AccountBalance { confirmed })
    }

    async fn send_transaction(
        &self,
        from_account: &str,
        outputs: &[TransactionOutput],
        fee: u64,
    ) -> Result<String, ChainRpcError> {
        let params = vec![serde_json::json!({
            "account": from_account,
            "outputs": outputs,
            "fee": fee.to_string(),
        })];
        let result: SendTransactionResult = self.request("sendtransaction", params).await?;
        Ok(result.hash)
    }

    async fn get_block_status(
        &self,
        hash: &str,
        sequence: u64,
    ) -> Result<BlockStatus, ChainRpcError> {
        let params = vec![serde_json::json!({
            "hash": hash,
            "sequence": sequence,
        })];
        let result: BlockStatusResult = self.request("getblockstatus", params).await?;
        Ok(BlockStatus {
            main: result.main,
            confirmed: result.confirmed,
        })
    }

    async fn get_transaction_status(
        &self,
        hash: &str,
    ) -> Result<TransactionStatus, ChainRpcError> {
        let params = vec![serde_json::json!({ "hash": hash })];
        let result: TransactionStatusResult = self.request("gettransactionstatus", params).await?;
        Ok(TransactionStatus {
            confirmed: result.confirmed,
            expired: result.expired,
        })
    }
}
