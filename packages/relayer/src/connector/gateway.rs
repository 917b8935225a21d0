//! JSON-RPC connector for a per-chain relay gateway
//!
//! The gateway mirrors [`ChainConnector`] one method at a time and owns the
//! chain client and signing keys. Byte strings travel as 0x-prefixed hex.
//!
//! | method                       | params                  | result            |
//! |------------------------------|-------------------------|-------------------|
//! | `relay_getLatestHeader`      | `[]`                    | header object     |
//! | `relay_getEvents`            | `[from, to]`            | array of events   |
//! | `relay_submitTransaction`    | `[tx object]`           | tx handle string  |
//! | `relay_getTransactionStatus` | `[handle]`              | status string     |
//! | `relay_queryState`           | `[contract, key]`       | hex string        |
//!
//! Errors carry a message classified like a node error. A gateway that saw
//! a requested block replaced adds `{"data": {"reorgHeight": n}}`.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{BlockStream, ChainConnector};
use crate::error::{ConnectorError, RejectionReason};
use crate::types::{
    BlockHeader, ChainId, Hash32, RawEvent, TransactionRequest, TxHandle, TxStatus,
};
use crate::writers::retry::{classify_error, ErrorClass};

/// JSON-RPC response wrapper
#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

/// JSON-RPC error
#[derive(Debug, Deserialize)]
struct RpcError {
    code: i32,
    message: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

impl RpcError {
    fn reorg_height(&self) -> Option<u64> {
        self.data.as_ref()?.get("reorgHeight")?.as_u64()
    }

    fn into_connector_error(self) -> ConnectorError {
        match self.reorg_height() {
            Some(height) => ConnectorError::Reorg { height },
            None => map_rpc_error(&self.message),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeaderResponse {
    height: u64,
    hash: String,
    parent_hash: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventResponse {
    block_height: u64,
    block_hash: String,
    event_index: u32,
    tx_ref: String,
    kind: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct KeyParam {
    source_chain_id: u64,
    destination_chain_id: u64,
    deposit_nonce: u64,
    resource_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TxParam {
    kind: &'static str,
    sender: String,
    contract: String,
    key: KeyParam,
    payload: String,
    payload_hash: String,
}

fn hex0x(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

fn malformed(what: &str, detail: impl std::fmt::Display) -> ConnectorError {
    ConnectorError::Transient(format!("malformed gateway {}: {}", what, detail))
}

fn parse_bytes(what: &str, value: &str) -> Result<Vec<u8>, ConnectorError> {
    hex::decode(value.strip_prefix("0x").unwrap_or(value)).map_err(|e| malformed(what, e))
}

fn parse_hash(what: &str, value: &str) -> Result<Hash32, ConnectorError> {
    let bytes = parse_bytes(what, value)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| malformed(what, format!("expected 32 bytes, got {}", bytes.len())))
}

/// Map a gateway error message onto the connector error taxonomy
pub fn map_rpc_error(message: &str) -> ConnectorError {
    match classify_error(message) {
        ErrorClass::Transient | ErrorClass::Unknown => {
            ConnectorError::Transient(message.to_string())
        }
        ErrorClass::AlreadyProcessed | ErrorClass::Permanent => {
            ConnectorError::Rejected(RejectionReason::from_message(message))
        }
    }
}

/// Connector talking to a relay gateway over HTTP JSON-RPC
#[derive(Debug, Clone)]
pub struct GatewayConnector {
    chain_id: ChainId,
    url: String,
    client: Client,
    poll_interval: Duration,
}

impl GatewayConnector {
    pub fn new(
        chain_id: ChainId,
        url: impl Into<String>,
        poll_interval: Duration,
    ) -> eyre::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            chain_id,
            url: url.into(),
            client,
            poll_interval,
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>, ConnectorError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        trace!(chain_id = %self.chain_id, method, "Gateway request");

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ConnectorError::Transient(format!("{}: {}", method, e)))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(ConnectorError::Transient(format!(
                "{}: HTTP {}",
                method, status
            )));
        }

        let response = response
            .json::<RpcResponse<T>>()
            .await
            .map_err(|e| malformed(method, e))?;

        if let Some(error) = response.error {
            debug!(
                chain_id = %self.chain_id,
                method,
                code = error.code,
                message = %error.message,
                "Gateway returned error"
            );
            return Err(error.into_connector_error());
        }

        Ok(response.result)
    }

    async fn latest_header(&self) -> Result<BlockHeader, ConnectorError> {
        let header: HeaderResponse = self
            .call("relay_getLatestHeader", serde_json::json!([]))
            .await?
            .ok_or_else(|| malformed("header", "empty result"))?;

        Ok(BlockHeader {
            height: header.height,
            hash: parse_hash("block hash", &header.hash)?,
            parent_hash: parse_hash("parent hash", &header.parent_hash)?,
        })
    }
}

#[async_trait]
impl ChainConnector for GatewayConnector {
    async fn subscribe_blocks(&self) -> Result<BlockStream, ConnectorError> {
        // Fail fast if the gateway is unreachable
        let first = self.latest_header().await?;
        let connector = self.clone();

        let updates = stream::unfold(first.height, move |last| {
            let connector = connector.clone();
            async move {
                loop {
                    tokio::time::sleep(connector.poll_interval).await;
                    match connector.latest_header().await {
                        Ok(header) if header.height > last => {
                            return Some((Ok(header), header.height));
                        }
                        Ok(_) => continue,
                        Err(e) => return Some((Err(e), last)),
                    }
                }
            }
        });

        Ok(stream::once(async move { Ok(first) }).chain(updates).boxed())
    }

    async fn get_events(&self, from: u64, to: u64) -> Result<Vec<RawEvent>, ConnectorError> {
        let events: Vec<EventResponse> = self
            .call("relay_getEvents", serde_json::json!([from, to]))
            .await?
            .unwrap_or_default();

        events
            .into_iter()
            .map(|e| {
                Ok(RawEvent {
                    block_height: e.block_height,
                    block_hash: parse_hash("event block hash", &e.block_hash)?,
                    event_index: e.event_index,
                    tx_ref: e.tx_ref,
                    kind: e.kind,
                    data: parse_bytes("event data", &e.data)?,
                })
            })
            .collect()
    }

    async fn submit_transaction(
        &self,
        request: TransactionRequest,
    ) -> Result<TxHandle, ConnectorError> {
        let param = TxParam {
            kind: request.kind.as_str(),
            sender: request.sender.to_hex(),
            contract: hex0x(&request.contract),
            key: KeyParam {
                source_chain_id: request.key.source_chain_id.0,
                destination_chain_id: request.key.destination_chain_id.0,
                deposit_nonce: request.key.deposit_nonce,
                resource_id: request.key.resource_id.to_hex(),
            },
            payload: hex0x(&request.payload),
            payload_hash: hex0x(&request.payload_hash),
        };

        let handle: String = self
            .call("relay_submitTransaction", serde_json::json!([param]))
            .await?
            .ok_or_else(|| malformed("tx handle", "empty result"))?;

        Ok(TxHandle(handle))
    }

    async fn get_transaction_status(&self, handle: &TxHandle) -> Result<TxStatus, ConnectorError> {
        let status: Option<TxStatus> = self
            .call("relay_getTransactionStatus", serde_json::json!([handle.0]))
            .await?;

        // Unknown to the gateway yet
        Ok(status.unwrap_or(TxStatus::Pending))
    }

    async fn query_state(
        &self,
        contract: &[u8],
        key: &[u8; 32],
    ) -> Result<Vec<u8>, ConnectorError> {
        let value: Option<String> = self
            .call(
                "relay_queryState",
                serde_json::json!([hex0x(contract), hex0x(key)]),
            )
            .await?;

        match value {
            Some(v) => parse_bytes("state", &v),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rpc_error() {
        assert!(map_rpc_error("connection reset by peer").is_transient());
        assert!(map_rpc_error("weird failure").is_transient());
        assert_eq!(
            map_rpc_error("execution reverted: relayer already voted"),
            ConnectorError::Rejected(RejectionReason::AlreadyVoted)
        );
        assert_eq!(
            map_rpc_error("proposal already executed"),
            ConnectorError::Rejected(RejectionReason::AlreadyExecuted)
        );
        assert_eq!(
            map_rpc_error("data hash mismatch"),
            ConnectorError::Rejected(RejectionReason::PayloadMismatch)
        );
    }

    #[test]
    fn test_reorg_error_data() {
        let error: RpcError = serde_json::from_str(
            r#"{"code": -32000, "message": "block replaced", "data": {"reorgHeight": 17}}"#,
        )
        .unwrap();
        assert_eq!(error.into_connector_error(), ConnectorError::Reorg { height: 17 });

        let error: RpcError =
            serde_json::from_str(r#"{"code": -32000, "message": "request timed out"}"#).unwrap();
        assert!(error.into_connector_error().is_transient());
    }

    #[test]
    fn test_parse_hash() {
        let hash = parse_hash("h", &format!("0x{}", "11".repeat(32))).unwrap();
        assert_eq!(hash, [0x11; 32]);
        assert!(parse_hash("h", "0x1234").is_err());
        assert!(parse_hash("h", "0xnothex").is_err());
    }

    #[test]
    fn test_new_connector() {
        let connector =
            GatewayConnector::new(ChainId(1), "http://localhost:9100", Duration::from_secs(1))
                .unwrap();
        assert_eq!(connector.chain_id, ChainId(1));
    }

    #[tokio::test]
    async fn test_unreachable_gateway_is_transient() {
        let connector =
            GatewayConnector::new(ChainId(1), "http://127.0.0.1:1", Duration::from_millis(10))
                .unwrap();
        let err = connector.get_events(0, 10).await.unwrap_err();
        assert!(err.is_transient());
    }
}
