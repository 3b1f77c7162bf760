use crate::backoff::{send_with_backoff, RetryPolicy};
use crate::metrics;
use crate::types::{
    hex_u64, u256_to_wei, ExecutionBlock, Log, LogFilter, Transaction, TransactionReceipt, Wei,
};
use crate::{ExecutionClient, Error, SensitiveUrl};
use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

pub const JSONRPC_VERSION: &str = "2.0";
pub const STATIC_ID: u32 = 1;

pub const ETH_BLOCK_NUMBER: &str = "eth_blockNumber";
pub const ETH_BLOCK_NUMBER_TIMEOUT: Duration = Duration::from_secs(1);

pub const ETH_GET_BALANCE: &str = "eth_getBalance";
pub const ETH_GET_BALANCE_TIMEOUT: Duration = Duration::from_secs(6);

pub const ETH_GET_BLOCK_BY_NUMBER: &str = "eth_getBlockByNumber";
pub const ETH_GET_BLOCK_BY_NUMBER_TIMEOUT: Duration = Duration::from_secs(6);

pub const ETH_GET_BLOCK_TX_COUNT: &str = "eth_getBlockTransactionCountByNumber";
pub const ETH_GET_BLOCK_TX_COUNT_TIMEOUT: Duration = Duration::from_secs(6);

pub const ETH_GET_TX_BY_BLOCK_NUMBER_AND_INDEX: &str = "eth_getTransactionByBlockNumberAndIndex";
pub const ETH_GET_TX_BY_BLOCK_NUMBER_AND_INDEX_TIMEOUT: Duration = Duration::from_secs(6);

pub const ETH_GET_TX_RECEIPT: &str = "eth_getTransactionReceipt";
pub const ETH_GET_TX_RECEIPTS_TIMEOUT: Duration = Duration::from_secs(30);

pub const ETH_GET_LOGS: &str = "eth_getLogs";
/// Log queries can span the whole chain (e.g. when discovering contract events).
pub const ETH_GET_LOGS_TIMEOUT: Duration = Duration::from_secs(120);

pub const ETH_CALL: &str = "eth_call";
pub const ETH_CALL_TIMEOUT: Duration = Duration::from_secs(6);

#[derive(Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonRequestBody<'a> {
    pub jsonrpc: &'a str,
    pub method: &'a str,
    pub params: serde_json::Value,
    pub id: serde_json::Value,
}

#[derive(Debug, PartialEq, Deserialize)]
pub struct JsonError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, PartialEq, Deserialize)]
pub struct JsonResponseBody {
    #[serde(default)]
    pub error: Option<JsonError>,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default)]
    pub id: serde_json::Value,
}

fn quantity(value: u64) -> String {
    format!("{:#x}", value)
}

fn block_tag(block_number: Option<u64>) -> String {
    block_number.map_or_else(|| "latest".to_string(), quantity)
}

/// Decodes a JSON-RPC response body, turning an error object into `Error::ServerMessage` and a
/// `null` result into `Error::NotFound`.
fn decode_result<T: DeserializeOwned>(body: JsonResponseBody, context: &str) -> Result<T, Error> {
    match (body.result, body.error) {
        (_, Some(error)) => Err(Error::ServerMessage {
            code: error.code,
            message: error.message,
        }),
        (serde_json::Value::Null, None) => Err(Error::NotFound(context.to_string())),
        (result, None) => serde_json::from_value(result).map_err(Into::into),
    }
}

/// A JSON-RPC client for an archive execution node.
pub struct ExecutionHttpClient {
    client: reqwest::Client,
    url: SensitiveUrl,
    retry_policy: RetryPolicy,
}

impl ExecutionHttpClient {
    pub fn new(url: SensitiveUrl) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            retry_policy: RetryPolicy::post(),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        body: &B,
        timeout: Duration,
    ) -> Result<T, Error> {
        let request = self
            .client
            .post(self.url.full.clone())
            .timeout(timeout)
            .header(CONTENT_TYPE, "application/json")
            .json(body);
        let response = send_with_backoff(request, &self.retry_policy, metrics::EXECUTION).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound(self.url.to_string()));
        }
        Ok(response.json().await?)
    }

    pub async fn rpc_request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<T, Error> {
        metrics::inc_counter_vec(&metrics::CHAIN_CLIENT_REQUESTS, &[metrics::EXECUTION, method]);
        let body = JsonRequestBody {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
            id: json!(STATIC_ID),
        };
        let response: JsonResponseBody = self.post(&body, timeout).await?;
        decode_result(response, method)
    }

    /// Sends one request per entry of `params` in a single JSON-RPC batch. Results are returned
    /// in the order of `params`.
    pub async fn rpc_batch_request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
        timeout: Duration,
    ) -> Result<Vec<T>, Error> {
        if params.is_empty() {
            return Ok(vec![]);
        }
        metrics::inc_counter_vec(&metrics::CHAIN_CLIENT_REQUESTS, &[metrics::EXECUTION, method]);

        let bodies = params
            .into_iter()
            .enumerate()
            .map(|(i, params)| JsonRequestBody {
                jsonrpc: JSONRPC_VERSION,
                method,
                params,
                id: json!(i),
            })
            .collect::<Vec<_>>();
        let expected = bodies.len();

        let mut responses: Vec<JsonResponseBody> = self.post(&bodies, timeout).await?;
        if responses.len() != expected {
            return Err(Error::InvalidResponse(format!(
                "{} batch returned {} results for {} requests",
                method,
                responses.len(),
                expected
            )));
        }
        // Servers may answer batch entries in any order.
        responses.sort_by_key(|r| r.id.as_u64().unwrap_or(u64::MAX));

        responses
            .into_iter()
            .map(|response| decode_result(response, method))
            .collect()
    }
}

#[async_trait]
impl ExecutionClient for ExecutionHttpClient {
    async fn block_number(&self) -> Result<u64, Error> {
        #[derive(Deserialize)]
        struct Quantity(#[serde(with = "hex_u64")] u64);

        let number: Quantity = self
            .rpc_request(ETH_BLOCK_NUMBER, json!([]), ETH_BLOCK_NUMBER_TIMEOUT)
            .await?;
        Ok(number.0)
    }

    async fn get_balance(&self, address: Address, block_number: u64) -> Result<Wei, Error> {
        let balance: U256 = self
            .rpc_request(
                ETH_GET_BALANCE,
                json!([address, quantity(block_number)]),
                ETH_GET_BALANCE_TIMEOUT,
            )
            .await?;
        u256_to_wei(balance)
    }

    async fn get_block(&self, block_number: u64, verbose: bool) -> Result<ExecutionBlock, Error> {
        self.rpc_request(
            ETH_GET_BLOCK_BY_NUMBER,
            json!([quantity(block_number), verbose]),
            ETH_GET_BLOCK_BY_NUMBER_TIMEOUT,
        )
        .await
    }

    async fn get_block_tx_count(&self, block_number: u64) -> Result<u64, Error> {
        #[derive(Deserialize)]
        struct Quantity(#[serde(with = "hex_u64")] u64);

        let count: Quantity = self
            .rpc_request(
                ETH_GET_BLOCK_TX_COUNT,
                json!([quantity(block_number)]),
                ETH_GET_BLOCK_TX_COUNT_TIMEOUT,
            )
            .await?;
        Ok(count.0)
    }

    async fn get_tx_data(&self, block_number: u64, tx_index: u64) -> Result<Transaction, Error> {
        self.rpc_request(
            ETH_GET_TX_BY_BLOCK_NUMBER_AND_INDEX,
            json!([quantity(block_number), quantity(tx_index)]),
            ETH_GET_TX_BY_BLOCK_NUMBER_AND_INDEX_TIMEOUT,
        )
        .await
    }

    async fn get_tx_receipts(
        &self,
        tx_hashes: &[B256],
    ) -> Result<Vec<TransactionReceipt>, Error> {
        let params = tx_hashes.iter().map(|hash| json!([hash])).collect();
        self.rpc_batch_request(ETH_GET_TX_RECEIPT, params, ETH_GET_TX_RECEIPTS_TIMEOUT)
            .await
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Log>, Error> {
        let mut params = json!({
            "fromBlock": quantity(filter.from_block),
            "toBlock": quantity(filter.to_block),
            "topics": filter.topics,
        });
        if let Some(address) = filter.address {
            params["address"] = json!(address);
        }
        self.rpc_request(ETH_GET_LOGS, json!([params]), ETH_GET_LOGS_TIMEOUT)
            .await
    }

    async fn eth_call(
        &self,
        to: Address,
        data: Bytes,
        block_number: Option<u64>,
    ) -> Result<Bytes, Error> {
        self.rpc_request(
            ETH_CALL,
            json!([
                {
                    "from": Address::ZERO,
                    "to": to,
                    "data": data,
                },
                block_tag(block_number),
            ]),
            ETH_CALL_TIMEOUT,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_objects_and_null_results() {
        let body: JsonResponseBody = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": -32000, "message": "execution reverted" }
        }))
        .unwrap();
        match decode_result::<Bytes>(body, ETH_CALL) {
            Err(Error::ServerMessage { code, .. }) => assert_eq!(code, -32000),
            other => panic!("unexpected {:?}", other),
        }

        let body: JsonResponseBody =
            serde_json::from_value(json!({ "jsonrpc": "2.0", "id": 1, "result": null })).unwrap();
        assert!(decode_result::<ExecutionBlock>(body, ETH_GET_BLOCK_BY_NUMBER)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn block_tags() {
        assert_eq!(block_tag(None), "latest");
        assert_eq!(block_tag(Some(15_835_292)), "0xf1a09c");
    }
}
