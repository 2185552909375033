//! JSON-RPC chain client.

use std::time::Duration;

use alloy_core::primitives::{Address, Bytes, U64, U256};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use url::Url;

use super::{
    Account, ArtifactStore, ChainClient, ClientError, ConfirmationError, SignedTransaction,
    SubmissionError, TxId, deployment_transaction, sign_transaction,
};
use crate::config::NetworkConfig;

/// Errors from a single JSON-RPC call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// The request never got a usable answer (connection, timeout, bad body).
    #[error("{method} request failed: {message}")]
    Transport { method: String, message: String },

    /// The node answered with an error object.
    #[error("{method} returned error {code}: {message}")]
    Node {
        method: String,
        code: i64,
        message: String,
    },
}

/// Create an HTTP client configured for JSON-RPC requests.
fn create_client(timeout: Duration) -> Result<reqwest::Client, RpcError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| RpcError::Transport {
            method: "client".to_string(),
            message: e.to_string(),
        })
}

/// Make a JSON-RPC call and deserialize the result.
///
/// # Arguments
/// * `client` - The HTTP client to use
/// * `url` - The RPC endpoint URL
/// * `method` - The RPC method name
/// * `params` - The method parameters
///
/// # Returns
/// The deserialized result, or an error if the request failed or returned an error response.
async fn json_rpc_call<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &Url,
    method: &str,
    params: Vec<Value>,
) -> Result<T, RpcError> {
    let transport = |message: String| RpcError::Transport {
        method: method.to_string(),
        message,
    };

    let response = client
        .post(url.clone())
        .json(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        }))
        .send()
        .await
        .map_err(|e| transport(e.to_string()))?;

    let result: Value = response
        .json()
        .await
        .map_err(|e| transport(format!("failed to parse response: {e}")))?;

    if let Some(error) = result.get("error") {
        return Err(RpcError::Node {
            method: method.to_string(),
            code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
        });
    }

    let result_value = result
        .get("result")
        .cloned()
        .ok_or_else(|| transport("no result in response".to_string()))?;

    serde_json::from_value(result_value)
        .map_err(|e| transport(format!("failed to deserialize result: {e}")))
}

/// The receipt fields needed to confirm a deployment.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionReceipt {
    /// Absent on pre-Byzantium chains.
    #[serde(default)]
    status: Option<U64>,
    #[serde(default)]
    contract_address: Option<Address>,
}

impl From<RpcError> for SubmissionError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Node { message, .. } => Self::Rejected(message),
            transport => Self::Transport(transport.to_string()),
        }
    }
}

/// [`ChainClient`] talking to an Ethereum JSON-RPC endpoint.
///
/// Contract bytecode and constructor ABI come from an [`ArtifactStore`].
/// Transactions are signed locally for key-based accounts, or sent with
/// `eth_sendTransaction` for accounts unlocked on the node.
#[derive(Debug)]
pub struct RpcChainClient {
    http: reqwest::Client,
    url: Url,
    chain_id: u64,
    account: Account,
    artifacts: ArtifactStore,
    gas_limit: Option<u64>,
    poll_interval: Duration,
}

impl RpcChainClient {
    /// Resolve the configured account, connect to the network and check its chain id.
    pub async fn connect(
        network: &NetworkConfig,
        artifacts: ArtifactStore,
    ) -> Result<Self, ClientError> {
        let account = network.account.resolve()?;
        let http = create_client(network.request_timeout())?;

        let reported: U64 = json_rpc_call(&http, &network.url, "eth_chainId", vec![]).await?;
        let actual = reported.to::<u64>();
        if actual != network.chain_id {
            return Err(ClientError::ChainIdMismatch {
                expected: network.chain_id,
                actual,
            });
        }

        tracing::info!(
            url = %network.url,
            chain_id = actual,
            account = %account.address(),
            "Connected to network"
        );

        Ok(Self {
            http,
            url: network.url.clone(),
            chain_id: actual,
            account,
            artifacts,
            gas_limit: network.gas_limit,
            poll_interval: network.poll_interval(),
        })
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, RpcError> {
        json_rpc_call(&self.http, &self.url, method, params).await
    }

    /// Send a signed transaction.
    ///
    /// Only an error object from the node proves the transaction was
    /// refused. Any other failure leaves it possibly accepted, reported as
    /// [`SubmissionError::Unknown`] with the locally computed hash.
    async fn send_raw(&self, signed: &SignedTransaction) -> Result<TxId, SubmissionError> {
        match self
            .call::<TxId>("eth_sendRawTransaction", vec![json!(signed.raw)])
            .await
        {
            Ok(tx) => Ok(tx),
            Err(err @ RpcError::Node { .. }) => Err(err.into()),
            Err(err) => {
                tracing::warn!(tx = %signed.hash, error = %err, "Transaction sent without acknowledgement");
                Err(SubmissionError::Unknown {
                    tx: signed.hash,
                    message: err.to_string(),
                })
            }
        }
    }

    async fn estimate_gas(&self, from: Address, code: &Bytes) -> Result<u64, RpcError> {
        let gas: U64 = self
            .call("eth_estimateGas", vec![json!({ "from": from, "data": code })])
            .await?;
        Ok(gas.to::<u64>())
    }

    async fn gas_limit_for(&self, from: Address, code: &Bytes) -> Result<u64, RpcError> {
        match self.gas_limit {
            Some(limit) => Ok(limit),
            None => self.estimate_gas(from, code).await,
        }
    }
}

impl ChainClient for RpcChainClient {
    async fn deploy(&self, contract: &str, args: &[Value]) -> Result<TxId, SubmissionError> {
        let artifact = self.artifacts.find(contract)?;
        let code = artifact.deployment_code(args)?;

        let tx_id: TxId = match &self.account {
            Account::Unlocked(from) => {
                let mut tx = json!({ "from": from, "data": code });
                if let Some(limit) = self.gas_limit {
                    tx["gas"] = json!(format!("0x{limit:x}"));
                }
                self.call("eth_sendTransaction", vec![tx]).await?
            }
            Account::Local(local) => {
                let from = local.address();
                let nonce: U64 = self
                    .call(
                        "eth_getTransactionCount",
                        vec![json!(from), json!("pending")],
                    )
                    .await?;
                let gas_price: U256 = self.call("eth_gasPrice", vec![]).await?;
                let gas_price = u128::try_from(gas_price).map_err(|_| {
                    SubmissionError::Rejected(format!("gas price {gas_price} out of range"))
                })?;
                let gas_limit = self.gas_limit_for(from, &code).await?;

                let nonce = nonce.to::<u64>();
                let tx = deployment_transaction(self.chain_id, nonce, gas_price, gas_limit, code);
                let signed = sign_transaction(local, tx)?;

                tracing::debug!(
                    contract,
                    nonce,
                    gas_price,
                    gas_limit,
                    tx = %signed.hash,
                    "Sending signed deployment transaction"
                );

                self.send_raw(&signed).await?
            }
        };

        tracing::info!(contract, tx = %tx_id, "Deployment transaction submitted");
        Ok(tx_id)
    }

    async fn await_confirmation(
        &self,
        tx: TxId,
        timeout: Duration,
    ) -> Result<Address, ConfirmationError> {
        let poll = async {
            loop {
                match self
                    .call::<Option<TransactionReceipt>>("eth_getTransactionReceipt", vec![json!(tx)])
                    .await
                {
                    Ok(Some(receipt)) => {
                        if receipt.status == Some(U64::ZERO) {
                            return Err(ConfirmationError::Reverted { tx });
                        }
                        return receipt
                            .contract_address
                            .ok_or(ConfirmationError::MissingAddress { tx });
                    }
                    Ok(None) => {
                        tracing::trace!(tx = %tx, "Transaction not mined yet, polling...");
                    }
                    Err(err @ RpcError::Node { .. }) => {
                        return Err(ConfirmationError::Transport(err.to_string()));
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, tx = %tx, "Receipt lookup failed, retrying...");
                    }
                }

                tokio::time::sleep(self.poll_interval).await;
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| ConfirmationError::Timeout { tx, timeout })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::LocalAccount;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };

    /// First Hardhat/Anvil development account.
    const DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    /// Read one HTTP request, headers and body.
    async fn read_request(socket: &mut TcpStream) {
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let Ok(n) = socket.read(&mut buf).await else {
                return;
            };
            if n == 0 {
                return;
            }
            request.extend_from_slice(&buf[..n]);

            let text = String::from_utf8_lossy(&request);
            if let Some(end) = text.find("\r\n\r\n") {
                let content_length = text[..end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or_default();
                if request.len() >= end + 4 + content_length {
                    return;
                }
            }
        }
    }

    /// Serve a single JSON-RPC request. Answers with `body`, or keeps the
    /// connection open without answering when `body` is `None`.
    async fn serve_once(body: Option<&'static str>) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("http://{}", listener.local_addr().unwrap())).unwrap();

        tokio::spawn(async move {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            read_request(&mut socket).await;
            match body {
                Some(body) => {
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                }
                None => tokio::time::sleep(Duration::from_secs(5)).await,
            }
        });

        url
    }

    fn client(url: Url) -> RpcChainClient {
        RpcChainClient {
            http: create_client(Duration::from_millis(300)).unwrap(),
            url,
            chain_id: 31337,
            account: Account::Local(LocalAccount::from_hex(DEV_KEY).unwrap()),
            artifacts: ArtifactStore::new("artifacts"),
            gas_limit: Some(100_000),
            poll_interval: Duration::from_millis(10),
        }
    }

    fn signed_deployment() -> SignedTransaction {
        let account = LocalAccount::from_hex(DEV_KEY).unwrap();
        let tx = deployment_transaction(31337, 0, 1, 100_000, Bytes::from_static(&[0x60, 0x80]));
        sign_transaction(&account, tx).unwrap()
    }

    #[tokio::test]
    async fn test_unacknowledged_send_keeps_transaction_hash() {
        let client = client(serve_once(None).await);
        let signed = signed_deployment();

        let err = client.send_raw(&signed).await.unwrap_err();
        assert!(matches!(err, SubmissionError::Unknown { .. }));
        assert_eq!(err.in_flight_tx(), Some(signed.hash));
    }

    #[tokio::test]
    async fn test_node_error_is_a_rejection() {
        let url = serve_once(Some(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"insufficient funds"}}"#,
        ))
        .await;
        let client = client(url);

        let err = client.send_raw(&signed_deployment()).await.unwrap_err();
        assert_eq!(err, SubmissionError::Rejected("insufficient funds".into()));
        assert_eq!(err.in_flight_tx(), None);
    }

    #[tokio::test]
    async fn test_acknowledged_send_returns_node_hash() {
        let signed = signed_deployment();
        let body: &'static str = Box::leak(
            json!({ "jsonrpc": "2.0", "id": 1, "result": signed.hash })
                .to_string()
                .into_boxed_str(),
        );
        let client = client(serve_once(Some(body)).await);

        assert_eq!(client.send_raw(&signed).await.unwrap(), signed.hash);
    }
}
