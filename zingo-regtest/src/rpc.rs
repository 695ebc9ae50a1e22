//! JSON-RPC client for a single node.
//!
//! Requests are JSON-RPC 1.0 over HTTP POST with basic auth, the dialect
//! zcashd speaks. One request is in flight per client at a time, and each
//! carries an id from the client's own counter; a reply for any other id is
//! rejected.
use std::{
    fmt,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use log::debug;
use regtestconfig::{NodeConfig, RpcCredentials};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{sync::Mutex, time::sleep};

/// Returned by a node that is still loading its block index or wallet.
pub const RPC_IN_WARMUP: i64 = -28;
pub const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;
/// The wallet refused, e.g. an export of an address it does not hold.
pub const RPC_WALLET_ERROR: i64 = -4;

const CONNECT_RETRIES: u32 = 3;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// Methods whose parameters or results carry key material.
const SENSITIVE_METHODS: [&str; 4] = ["z_exportkey", "z_importkey", "dumpprivkey", "importprivkey"];

fn is_sensitive(method: &str) -> bool {
    SENSITIVE_METHODS.contains(&method)
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Nothing answered, the node is not up yet, has crashed, or was stopped.
    #[error("node {node} is unreachable: {reason}")]
    Connection { node: usize, reason: String },
    /// Something answered, but not with a reply we can read.
    #[error("malformed reply from node {node}: {reason}")]
    Protocol { node: usize, reason: String },
    /// The node understood the request and refused it.
    #[error("node reported error {code}: {message}")]
    Application { code: i64, message: String },
    #[error("node {node} did not answer {method} within {timeout:?}")]
    Timeout {
        node: usize,
        method: String,
        timeout: Duration,
    },
}

impl RpcError {
    pub fn code(&self) -> Option<i64> {
        match self {
            RpcError::Application { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_warmup(&self) -> bool {
        self.code() == Some(RPC_IN_WARMUP)
    }
}

/// The shielded pools `z_getnewaddress` can draw from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShieldedPool {
    Sapling,
    Sprout,
}

impl ShieldedPool {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShieldedPool::Sapling => "sapling",
            ShieldedPool::Sprout => "sprout",
        }
    }
}

/// When `z_importkey` should rescan the chain for the key's notes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Rescan {
    Yes,
    No,
    #[default]
    WhenKeyIsNew,
}

impl Rescan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rescan::Yes => "yes",
            Rescan::No => "no",
            Rescan::WhenKeyIsNew => "whenkeyisnew",
        }
    }
}

/// What newer nodes report back from `z_importkey`. Older nodes return null.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ImportedKey {
    #[serde(rename = "type")]
    pub key_type: String,
    pub address: String,
}

#[derive(Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a [Value],
}

#[derive(Deserialize)]
struct ErrorObject {
    code: i64,
    message: String,
}

/// Decode one reply body into the value of its `result`, or the node's error.
pub(crate) fn decode_reply(node: usize, body: &[u8], expected_id: u64) -> Result<Value, RpcError> {
    let protocol = |reason: String| RpcError::Protocol { node, reason };
    let reply: Value =
        serde_json::from_slice(body).map_err(|e| protocol(format!("reply is not json: {e}")))?;
    let Value::Object(mut reply) = reply else {
        return Err(protocol("reply is not an object".to_string()));
    };
    match reply.remove("id") {
        Some(Value::Number(id)) if id.as_u64() == Some(expected_id) => {}
        other => {
            return Err(protocol(format!(
                "expected reply id {expected_id}, got {}",
                other.unwrap_or(Value::Null)
            )))
        }
    }
    match reply.remove("error") {
        None | Some(Value::Null) => {}
        Some(error) => {
            let ErrorObject { code, message } = serde_json::from_value(error)
                .map_err(|e| protocol(format!("unreadable error object: {e}")))?;
            return Err(RpcError::Application { code, message });
        }
    }
    reply
        .remove("result")
        .ok_or_else(|| protocol("reply has neither result nor error".to_string()))
}

struct Inner {
    node: usize,
    url: String,
    credentials: RpcCredentials,
    http: reqwest::Client,
    next_id: AtomicU64,
    usable: AtomicBool,
    in_flight: Mutex<()>,
    timeout: Duration,
    trace: bool,
}

/// A handle on one node's RPC endpoint. Clones share the id counter and the
/// in-flight lock.
///
/// A client only accepts calls while its node is ready; the owning
/// [`ProcessHandle`](crate::process::ProcessHandle) flips that on readiness
/// and off again when the node is stopped.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("node", &self.inner.node)
            .field("url", &self.inner.url)
            .field("usable", &self.is_usable())
            .finish()
    }
}

impl RpcClient {
    pub fn new(node: &NodeConfig, timeout: Duration, trace: bool) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Connection {
                node: node.index,
                reason: format!("could not build http client: {e}"),
            })?;
        Ok(Self {
            inner: Arc::new(Inner {
                node: node.index,
                url: node.rpc_uri().to_string(),
                credentials: node.credentials.clone(),
                http,
                next_id: AtomicU64::new(1),
                usable: AtomicBool::new(false),
                in_flight: Mutex::new(()),
                timeout,
                trace,
            }),
        })
    }

    pub fn node_index(&self) -> usize {
        self.inner.node
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn is_usable(&self) -> bool {
        self.inner.usable.load(Ordering::SeqCst)
    }

    pub(crate) fn set_usable(&self, usable: bool) {
        self.inner.usable.store(usable, Ordering::SeqCst);
    }

    /// Issue `method` and wait for its reply. Refused connections are retried
    /// a few times; nothing else is.
    pub async fn call(&self, method: &str, params: &[Value]) -> Result<Value, RpcError> {
        if !self.is_usable() {
            return Err(RpcError::Connection {
                node: self.inner.node,
                reason: format!("{method} issued while the node is not running"),
            });
        }
        self.dispatch(method, params, CONNECT_RETRIES, self.inner.timeout)
            .await
    }

    /// A single attempt that does not require the node to be ready, used for
    /// readiness polling and the shutdown request.
    pub(crate) async fn probe(
        &self,
        method: &str,
        params: &[Value],
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        self.dispatch(method, params, 0, timeout).await
    }

    pub async fn call_typed<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &[Value],
    ) -> Result<T, RpcError> {
        let value = self.call(method, params).await?;
        self.decode_result(method, value)
    }

    fn decode_result<T: DeserializeOwned>(&self, method: &str, value: Value) -> Result<T, RpcError> {
        serde_json::from_value(value).map_err(|e| {
            // serde echoes offending values, which for key methods are secrets
            let reason = if is_sensitive(method) {
                format!("{method} returned an unexpected shape")
            } else {
                format!("{method} returned an unexpected shape: {e}")
            };
            RpcError::Protocol {
                node: self.inner.node,
                reason,
            }
        })
    }

    async fn dispatch(
        &self,
        method: &str,
        params: &[Value],
        retries: u32,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let node = self.inner.node;
        let _in_flight = self.inner.in_flight.lock().await;
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        if self.inner.trace {
            if is_sensitive(method) {
                debug!("-> node{node} {method} id={id} (params withheld)");
            } else {
                debug!("-> node{node} {method} id={id} {params:?}");
            }
        }
        let request = Request {
            jsonrpc: "1.0",
            id,
            method,
            params,
        };
        let transport_error = |e: reqwest::Error| {
            if e.is_timeout() {
                RpcError::Timeout {
                    node,
                    method: method.to_string(),
                    timeout,
                }
            } else {
                RpcError::Connection {
                    node,
                    reason: e.to_string(),
                }
            }
        };

        let mut attempt = 0;
        let response = loop {
            let sent = self
                .inner
                .http
                .post(&self.inner.url)
                .basic_auth(
                    &self.inner.credentials.user,
                    Some(&self.inner.credentials.password),
                )
                .timeout(timeout)
                .json(&request)
                .send()
                .await;
            match sent {
                Ok(response) => break response,
                Err(e) if e.is_connect() && attempt < retries => {
                    attempt += 1;
                    debug!("node{node} refused {method}, retry {attempt} of {retries}");
                    sleep(CONNECT_BACKOFF).await;
                }
                Err(e) => return Err(transport_error(e)),
            }
        };
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(RpcError::Protocol {
                node,
                reason: "node rejected the rpc credentials".to_string(),
            });
        }
        let body = response.bytes().await.map_err(transport_error)?;
        let reply = decode_reply(node, &body, id);
        if self.inner.trace {
            match &reply {
                Ok(_) if is_sensitive(method) => debug!("<- node{node} id={id} (result withheld)"),
                Ok(value) => debug!("<- node{node} id={id} {value}"),
                Err(e) => debug!("<- node{node} id={id} {e}"),
            }
        }
        reply
    }

    pub async fn getblockcount(&self) -> Result<u64, RpcError> {
        self.call_typed("getblockcount", &[]).await
    }

    pub async fn z_getnewaddress(&self, pool: ShieldedPool) -> Result<String, RpcError> {
        self.call_typed("z_getnewaddress", &[json!(pool.as_str())])
            .await
    }

    pub async fn z_listaddresses(&self) -> Result<Vec<String>, RpcError> {
        self.call_typed("z_listaddresses", &[]).await
    }

    pub async fn z_exportkey(&self, address: &str) -> Result<SecretString, RpcError> {
        let key: String = self.call_typed("z_exportkey", &[json!(address)]).await?;
        Ok(SecretString::new(key))
    }

    /// Import a spending key. Importing a key the wallet already holds is not
    /// an error.
    pub async fn z_importkey(&self, key: &SecretString) -> Result<Option<ImportedKey>, RpcError> {
        self.call_typed("z_importkey", &[json!(key.expose_secret())])
            .await
    }

    pub async fn z_importkey_with_rescan(
        &self,
        key: &SecretString,
        rescan: Rescan,
        start_height: u64,
    ) -> Result<Option<ImportedKey>, RpcError> {
        self.call_typed(
            "z_importkey",
            &[
                json!(key.expose_secret()),
                json!(rescan.as_str()),
                json!(start_height),
            ],
        )
        .await
    }

    /// Dump the wallet to `filename` inside the node's `-exportdir`, returning
    /// the full path the node wrote.
    pub async fn z_exportwallet(&self, filename: &str) -> Result<PathBuf, RpcError> {
        self.call_typed("z_exportwallet", &[json!(filename)])
            .await
    }

    pub async fn getbestblockhash(&self) -> Result<String, RpcError> {
        self.call_typed("getbestblockhash", &[]).await
    }

    pub async fn getrawmempool(&self) -> Result<Vec<String>, RpcError> {
        self.call_typed("getrawmempool", &[]).await
    }

    /// Ask the node to shut down, waiting at most `timeout` for its answer.
    /// This is the one call that works on a client that is no longer usable,
    /// the owning handle sends it while stopping.
    pub async fn stop(&self, timeout: Duration) -> Result<String, RpcError> {
        let value = self.probe("stop", &[], timeout).await?;
        self.decode_result("stop", value)
    }
}
