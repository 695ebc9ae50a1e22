//! A stand-in for zcashd that speaks just enough of its command line and
//! JSON-RPC surface for the harness to be driven end to end.
//!
//! Keys are random bech32 blobs and each address is derived from the leading
//! bytes of its key. Nothing here is real cryptography.
use std::{
    collections::BTreeMap,
    convert::Infallible,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use bech32::{FromBase32 as _, ToBase32 as _, Variant};
use http_body_util::{BodyExt as _, Full};
use hyper::{
    body::{Bytes, Incoming},
    header,
    server::conn::http1,
    service::service_fn,
    Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use log::{debug, info, warn};
use rand::RngCore as _;
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::watch, time::Instant};
use zcash_address::{ConversionError, Network, ToAddress as _, TryFromAddress, ZcashAddress};

const SPENDING_KEY_HRP: &str = "secret-extended-key-regtest";
const SPENDING_KEY_LEN: usize = 169;
const RECEIVER_LEN: usize = 43;
/// Hash of the regtest genesis block, the tip of a chain nothing was mined on.
pub const REGTEST_GENESIS_HASH: &str =
    "029f11d80ef9765602235e1bc9727e3eb6ba20839319f761fee920d63401e327";

const RPC_MISC_ERROR: i64 = -1;
const RPC_WALLET_ERROR: i64 = -4;
const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;
const RPC_INVALID_PARAMETER: i64 = -8;
const RPC_IN_WARMUP: i64 = -28;
const RPC_METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, thiserror::Error)]
pub enum StubError {
    #[error("-datadir is required")]
    MissingDataDir,
    #[error("bad value for {flag}: {value}")]
    BadValue { flag: String, value: String },
    #[error("could not read {path}: {source}")]
    Conf {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} is missing from zcash.conf")]
    MissingConfKey(&'static str),
    #[error("could not listen on rpc port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

/// Parsed command line. Unknown flags are accepted and ignored, as zcashd
/// accepts flags for features it was built without.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StubOptions {
    pub datadir: PathBuf,
    pub exportdir: Option<PathBuf>,
    pub connect: Vec<String>,
    /// How long rpc answers -28 after startup.
    pub warmup: Duration,
    pub never_ready: bool,
    /// Exit with this code shortly after launch, before serving anything.
    pub exit_code: Option<i32>,
    pub ignore_stop: bool,
    /// Hold `stop` requests open forever without answering or exiting.
    pub hang_on_stop: bool,
    /// Exit code after a `stop` request.
    pub stop_exit_code: i32,
    /// Reported by `getbestblockhash`, the genesis hash unless overridden.
    pub best_block_hash: Option<String>,
    /// Reported by `getrawmempool`.
    pub mempool: Vec<String>,
    /// Activation heights from `-nuparams`, by branch id.
    pub upgrades: Vec<(u32, u32)>,
}

fn parse_value<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T, StubError> {
    value.parse().map_err(|_| StubError::BadValue {
        flag: flag.to_string(),
        value: value.to_string(),
    })
}

/// `<branch id in hex>:<height>`, as zcashd reads it.
fn parse_upgrade(value: &str) -> Result<(u32, u32), StubError> {
    let bad = || StubError::BadValue {
        flag: "-nuparams".to_string(),
        value: value.to_string(),
    };
    let (branch, height) = value.split_once(':').ok_or_else(bad)?;
    if branch.len() != 8 {
        return Err(bad());
    }
    let branch = u32::from_str_radix(branch, 16).map_err(|_| bad())?;
    let height = height.parse().map_err(|_| bad())?;
    Ok((branch, height))
}

impl StubOptions {
    pub fn from_args<I, S>(args: I) -> Result<Self, StubError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut options = StubOptions::default();
        let mut datadir = None;
        for arg in args {
            let arg = arg.as_ref();
            let (flag, value) = arg.split_once('=').unwrap_or((arg, ""));
            match flag {
                "-datadir" => datadir = Some(PathBuf::from(value)),
                "-exportdir" => options.exportdir = Some(PathBuf::from(value)),
                "-connect" => options.connect.push(value.to_string()),
                "-stubwarmupms" => {
                    options.warmup = Duration::from_millis(parse_value(flag, value)?)
                }
                "-stubneverready" => options.never_ready = true,
                "-stubexitcode" => options.exit_code = Some(parse_value(flag, value)?),
                "-stubignorestop" => options.ignore_stop = true,
                "-stubstopexitcode" => options.stop_exit_code = parse_value(flag, value)?,
                "-stubhangonstop" => options.hang_on_stop = true,
                "-stubbestblockhash" => options.best_block_hash = Some(value.to_string()),
                "-stubmempool" => options.mempool.push(value.to_string()),
                "-nuparams" => options.upgrades.push(parse_upgrade(value)?),
                _ => debug!("ignoring {arg}"),
            }
        }
        options.datadir = datadir.ok_or(StubError::MissingDataDir)?;
        Ok(options)
    }
}

/// The rpc settings the harness wrote into the node's zcash.conf.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcSettings {
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl RpcSettings {
    pub fn read(conf_path: &Path) -> Result<Self, StubError> {
        let contents = std::fs::read_to_string(conf_path).map_err(|source| StubError::Conf {
            path: conf_path.to_path_buf(),
            source,
        })?;
        let lookup = |key: &'static str| {
            contents
                .lines()
                .filter_map(|line| line.split_once('='))
                .find(|(name, _)| name.trim() == key)
                .map(|(_, value)| value.trim().to_string())
                .ok_or(StubError::MissingConfKey(key))
        };
        let port = lookup("rpcport")?;
        Ok(Self {
            port: parse_value("rpcport", &port)?,
            user: lookup("rpcuser")?,
            password: lookup("rpcpassword")?,
        })
    }

    fn authorization(&self) -> String {
        format!(
            "Basic {}",
            base64::encode(format!("{}:{}", self.user, self.password))
        )
    }
}

struct SaplingReceiver {
    network: Network,
}

impl TryFromAddress for SaplingReceiver {
    type Error = Infallible;

    fn try_from_sapling(
        network: Network,
        _data: [u8; RECEIVER_LEN],
    ) -> Result<Self, ConversionError<Self::Error>> {
        Ok(Self { network })
    }
}

type RpcResult = Result<Value, (i64, String)>;

fn invalid_key() -> (i64, String) {
    (
        RPC_INVALID_ADDRESS_OR_KEY,
        "Invalid spending key".to_string(),
    )
}

fn address_for_key(key: &[u8]) -> String {
    let mut receiver = [0u8; RECEIVER_LEN];
    receiver.copy_from_slice(&key[..RECEIVER_LEN]);
    ZcashAddress::from_sapling(Network::Regtest, receiver).encode()
}

/// Sapling keys held by the stub, by address.
#[derive(Debug, Default)]
pub struct Wallet {
    keys: BTreeMap<String, String>,
    exportdir: Option<PathBuf>,
}

impl Wallet {
    pub fn new(exportdir: Option<PathBuf>) -> Self {
        Self {
            keys: BTreeMap::new(),
            exportdir,
        }
    }

    pub fn handle(&mut self, method: &str, params: &[Value]) -> RpcResult {
        match method {
            "getblockcount" => Ok(json!(0)),
            "z_getnewaddress" => self.new_address(params),
            "z_listaddresses" => Ok(json!(self.keys.keys().collect::<Vec<_>>())),
            "z_exportkey" => self.export_key(params),
            "z_importkey" => self.import_key(params),
            "z_exportwallet" => self.export_wallet(params),
            _ => Err((RPC_METHOD_NOT_FOUND, "Method not found".to_string())),
        }
    }

    fn new_address(&mut self, params: &[Value]) -> RpcResult {
        match params.first().and_then(Value::as_str).unwrap_or("sapling") {
            "sapling" => {}
            other => {
                return Err((
                    RPC_INVALID_PARAMETER,
                    format!("Invalid address type {other}"),
                ))
            }
        }
        let mut key = [0u8; SPENDING_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        let encoded = bech32::encode(SPENDING_KEY_HRP, key.to_base32(), Variant::Bech32)
            .map_err(|e| (RPC_MISC_ERROR, e.to_string()))?;
        let address = address_for_key(&key);
        self.keys.insert(address.clone(), encoded);
        Ok(json!(address))
    }

    fn export_key(&self, params: &[Value]) -> RpcResult {
        let invalid = || (RPC_INVALID_ADDRESS_OR_KEY, "Invalid zaddr".to_string());
        let address = params.first().and_then(Value::as_str).ok_or_else(invalid)?;
        let receiver = ZcashAddress::try_from_encoded(address)
            .map_err(|_| invalid())?
            .convert::<SaplingReceiver>()
            .map_err(|_| invalid())?;
        if receiver.network != Network::Regtest {
            return Err(invalid());
        }
        self.keys.get(address).map(|key| json!(key)).ok_or((
            RPC_WALLET_ERROR,
            "Wallet does not hold private zkey for this zaddr".to_string(),
        ))
    }

    fn import_key(&mut self, params: &[Value]) -> RpcResult {
        let encoded = params.first().and_then(Value::as_str).ok_or_else(invalid_key)?;
        if let Some(rescan) = params.get(1).and_then(Value::as_str) {
            if !["yes", "no", "whenkeyisnew"].contains(&rescan) {
                return Err((
                    RPC_INVALID_PARAMETER,
                    "rescan must be \"yes\", \"no\" or \"whenkeyisnew\"".to_string(),
                ));
            }
        }
        let (hrp, data, variant) = bech32::decode(encoded).map_err(|_| invalid_key())?;
        let key = Vec::<u8>::from_base32(&data).map_err(|_| invalid_key())?;
        if hrp != SPENDING_KEY_HRP || variant != Variant::Bech32 || key.len() != SPENDING_KEY_LEN {
            return Err(invalid_key());
        }
        let address = address_for_key(&key);
        self.keys.insert(address.clone(), encoded.to_string());
        Ok(json!({"type": "sapling", "address": address}))
    }

    fn export_wallet(&self, params: &[Value]) -> RpcResult {
        let Some(exportdir) = &self.exportdir else {
            return Err((
                RPC_WALLET_ERROR,
                "Cannot export wallet until the zcashd -exportdir option has been set".to_string(),
            ));
        };
        let filename = params.first().and_then(Value::as_str).unwrap_or_default();
        if filename.is_empty() || !filename.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err((
                RPC_WALLET_ERROR,
                "Filename is invalid as only alphanumeric characters are allowed.  Try again with a different filename.".to_string(),
            ));
        }
        let path = exportdir.join(filename);
        let mut dump = String::from("# Wallet dump created by stub-zcashd\n\n# Sapling keys\n");
        for (address, key) in &self.keys {
            dump.push_str(&format!("{key} # zaddr={address}\n"));
        }
        dump.push_str("\n# End of dump\n");
        std::fs::write(&path, dump).map_err(|e| (RPC_WALLET_ERROR, e.to_string()))?;
        Ok(json!(path))
    }
}

fn is_stop(body: &[u8]) -> bool {
    serde_json::from_slice::<Value>(body)
        .map(|request| request["method"] == "stop")
        .unwrap_or(false)
}

/// One stub node: its wallet, its warm-up clock and its stop signal.
pub struct StubNode {
    options: StubOptions,
    authorization: String,
    ready_at: Instant,
    wallet: Mutex<Wallet>,
    stop: watch::Sender<bool>,
}

fn reply(status: StatusCode, body: Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}

impl StubNode {
    pub fn new(options: StubOptions, settings: &RpcSettings) -> Arc<Self> {
        let (stop, _) = watch::channel(false);
        Arc::new(Self {
            authorization: settings.authorization(),
            ready_at: Instant::now() + options.warmup,
            wallet: Mutex::new(Wallet::new(options.exportdir.clone())),
            options,
            stop,
        })
    }

    fn is_warm(&self) -> bool {
        !self.options.never_ready && Instant::now() >= self.ready_at
    }

    /// Answer one decoded request body.
    pub fn dispatch(&self, body: &[u8]) -> (StatusCode, Value) {
        let Ok(request) = serde_json::from_slice::<Value>(body) else {
            return (
                StatusCode::BAD_REQUEST,
                json!({"result": null, "error": {"code": -32700, "message": "Parse error"}, "id": null}),
            );
        };
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let method = request.get("method").and_then(Value::as_str).unwrap_or_default();
        let params = match request.get("params") {
            Some(Value::Array(params)) => params.clone(),
            _ => vec![],
        };
        debug!("{method} id={id}");

        let result = if !self.is_warm() {
            Err((RPC_IN_WARMUP, "Loading block index...".to_string()))
        } else if method == "getbestblockhash" {
            Ok(json!(self
                .options
                .best_block_hash
                .as_deref()
                .unwrap_or(REGTEST_GENESIS_HASH)))
        } else if method == "getrawmempool" {
            Ok(json!(self.options.mempool))
        } else if method == "stop" {
            if self.options.ignore_stop {
                warn!("ignoring stop");
            } else {
                let _ = self.stop.send(true);
            }
            Ok(json!("Zcash server stopping"))
        } else {
            match self.wallet.lock() {
                Ok(mut wallet) => wallet.handle(method, &params),
                Err(_) => Err((RPC_MISC_ERROR, "wallet lock poisoned".to_string())),
            }
        };
        match result {
            Ok(result) => (
                StatusCode::OK,
                json!({"result": result, "error": null, "id": id}),
            ),
            Err((code, message)) => {
                let status = if code == RPC_METHOD_NOT_FOUND {
                    StatusCode::NOT_FOUND
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                (
                    status,
                    json!({"result": null, "error": {"code": code, "message": message}, "id": id}),
                )
            }
        }
    }

    async fn handle(
        self: Arc<Self>,
        request: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            == Some(self.authorization.as_str());
        if !authorized {
            let mut response = Response::new(Full::new(Bytes::new()));
            *response.status_mut() = StatusCode::UNAUTHORIZED;
            return Ok(response);
        }
        let body = match request.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!("could not read request: {e}");
                Bytes::new()
            }
        };
        if self.options.hang_on_stop && self.is_warm() && is_stop(&body) {
            warn!("holding stop open");
            std::future::pending::<()>().await;
        }
        let (status, body) = self.dispatch(&body);
        Ok(reply(status, body))
    }

    /// Serve rpc on `listener` until a `stop` request arrives.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        let mut stopped = self.stop.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (tcp, _) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("accept failed: {e}");
                            continue;
                        }
                    };
                    let node = self.clone();
                    tokio::task::spawn(async move {
                        let service = service_fn(move |request| node.clone().handle(request));
                        if let Err(e) = http1::Builder::new()
                            .serve_connection(TokioIo::new(tcp), service)
                            .await
                        {
                            debug!("connection closed: {e}");
                        }
                    });
                }
                _ = stopped.changed() => {
                    info!("stopping");
                    // let the reply to `stop` reach the client
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    return;
                }
            }
        }
    }
}

/// The whole life of a stub process, returning its exit code.
pub async fn run<I, S>(args: I) -> Result<i32, StubError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let options = StubOptions::from_args(args)?;
    if let Some(code) = options.exit_code {
        tokio::time::sleep(Duration::from_millis(100)).await;
        warn!("exiting early with {code}");
        return Ok(code);
    }
    let settings = RpcSettings::read(&options.datadir.join("zcash.conf"))?;
    let listener = TcpListener::bind(("127.0.0.1", settings.port))
        .await
        .map_err(|source| StubError::Bind {
            port: settings.port,
            source,
        })?;
    info!(
        "rpc on {}, peers {:?}, export dir {:?}, upgrades {:?}",
        settings.port, options.connect, options.exportdir, options.upgrades
    );
    let stop_exit_code = options.stop_exit_code;
    StubNode::new(options, &settings).serve(listener).await;
    Ok(stop_exit_code)
}
