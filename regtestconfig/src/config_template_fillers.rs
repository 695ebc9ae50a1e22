pub mod zcashd {
    use crate::NodeConfig;

    /// RPCs the harness relies on that current zcashd gates behind
    /// `-allowdeprecated`.
    pub const ALLOWED_DEPRECATED: [&str; 4] = [
        "getnewaddress",
        "z_getnewaddress",
        "z_listaddresses",
        "z_getbalance",
    ];

    pub fn basic(node: &NodeConfig, extra: &str) -> String {
        let rpcuser = &node.credentials.user;
        let rpcpassword = &node.credentials.password;
        let port = node.p2p_port;
        let rpcport = node.rpc_port;
        let allowed = ALLOWED_DEPRECATED
            .iter()
            .map(|rpc| format!("allowdeprecated={rpc}\n"))
            .collect::<String>();
        format!(
            "\
### Blockchain Configuration
regtest=1
showmetrics=0
listenonion=0
port={port}

### RPC Server Interface Options:
rpcuser={rpcuser}
rpcpassword={rpcpassword}
rpcport={rpcport}
rpcallowip=127.0.0.1

### Deprecated RPCs exercised by the harness
{allowed}{extra}"
        )
    }
}
