#![forbid(unsafe_code)]
use std::path::PathBuf;
use std::time::Duration;

use clap::{self, Arg};
use regtestconfig::{HarnessConfig, PortSeed, Topology, MAX_NODES};
use zingo_regtest::{
    paths,
    runner::{run_main, EXIT_FAILED},
    scenarios::{ExportUnknownAddress, ExportWallet, NetworkShape, WalletImportExport},
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScenarioKind {
    WalletImportExport,
    ExportUnknownAddress,
    ExportWallet,
}

pub fn build_clap_app() -> clap::Command {
    clap::Command::new("zingo-regtest").version(VERSION)
            .arg(Arg::new("SCENARIO")
                .help("Scenario to run. One of \"wallet-import-export\", \"export-unknown-address\", or \"export-wallet\"")
                .required(true)
                .value_parser(parse_scenario)
                .index(1))
            .arg(Arg::new("zcashd")
                .long("zcashd")
                .value_name("zcashd")
                .value_parser(clap::value_parser!(PathBuf))
                .help("zcashd binary to launch. Defaults to $ZCASHD, then test_binaries/bins/zcashd, then zcashd on PATH"))
            .arg(Arg::new("tmpdir")
                .long("tmpdir")
                .value_name("tmpdir")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Root directory for node data, must be empty or absent. Defaults to a fresh directory under the system temp dir"))
            .arg(Arg::new("nocleanup")
                .long("nocleanup")
                .help("Leave the run directory in place even when the scenario passes")
                .action(clap::ArgAction::SetTrue))
            .arg(Arg::new("tracerpc")
                .long("tracerpc")
                .help("Log every rpc call and reply at debug level. Key material is never logged")
                .action(clap::ArgAction::SetTrue))
            .arg(Arg::new("nodes")
                .long("nodes")
                .value_name("nodes")
                .value_parser(clap::value_parser!(usize))
                .default_value("1")
                .help("Number of nodes to start"))
            .arg(Arg::new("split")
                .long("split")
                .help("Split the nodes into two halves with no connection between them")
                .action(clap::ArgAction::SetTrue))
            .arg(Arg::new("rpc-timeout-secs")
                .long("rpc-timeout-secs")
                .value_name("secs")
                .value_parser(clap::value_parser!(u64))
                .help("Per call rpc timeout"))
            .arg(Arg::new("ready-timeout-secs")
                .long("ready-timeout-secs")
                .value_name("secs")
                .value_parser(clap::value_parser!(u64))
                .help("How long each node gets to answer rpc after launch"))
            .arg(Arg::new("scenario-timeout-secs")
                .long("scenario-timeout-secs")
                .value_name("secs")
                .value_parser(clap::value_parser!(u64))
                .help("Bound on setup plus the scenario itself, 0 for none"))
            .arg(Arg::new("port-seed")
                .long("port-seed")
                .value_name("seed")
                .value_parser(clap::value_parser!(u32))
                .help("Seed for the port layout. Defaults to the process id"))
            .arg(Arg::new("verbose")
                .long("verbose")
                .short('v')
                .help("Mirror info level log lines to stderr")
                .action(clap::ArgAction::SetTrue))
}

fn parse_scenario(s: &str) -> Result<ScenarioKind, String> {
    match s {
        "wallet-import-export" => Ok(ScenarioKind::WalletImportExport),
        "export-unknown-address" => Ok(ScenarioKind::ExportUnknownAddress),
        "export-wallet" => Ok(ScenarioKind::ExportWallet),
        other => Err(format!("Unknown scenario: {other}")),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TemplateFillError {
    #[error("--nodes must be between 1 and {max}, got {0}", max = MAX_NODES)]
    InvalidNodeCount(usize),
    #[error("--split needs at least two nodes")]
    SplitNeedsTwoNodes,
    #[error("{0} already exists and is not empty")]
    TmpdirNotEmpty(PathBuf),
    #[error("could not create a run directory: {0}")]
    TmpdirUnavailable(#[from] std::io::Error),
}

/// Everything a run needs, resolved from the command line.
#[derive(Debug)]
pub struct ConfigTemplate {
    pub scenario: ScenarioKind,
    pub shape: NetworkShape,
    pub harness: HarnessConfig,
}

fn secs(matches: &clap::ArgMatches, id: &str) -> Option<Duration> {
    matches.get_one::<u64>(id).map(|s| Duration::from_secs(*s))
}

impl ConfigTemplate {
    pub fn fill(matches: clap::ArgMatches) -> Result<Self, TemplateFillError> {
        let scenario = *matches
            .get_one::<ScenarioKind>("SCENARIO")
            .unwrap_or(&ScenarioKind::WalletImportExport);
        let node_count = matches.get_one::<usize>("nodes").copied().unwrap_or(1);
        if node_count == 0 || node_count > MAX_NODES {
            return Err(TemplateFillError::InvalidNodeCount(node_count));
        }
        let topology = if matches.get_flag("split") {
            if node_count < 2 {
                return Err(TemplateFillError::SplitNeedsTwoNodes);
            }
            Topology::Split
        } else {
            Topology::Joined
        };

        let tmpdir = match matches.get_one::<PathBuf>("tmpdir") {
            Some(tmpdir) => {
                if tmpdir.exists() && std::fs::read_dir(tmpdir)?.next().is_some() {
                    return Err(TemplateFillError::TmpdirNotEmpty(tmpdir.clone()));
                }
                tmpdir.clone()
            }
            None => paths::fresh_tmpdir()?,
        };
        let zcashd = matches
            .get_one::<PathBuf>("zcashd")
            .cloned()
            .unwrap_or_else(paths::default_zcashd);

        let mut harness = HarnessConfig::new(zcashd, tmpdir);
        harness.nocleanup = matches.get_flag("nocleanup");
        harness.trace_rpc = matches.get_flag("tracerpc");
        harness.log_to_stderr = matches.get_flag("verbose");
        if let Some(seed) = matches.get_one::<u32>("port-seed") {
            harness.port_seed = PortSeed::new(*seed);
        }
        if let Some(timeout) = secs(&matches, "rpc-timeout-secs") {
            harness.rpc_timeout = timeout;
        }
        if let Some(timeout) = secs(&matches, "ready-timeout-secs") {
            harness.ready_timeout = timeout;
        }
        if let Some(timeout) = secs(&matches, "scenario-timeout-secs") {
            harness.scenario_timeout = (!timeout.is_zero()).then_some(timeout);
        }

        Ok(Self {
            scenario,
            shape: NetworkShape {
                node_count,
                topology,
                extra_args: vec![],
            },
            harness,
        })
    }
}

/// Runs the selected scenario to completion, returning the exit code.
pub async fn dispatch(template: ConfigTemplate) -> i32 {
    let ConfigTemplate {
        scenario,
        shape,
        harness,
    } = template;
    match scenario {
        ScenarioKind::WalletImportExport => {
            run_main(WalletImportExport::new(shape), harness).await
        }
        ScenarioKind::ExportUnknownAddress => {
            run_main(ExportUnknownAddress::new(shape), harness).await
        }
        ScenarioKind::ExportWallet => run_main(ExportWallet::new(shape), harness).await,
    }
}

pub fn run_cli() -> i32 {
    let template = match ConfigTemplate::fill(build_clap_app().get_matches()) {
        Ok(template) => template,
        Err(e) => {
            eprintln!("{e}");
            return EXIT_FAILED;
        }
    };
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Could not start the async runtime: {e}");
            return EXIT_FAILED;
        }
    };
    runtime.block_on(dispatch(template))
}
