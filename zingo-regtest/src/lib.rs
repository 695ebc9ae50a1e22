#![forbid(unsafe_code)]
//! Bring up a local network of zcashd nodes, drive their wallets over
//! JSON-RPC, and tear everything down again.
//!
//! A run is a [`scenario::Scenario`] handed to [`runner::run_scenario`] (or
//! [`runner::run_main`] from a binary). The scenario asks the
//! [`network::RegtestNetwork`] for nodes, which are only handed out once every
//! one of them answers rpc, and records its checks with an
//! [`assertions::AssertionReporter`].
pub mod assertions;
pub mod interrupts;
pub mod keys;
pub mod network;
pub mod paths;
pub mod process;
pub mod rpc;
pub mod runner;
pub mod scenario;
pub mod scenarios;

pub use regtestconfig;
