#![forbid(unsafe_code)]
//! Support for driving the harness against real processes without a real
//! node: the `stub-zcashd` binary and the library it is built from.
pub mod stub;
