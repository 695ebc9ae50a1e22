#![forbid(unsafe_code)]
pub fn main() {
    std::process::exit(zingo_regtest_cli::run_cli());
}
