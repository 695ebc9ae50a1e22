use std::{io, path::PathBuf};

/// Environment variable naming the node executable.
pub const ZCASHD_ENV: &str = "ZCASHD";

pub fn get_cargo_manifest_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

/// Where locally built node binaries are dropped for the test suite.
pub fn get_bin_dir() -> PathBuf {
    let mut dir = get_cargo_manifest_dir();
    dir.pop();
    dir.join("test_binaries").join("bins")
}

/// `$ZCASHD` if set, else a zcashd in [`get_bin_dir`], else whatever
/// `zcashd` resolves to on `PATH`.
pub fn default_zcashd() -> PathBuf {
    if let Some(from_env) = std::env::var_os(ZCASHD_ENV) {
        return PathBuf::from(from_env);
    }
    let bundled = get_bin_dir().join("zcashd");
    if bundled.is_file() {
        bundled
    } else {
        PathBuf::from("zcashd")
    }
}

/// A new, empty run directory under the system temp dir. It is not removed
/// automatically.
pub fn fresh_tmpdir() -> io::Result<PathBuf> {
    Ok(tempfile::Builder::new()
        .prefix("zingo-regtest.")
        .tempdir()?
        .keep())
}
