use std::env;
use std::path::PathBuf;

pub const DEFAULT_DEVICE_ID: &str = "bitbox-sim";

pub fn default_storage_path() -> PathBuf {
    let home = env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(".bbp").join("channels.json")
}

/// Simulator seed from `--seed`, or a fixed demo seed.
pub fn parse_seed(seed: Option<&str>) -> anyhow::Result<[u8; 32]> {
    let Some(seed) = seed else {
        return Ok([0x42; 32]);
    };
    let bytes = hex::decode(seed.trim_start_matches("0x"))?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| anyhow::anyhow!("seed must be 32 bytes, got {}", bytes.len()))
}
