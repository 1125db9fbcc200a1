//! Shared plumbing for the `veilnet` and `veilnet-relayd` binaries.

#![warn(clippy::all)]

pub mod logging;

use std::path::Path;

use serde::de::DeserializeOwned;

/// Process exit codes
pub mod exit {
    /// Normal shutdown
    pub const OK: u8 = 0;
    /// Configuration error
    pub const CONFIG: u8 = 1;
    /// Identity error
    pub const IDENTITY: u8 = 2;
    /// Fatal network or crypto error
    pub const FATAL: u8 = 3;
}

/// Load a YAML configuration file into `T`, or `T::default()` when no path
/// is given. A missing explicit path or a parse failure is a configuration
/// error.
///
/// # Errors
///
/// A human-readable message destined for stderr and exit code 1.
pub fn load_config<T>(path: Option<&Path>) -> Result<T, String>
where
    T: DeserializeOwned + Default,
{
    let Some(path) = path else {
        return Ok(T::default());
    };

    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read config {}: {e}", path.display()))?;
    serde_yaml::from_str(&contents).map_err(|e| format!("invalid config {}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use veilnet_core::config::Config;

    #[test]
    fn test_no_path_yields_defaults() {
        let config: Config = load_config(None).unwrap();
        assert_eq!(config.tap.mtu, 1500);
    }

    #[test]
    fn test_missing_file_is_error() {
        let result: Result<Config, _> = load_config(Some(Path::new("/nonexistent.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_roundtrip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "mode: connector\np2p:\n  peer_address: 10.0.0.9:9000").unwrap();

        let config: Config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.p2p.peer_address, "10.0.0.9:9000");
    }

    #[test]
    fn test_bad_yaml_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "mode: [not a mode").unwrap();

        let result: Result<Config, _> = load_config(Some(file.path()));
        assert!(result.is_err());
    }
}
