/// Command line interface for the filemesh node binary.
///
/// Only the knobs the core consumes are exposed: listen address,
/// bootstrap list, storage root, and the shared cluster key. Everything
/// else lives in the configuration file.
use std::path::PathBuf;

use clap::Parser;

use crate::crypto::KEY_SIZE;
use crate::error::{MeshError, MeshResult};

#[derive(Parser, Debug, Clone)]
#[command(name = "filemesh", about = "Peer-to-peer content-addressed encrypted file storage node")]
pub struct Cli {
    /// Path to a TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Address to listen on (overrides the configuration file)
    #[arg(long)]
    pub listen: Option<String>,
    /// Bootstrap node address; repeat the flag to dial several nodes
    #[arg(long = "bootstrap")]
    pub bootstrap: Vec<String>,
    /// Storage root directory (overrides the configuration file)
    #[arg(long)]
    pub root: Option<PathBuf>,
    /// Hex-encoded 32-byte cluster encryption key; generated when omitted
    #[arg(long)]
    pub key: Option<String>,
}

impl Cli {
    /// Decode `--key` into a cluster key, if one was given.
    pub fn encryption_key(&self) -> MeshResult<Option<[u8; KEY_SIZE]>> {
        let Some(raw) = &self.key else {
            return Ok(None);
        };
        let bytes = hex::decode(raw)
            .map_err(|err| MeshError::Config(format!("invalid --key: {err}")))?;
        let key: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| MeshError::Config("--key must be exactly 32 bytes of hex".into()))?;
        Ok(Some(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_node_flags() {
        let cli = Cli::parse_from([
            "filemesh",
            "--listen",
            "127.0.0.1:3999",
            "--bootstrap",
            "127.0.0.1:4999",
            "--bootstrap",
            "127.0.0.1:5999",
            "--root",
            "/tmp/mesh",
        ]);
        assert_eq!(cli.listen.as_deref(), Some("127.0.0.1:3999"));
        assert_eq!(cli.bootstrap.len(), 2);
        assert_eq!(cli.root, Some(PathBuf::from("/tmp/mesh")));
        assert!(cli.encryption_key().unwrap().is_none());
    }

    #[test]
    fn decodes_a_valid_key() {
        let hex_key = "00".repeat(KEY_SIZE);
        let cli = Cli::parse_from(["filemesh", "--key", hex_key.as_str()]);
        assert_eq!(cli.encryption_key().unwrap(), Some([0u8; KEY_SIZE]));
    }

    #[test]
    fn rejects_a_short_key() {
        let cli = Cli::parse_from(["filemesh", "--key", "abcd"]);
        assert!(matches!(
            cli.encryption_key().unwrap_err(),
            MeshError::Config(_)
        ));
    }

    #[test]
    fn rejects_non_hex_keys() {
        let bad = "zz".repeat(KEY_SIZE);
        let cli = Cli::parse_from(["filemesh", "--key", bad.as_str()]);
        assert!(matches!(
            cli.encryption_key().unwrap_err(),
            MeshError::Config(_)
        ));
    }
}
