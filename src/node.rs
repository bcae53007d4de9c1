//! Node configuration parsed from environment variables.
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `GASTROLOG_NODE_ID` | Stable node identity | `HOSTNAME`, then `"gastrolog-node"` |
//! | `GASTROLOG_BIND_ADDR` | gRPC listener | `0.0.0.0:7400` |
//! | `GASTROLOG_STORE` | `memory` \| `file` \| `sqlite` \| `raft` | `sqlite` |
//! | `GASTROLOG_DATA_DIR` | Data directory for durable backends | `./gastrolog-data` |
//! | `GASTROLOG_BOOTSTRAP` | `full` \| `minimal` | `full` |
//! | `GASTROLOG_CLUSTER_NODES` | Comma-separated peer gRPC addresses (raft) | empty |
//! | `GASTROLOG_SELF_ADDR` | This node's address as it appears in the peer list | unset |

use std::path::PathBuf;
use std::str::FromStr;

use crate::bootstrap::BootstrapMode;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    File,
    Sqlite,
    Raft,
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(BackendKind::Memory),
            "file" => Ok(BackendKind::File),
            "sqlite" => Ok(BackendKind::Sqlite),
            "raft" => Ok(BackendKind::Raft),
            other => Err(Error::InvalidArgument(format!(
                "unknown GASTROLOG_STORE {other:?}: use memory, file, sqlite, or raft"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub node_id: String,
    pub bind_addr: String,
    pub backend: BackendKind,
    pub data_dir: PathBuf,
    pub bootstrap: BootstrapMode,
    pub cluster_nodes: Vec<String>,
    pub self_addr: Option<String>,
}

impl NodeOptions {
    pub fn from_env() -> Result<NodeOptions> {
        let node_id = std::env::var("GASTROLOG_NODE_ID").unwrap_or_else(|_| {
            std::env::var("HOSTNAME").unwrap_or_else(|_| "gastrolog-node".to_string())
        });

        let bind_addr =
            std::env::var("GASTROLOG_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:7400".to_string());

        let backend = std::env::var("GASTROLOG_STORE")
            .unwrap_or_else(|_| "sqlite".to_string())
            .parse()?;

        let data_dir = PathBuf::from(
            std::env::var("GASTROLOG_DATA_DIR").unwrap_or_else(|_| "./gastrolog-data".to_string()),
        );

        let bootstrap = match std::env::var("GASTROLOG_BOOTSTRAP")
            .unwrap_or_else(|_| "full".to_string())
            .to_lowercase()
            .as_str()
        {
            "full" => BootstrapMode::Full,
            "minimal" => BootstrapMode::Minimal,
            other => {
                return Err(Error::InvalidArgument(format!(
                    "unknown GASTROLOG_BOOTSTRAP {other:?}: use full or minimal"
                )))
            }
        };

        let cluster_nodes = std::env::var("GASTROLOG_CLUSTER_NODES")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let self_addr = std::env::var("GASTROLOG_SELF_ADDR").ok();

        Ok(NodeOptions {
            node_id,
            bind_addr,
            backend,
            data_dir,
            bootstrap,
            cluster_nodes,
            self_addr,
        })
    }

    /// File-backend config path inside the data directory.
    pub fn config_file_path(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_parses() {
        assert_eq!("memory".parse::<BackendKind>().unwrap(), BackendKind::Memory);
        assert_eq!("SQLite".parse::<BackendKind>().unwrap(), BackendKind::Sqlite);
        assert_eq!("raft".parse::<BackendKind>().unwrap(), BackendKind::Raft);
        assert!("postgres".parse::<BackendKind>().is_err());
    }
}
