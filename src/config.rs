//! Command-line configuration.
//!
//! Shaped the same way as a typical `clap`-derived entrypoint: one `Args`
//! struct with `#[arg(long, ...)]` fields, parsed once in `main` and handed
//! down as a read-only snapshot. Unknown flags are tolerated by `clap`'s
//! default behavior; a missing value for a flag that requires one is fatal
//! and clap prints its own usage message before the process exits.

use clap::Parser;

use crate::errors::{ServerError, ServerResult};

#[derive(Parser, Debug, Clone)]
#[command(name = "kvrs", about = "An in-memory, single-process key-value server", version)]
pub struct Args {
    /// TCP port to listen on.
    #[arg(long, default_value_t = 6379)]
    pub port: u16,

    /// `<host>:<port>` of a primary to replicate from. Omit to run as
    /// primary.
    #[arg(long)]
    pub replicaof: Option<String>,

    /// Directory holding the on-disk snapshot file.
    #[arg(long)]
    pub dir: Option<String>,

    /// Snapshot file name within `--dir`.
    #[arg(long)]
    pub dbfilename: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Role {
    Primary,
    Replica { host: String, port: u16 },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub role: Role,
    pub dir: Option<String>,
    pub dbfilename: Option<String>,
}

impl ServerConfig {
    pub fn from_args(args: Args) -> ServerResult<Self> {
        let role = match args.replicaof {
            None => Role::Primary,
            Some(spec) => {
                let mut parts = spec.split_whitespace();
                let host = parts
                    .next()
                    .ok_or_else(|| ServerError::config("--replicaof requires \"<host> <port>\""))?
                    .to_string();
                let port_text = parts
                    .next()
                    .ok_or_else(|| ServerError::config("--replicaof requires \"<host> <port>\""))?;
                let port = port_text
                    .parse::<u16>()
                    .map_err(|_| ServerError::config(format!("invalid replicaof port: {port_text}")))?;
                Role::Replica { host, port }
            }
        };
        Ok(Self {
            port: args.port,
            role,
            dir: args.dir,
            dbfilename: args.dbfilename,
        })
    }

    pub fn snapshot_path(&self) -> Option<std::path::PathBuf> {
        let dir = self.dir.as_ref()?;
        let name = self.dbfilename.as_ref()?;
        Some(std::path::Path::new(dir).join(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replicaof_parses_host_and_port() {
        let args = Args {
            port: 6380,
            replicaof: Some("localhost 6379".to_string()),
            dir: None,
            dbfilename: None,
        };
        let config = ServerConfig::from_args(args).unwrap();
        match config.role {
            Role::Replica { host, port } => {
                assert_eq!(host, "localhost");
                assert_eq!(port, 6379);
            }
            Role::Primary => panic!("expected replica role"),
        }
    }

    #[test]
    fn missing_replicaof_is_primary() {
        let args = Args {
            port: 6379,
            replicaof: None,
            dir: None,
            dbfilename: None,
        };
        let config = ServerConfig::from_args(args).unwrap();
        assert!(matches!(config.role, Role::Primary));
    }
}
