//! Command-line interface

use clap::{Args, Parser, Subcommand};

use clusterview_core::config::{Config, PeersConfig};

#[derive(Parser, Debug)]
#[command(name = "clusterview")]
#[command(about = "Cluster health verification and cluster view", long_about = None)]
pub struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "CLUSTERVIEW_CONFIG_FILE")]
    pub config: Option<String>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format override (json or pretty)
    #[arg(long)]
    pub log_format: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Wait until the cluster is healthy; exits non-zero if it never gets there
    Verify(VerifyArgs),
    /// Connect to every member once and report which ones answered
    Connections(PeerArgs),
    /// Serve the cluster view over HTTP
    Serve(ServeArgs),
}

/// Members to inspect; replaces the configured lists when given
#[derive(Args, Debug, Default, Clone)]
pub struct PeerArgs {
    /// Member management endpoint, repeatable
    #[arg(long = "peer", value_name = "[NAME=]HOST:PORT")]
    pub peers: Vec<String>,

    /// Domain UID; members are addressed as <domain>-<server>:<port>
    #[arg(long)]
    pub domain_uid: Option<String>,

    /// Server name within the domain, repeatable
    #[arg(long = "server", value_name = "NAME")]
    pub servers: Vec<String>,

    /// Management port for domain members
    #[arg(long)]
    pub port: Option<u16>,
}

impl PeerArgs {
    pub fn apply(&self, peers: &mut PeersConfig) {
        if !self.peers.is_empty() {
            peers.endpoints.clone_from(&self.peers);
        }
        if self.domain_uid.is_some() {
            peers.domain_uid.clone_from(&self.domain_uid);
        }
        if !self.servers.is_empty() {
            peers.servers.clone_from(&self.servers);
        }
        if let Some(port) = self.port {
            peers.port = port;
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct VerifyArgs {
    #[command(flatten)]
    pub peers: PeerArgs,

    /// Member that must report HEALTH_OK, repeatable
    #[arg(long = "expect", value_name = "MEMBER")]
    pub expected: Vec<String>,

    /// Give up after this many seconds
    #[arg(long)]
    pub timeout_seconds: Option<u64>,

    /// Delay between polls in milliseconds
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub peers: PeerArgs,

    /// HTTP listen port
    #[arg(long)]
    pub http_port: Option<u16>,
}

impl Cli {
    /// Fold command-line overrides into the loaded configuration
    pub fn apply(&self, config: &mut Config) {
        if let Some(level) = &self.log_level {
            config.logging.level.clone_from(level);
        }
        if let Some(format) = &self.log_format {
            config.logging.format.clone_from(format);
        }

        match &self.command {
            Command::Verify(args) => {
                args.peers.apply(&mut config.peers);
                if !args.expected.is_empty() {
                    config.peers.expected_members.clone_from(&args.expected);
                }
                if let Some(timeout) = args.timeout_seconds {
                    config.poll.timeout_seconds = timeout;
                }
                if let Some(interval) = args.poll_interval_ms {
                    config.poll.poll_interval_ms = interval;
                }
            }
            Command::Connections(args) => args.apply(&mut config.peers),
            Command::Serve(args) => {
                args.peers.apply(&mut config.peers);
                if let Some(port) = args.http_port {
                    config.server.http_port = port;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_verify_overrides() {
        let cli = Cli::try_parse_from([
            "clusterview",
            "--log-level",
            "debug",
            "verify",
            "--domain-uid",
            "domain1",
            "--server",
            "managed-server1",
            "--server",
            "managed-server2",
            "--expect",
            "managed-server1",
            "--timeout-seconds",
            "60",
        ])
        .unwrap();

        let mut config = Config::default();
        cli.apply(&mut config);

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.peers.domain_uid.as_deref(), Some("domain1"));
        assert_eq!(config.peers.servers, vec!["managed-server1", "managed-server2"]);
        assert_eq!(config.peers.expected_members, vec!["managed-server1"]);
        assert_eq!(config.poll.timeout_seconds, 60);
        // Untouched values keep their defaults
        assert_eq!(config.poll.poll_interval_ms, 10_000);
    }

    #[test]
    fn test_serve_overrides() {
        let cli = Cli::try_parse_from([
            "clusterview",
            "serve",
            "--peer",
            "ms1=10.0.0.4:7001",
            "--http-port",
            "9090",
        ])
        .unwrap();

        let mut config = Config::default();
        cli.apply(&mut config);

        assert_eq!(config.peers.endpoints, vec!["ms1=10.0.0.4:7001"]);
        assert_eq!(config.server.http_port, 9090);
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["clusterview"]).is_err());
    }
}
