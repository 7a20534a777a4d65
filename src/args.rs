use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about = "k2s control-plane trust bootstrap", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Prepare certificates and credentials, then serve the bootstrap API
    Server(ServerArgs),
    /// Print the node join token
    Token(DataDirArgs),
    /// Check a join token against the local server CA
    CheckToken(CheckTokenArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Path to configuration file (default: k2s.toml)
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Data directory for certificates and credentials
    #[arg(long, short = 'd')]
    pub data_dir: Option<PathBuf>,

    /// Shared secret used to join servers and agents
    #[arg(long, short = 't', env = "K2S_TOKEN")]
    pub token: Option<String>,

    /// Separate secret for agents (defaults to the server token)
    #[arg(long, env = "K2S_AGENT_TOKEN")]
    pub agent_token: Option<String>,

    /// Replication mode: none, read, write or full
    #[arg(long)]
    pub bootstrap_mode: Option<String>,

    /// HTTPS listen port
    #[arg(long)]
    pub https_port: Option<u16>,
}

#[derive(Args, Debug, Clone)]
pub struct DataDirArgs {
    /// Path to configuration file (default: k2s.toml)
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Data directory for certificates and credentials
    #[arg(long, short = 'd')]
    pub data_dir: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct CheckTokenArgs {
    #[command(flatten)]
    pub location: DataDirArgs,

    /// Join token to validate
    #[arg(long, short = 't')]
    pub token: String,
}

impl From<&DataDirArgs> for ServerArgs {
    fn from(args: &DataDirArgs) -> Self {
        Self {
            config: args.config.clone(),
            data_dir: args.data_dir.clone(),
            token: None,
            agent_token: None,
            bootstrap_mode: None,
            https_port: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server_args() {
        let cli = Cli::parse_from([
            "k2s-bootstrap",
            "server",
            "--data-dir",
            "/srv/k2s",
            "--bootstrap-mode",
            "full",
            "--https-port",
            "7443",
        ]);
        let Command::Server(args) = cli.command else {
            panic!("expected server command");
        };
        assert_eq!(args.data_dir, Some(PathBuf::from("/srv/k2s")));
        assert_eq!(args.bootstrap_mode.as_deref(), Some("full"));
        assert_eq!(args.https_port, Some(7443));
    }

    #[test]
    fn test_parse_check_token() {
        let cli = Cli::parse_from(["k2s-bootstrap", "check-token", "-t", "K10abc::x", "-d", "/d"]);
        let Command::CheckToken(args) = cli.command else {
            panic!("expected check-token command");
        };
        assert_eq!(args.token, "K10abc::x");
        assert_eq!(args.location.data_dir, Some(PathBuf::from("/d")));
    }
}
