use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

use crate::{config::RelayConfig, line::DEFAULT_MAX_LINE_BYTES, logging::Rotation};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, rebroadcasting every received line to all clients.
    Serve(ServeArgs),
    /// Connect to a relay and exchange lines over stdin/stdout.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:7777")]
    pub listen: SocketAddr,

    /// Directory that receives the rotating log files.
    #[arg(long, default_value = "./logs")]
    pub log_dir: PathBuf,

    /// Base name of each log file; the time bucket is appended.
    #[arg(long, default_value = "server")]
    pub log_name: String,

    /// How often the log file rolls over.
    #[arg(long, value_enum, default_value_t = Rotation::Day)]
    pub rotation: Rotation,

    /// Longest line accepted from a client, in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_LINE_BYTES)]
    pub max_line_bytes: usize,
}

impl ServeArgs {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            max_line_bytes: self.max_line_bytes,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:7777")]
    pub server: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_defaults() {
        let cli = Cli::try_parse_from(["line-relay", "serve"]).unwrap();
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.listen, "0.0.0.0:7777".parse::<SocketAddr>().unwrap());
        assert_eq!(args.rotation, Rotation::Day);
        assert_eq!(args.log_name, "server");
        assert_eq!(args.relay_config(), RelayConfig::default());
    }

    #[test]
    fn rotation_is_parsed_by_name() {
        let cli = Cli::try_parse_from(["line-relay", "serve", "--rotation", "minute"]).unwrap();
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.rotation, Rotation::Minute);
    }

    #[test]
    fn unknown_rotation_is_rejected() {
        assert!(Cli::try_parse_from(["line-relay", "serve", "--rotation", "weekly"]).is_err());
    }
}
