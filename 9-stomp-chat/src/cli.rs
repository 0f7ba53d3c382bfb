use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::encoder::DEFAULT_VIRTUAL_HOST;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a STOMP broker that accepts local TCP connections.
    Broker(BrokerArgs),
    /// Start the interactive client; log in with `login <host:port> <user> <password>`.
    Client(ClientArgs),
}

impl Command {
    /// Log filter used when `RUST_LOG` is unset. The client stays quiet so
    /// diagnostics do not drown the chat on the terminal.
    pub fn default_log_filter(&self) -> &'static str {
        match self {
            Command::Broker(_) => "info",
            Command::Client(_) => "warn",
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    /// Socket address the broker should bind to. Use 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:7777")]
    pub listen: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Virtual host announced in the CONNECT frame.
    #[arg(long, default_value = DEFAULT_VIRTUAL_HOST)]
    pub virtual_host: String,

    /// How often queued console commands are checked, in milliseconds.
    #[arg(long, default_value_t = 10)]
    pub poll_interval_ms: u64,
}

impl ClientArgs {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
