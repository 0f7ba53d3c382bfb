use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::warn;

use stomp_chat::{
    broker,
    cli::{Cli, Command},
    client,
};

fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    // Stdout belongs to the user console; diagnostics go to stderr.
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.command.default_log_filter());

    match cli.command {
        Command::Broker(args) => {
            let listener = TcpListener::bind(args.listen).await?;
            let broker = broker::Broker::new(listener);
            let addr = broker.local_addr()?;
            println!("broker listening on {addr}");
            if let Err(err) = broker.run_until_ctrl_c().await {
                warn!("broker exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
