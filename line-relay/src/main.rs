use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use line_relay::{
    cli::{Cli, Command},
    client,
    logging::{self, LogConfig},
    relay::Relay,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            let _log_guard = logging::init(&LogConfig {
                dir: args.log_dir.clone(),
                name: args.log_name.clone(),
                rotation: args.rotation,
            })
            .context("failed to set up logging")?;

            let relay = match Relay::bind(args.listen, args.relay_config()).await {
                Ok(relay) => relay,
                Err(err) => {
                    error!("fatal: {err:#}");
                    return Err(err);
                }
            };
            let addr = relay.local_addr()?;
            info!("relay listening on {}", addr);
            if let Err(err) = relay.run_until_ctrl_c().await {
                error!("relay exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => {
            logging::init_console();
            client::run(args).await?;
        }
    }

    Ok(())
}
