use std::io::{self, IsTerminal};

use anyhow::Result;
use clap::Parser;
use tracing::info;

use concurrent_db::{
    cli::{Cli, Command},
    client,
    server::Server,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(io::stdout().is_terminal())
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            let server = Server::start(args.listen_addr())?.with_interrupt_monitor()?;
            info!("server listening on {}", server.local_addr());
            let report = server.run_console(io::stdin().lock());
            info!(entries = report.entries_destroyed, "server exited");
        }
        Command::Client(args) => client::run(args)?,
    }

    Ok(())
}
