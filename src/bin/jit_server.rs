use std::{error::Error, net::SocketAddr};

use clap::Parser;
use jitwire::{CompileServer, DiagnosticCompiler, cli::TransportArgs};
use log::info;

#[derive(Debug, Parser)]
#[command(version, about = "Serve remote compilation requests", long_about = None)]
struct Cli {
    /// Listen for new connections at address
    address: SocketAddr,
    /// Number of connections served concurrently
    #[arg(long, default_value_t = 4)]
    workers: usize,
    #[command(flatten)]
    transport: TransportArgs,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let server = CompileServer::bind(
        cli.address,
        DiagnosticCompiler,
        cli.workers,
        cli.transport.config(),
    )?;

    let handle = server.shutdown_handle();
    ctrlc::set_handler(move || {
        info!("received interrupt, shutting down");
        handle.shutdown();
    })?;

    server.listen()?;
    Ok(())
}
