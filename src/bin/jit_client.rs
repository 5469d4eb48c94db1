use std::{error::Error, net::SocketAddr};

use clap::Parser;
use jitwire::{
    ClientStream, CompileOutcome,
    cli::{TransportArgs, parse_hex},
    compile_remote,
    protocol::Handle,
};

#[derive(Debug, Parser)]
#[command(version, about = "Send one compilation request to a server", long_about = None)]
struct Cli {
    /// Address of the compilation server
    address: SocketAddr,
    /// Signature of the method to compile
    signature: String,
    /// Method bytecode as hex digits
    bytecode: String,
    /// Optimization level
    #[arg(long, default_value_t = 1)]
    opt_level: u32,
    /// Handle returned when the server resolves the method
    #[arg(long, default_value_t = 0x1000)]
    method_handle: u64,
    /// End the whole client session instead of just this connection
    #[arg(long)]
    client_id: Option<u64>,
    #[command(flatten)]
    transport: TransportArgs,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let bytecode = parse_hex(&cli.bytecode)?;
    let mut client = ClientStream::connect_tcp(cli.address, cli.transport.config())?;
    println!("connected, protocol {}", client.peer_version());

    let outcome = compile_remote(&mut client, &cli.signature, &bytecode, cli.opt_level, |name| {
        (name == cli.signature).then_some(Handle(cli.method_handle))
    })?;

    match outcome {
        CompileOutcome::Compiled { code, method } => {
            let hex: Vec<String> = code.0.iter().map(|b| format!("{b:02x}")).collect();
            println!("compiled {} at {:#x}: {}", cli.signature, method.0, hex.join(" "));
        }
        CompileOutcome::Failed { status } => println!("compilation failed with status {status}"),
        CompileOutcome::Abandoned => println!("compilation abandoned"),
    }

    match cli.client_id {
        Some(id) => client.terminate_session(id)?,
        None => client.terminate_connection()?,
    }
    Ok(())
}
