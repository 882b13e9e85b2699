//! Starts one replicated-value peer, which runs its event loop until killed.
//!
//! You can run this binary as follows
//!     RUST_LOG=paxos_register=info cargo run --bin server -- A
//! where `A` is one of the peer uids in the configuration file.

use clap::Parser;
use log::info;

use paxos_register::configurations::ClusterConfig;
use paxos_register::server::Server;

#[derive(Parser, Debug)]
#[command(about = "Multi-Paxos replicated value server")]
struct Args {
    /// UID of this peer. Must be one of the uids in the configuration file.
    uid: String,

    /// Use a dedicated master lease. If one peer specifies this flag, all
    /// must.
    #[arg(long)]
    master: bool,

    /// Name of the configuration file.
    #[arg(long, default_value = "Config")]
    config: String,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    info!("{args:?}");

    if let Err(e) = run(&args) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> paxos_register::Result<()> {
    let config = ClusterConfig::load(&args.config)?;
    let mut server = Server::new(&args.uid, &config, args.master)?;
    server.run()
}
