//! Suggests new replicated values to one of the servers. No reply is sent;
//! keep an eye on the server output to see whether a suggestion was decided.
//! When master leases are in use, suggestions must go to the current master;
//! all other servers ignore them.
//!
//! With values on the command line each one is sent and the client exits;
//! without any, values are read interactively, one per line.

use std::io::{self, Write};
use std::net::UdpSocket;

use clap::Parser;
use text_io::read;

use paxos_register::configurations::ClusterConfig;
use paxos_register::message::{Message, ProposeValue};

#[derive(Parser, Debug)]
#[command(about = "Multi-Paxos replicated value client")]
struct Args {
    /// UID of the server to address.
    uid: String,

    /// Values to propose. When empty, values are read from standard input.
    values: Vec<String>,

    /// Name of the configuration file.
    #[arg(long, default_value = "Config")]
    config: String,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> paxos_register::Result<()> {
    let config = ClusterConfig::load(&args.config)?;
    let addr = config.socket_addr(&args.uid)?;
    let socket = UdpSocket::bind("0.0.0.0:0")?;

    if args.values.is_empty() {
        loop {
            print!("Enter the proposal: ");
            io::stdout().flush()?;
            let value: String = read!("{}\n");
            if value.is_empty() {
                continue;
            }
            propose(&socket, addr, value)?;
        }
    }

    for value in &args.values {
        propose(&socket, addr, value.clone())?;
    }
    Ok(())
}

fn propose(
    socket: &UdpSocket,
    addr: std::net::SocketAddrV4,
    value: String,
) -> paxos_register::Result<()> {
    let message = Message::Propose(ProposeValue { value });
    socket.send_to(message.encode().as_bytes(), addr)?;
    Ok(())
}
