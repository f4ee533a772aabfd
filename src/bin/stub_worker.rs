//! Minimal worker speaking the readiness handshake, used by the integration tests.
//!
//! Arguments:
//!
//! * `--signal-port=<port>`: handshake port to connect to once ready
//! * `--grpc-port=<port>`: port accepting (and dropping) RPC connections
//! * `--no-signal`: never connect to the handshake port
//! * `--exit-immediately`: exit with code 3 before the handshake
//! * `--ignore-sigint`: keep running when interrupted
//! * `--crash`: abort right after the handshake
//!
//! Anything else, such as the capture log flag, is ignored.

use std::{
    error::Error,
    net::{Ipv4Addr, TcpListener, TcpStream},
};

use async_signal::{Signal, Signals};
use futures::StreamExt;

#[derive(Default)]
struct Args {
    signal_port: Option<u16>,
    grpc_port: Option<u16>,
    no_signal: bool,
    exit_immediately: bool,
    ignore_sigint: bool,
    crash: bool,
}

fn parse_args() -> Result<Args, Box<dyn Error>> {
    let mut args = Args::default();
    for arg in std::env::args().skip(1) {
        if let Some(port) = arg.strip_prefix("--signal-port=") {
            args.signal_port = Some(port.parse()?);
        } else if let Some(port) = arg.strip_prefix("--grpc-port=") {
            args.grpc_port = Some(port.parse()?);
        } else {
            match arg.as_str() {
                "--no-signal" => args.no_signal = true,
                "--exit-immediately" => args.exit_immediately = true,
                "--ignore-sigint" => args.ignore_sigint = true,
                "--crash" => args.crash = true,
                _ => {}
            }
        }
    }
    Ok(args)
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args()?;
    println!("stub worker {} starting", std::process::id());
    eprintln!("diagnostics go to stderr");

    if args.exit_immediately {
        eprintln!("giving up before the handshake");
        std::process::exit(3);
    }

    // Registered before the handshake so that an early interrupt is not fatal.
    let mut signals = Signals::new([Signal::Int])?;

    if let Some(port) = args.grpc_port {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))?;
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                drop(stream);
            }
        });
    }

    match args.signal_port {
        Some(port) if !args.no_signal => {
            drop(TcpStream::connect((Ipv4Addr::LOCALHOST, port))?);
            println!("ready");
        }
        _ => println!("not signalling readiness"),
    }

    if args.crash {
        eprintln!("Fatal crash: stub worker asked to crash");
        eprintln!("backtrace unavailable");
        std::process::abort();
    }

    futures::executor::block_on(async {
        while let Some(signal) = signals.next().await {
            signal?;
            println!("received SIGINT");
            if !args.ignore_sigint {
                break;
            }
            println!("ignoring it");
        }
        println!("stopping");
        Ok::<_, Box<dyn Error>>(())
    })
}
