//! Load-generating client for frame-echo.
//!
//! Opens `-n` concurrent connections. Each one checks the greeting, sends
//! a fixed script of frames split across several writes, and verifies
//! the transformed reply.

#[path = "../client_script.rs"]
mod client_script;

use clap::Parser;
use client_script::{EXPECTED, SCRIPT};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "frame-client")]
#[command(about = "Concurrent test client for frame-echo", long_about = None)]
struct Args {
    /// Server IP address
    ip: String,

    /// Server port
    port: u16,

    /// Number of concurrent connections
    #[arg(short = 'n', default_value_t = 1)]
    num_concurrent: usize,

    /// Log level
    #[arg(long, default_value = "info", value_parser = ["info", "error"])]
    level: String,
}

/// Per-connection failure.
#[derive(Debug)]
enum ClientError {
    Io(io::Error),
    BadGreeting(u8),
    Mismatch(Vec<u8>),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Io(e) => write!(f, "I/O error: {e}"),
            ClientError::BadGreeting(b) => write!(f, "expected '*' greeting, got {b:#04x}"),
            ClientError::Mismatch(got) => {
                write!(f, "unexpected reply {:?}", String::from_utf8_lossy(got))
            }
        }
    }
}

impl std::error::Error for ClientError {}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        ClientError::Io(e)
    }
}

fn run_worker(name: &str, addr: &str) -> Result<(), ClientError> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;

    let mut greeting = [0u8; 1];
    stream.read_exact(&mut greeting)?;
    if greeting[0] != b'*' {
        return Err(ClientError::BadGreeting(greeting[0]));
    }
    info!(conn = name, "connected");

    let mut reader = stream.try_clone()?;
    let receiver = thread::spawn(move || -> io::Result<Vec<u8>> {
        let mut received = vec![0u8; EXPECTED.len()];
        reader.read_exact(&mut received)?;
        Ok(received)
    });

    for (chunk, pause) in SCRIPT {
        info!(conn = name, sending = %String::from_utf8_lossy(chunk), "send");
        stream.write_all(chunk)?;
        thread::sleep(*pause);
    }

    let received = receiver
        .join()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "receiver panicked"))??;
    if received != EXPECTED {
        return Err(ClientError::Mismatch(received));
    }

    info!(conn = name, received = %String::from_utf8_lossy(&received), "disconnect from remote");
    Ok(())
}

fn main() {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let addr = format!("{}:{}", args.ip, args.port);
    let start = Instant::now();

    let workers: Vec<_> = (0..args.num_concurrent)
        .map(|i| {
            let addr = addr.clone();
            thread::spawn(move || {
                let name = format!("conn{i}");
                if let Err(e) = run_worker(&name, &addr) {
                    error!(conn = %name, error = %e, "worker failed");
                    return false;
                }
                true
            })
        })
        .collect();

    let failed = workers
        .into_iter()
        .map(|w| w.join())
        .filter(|r| !matches!(r, Ok(true)))
        .count();

    if failed > 0 {
        error!(connections = args.num_concurrent, failed, "some workers failed");
    }
    // Printed regardless of --level
    println!("total running time: {:.2}s", start.elapsed().as_secs_f64());

    if failed > 0 {
        std::process::exit(1);
    }
}
