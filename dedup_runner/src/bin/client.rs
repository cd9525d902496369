// dedup_runner/src/bin/client.rs
//! Load generator: several concurrent connections sending random numbers,
//! optionally followed by the terminate command.

use std::env;
use std::io::{BufWriter, Write};
use std::net::TcpStream;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, RecvTimeoutError};
use dedup_runner::config::MAX_DIGITS;
use dedup_runner::init_tracing;
use rand::Rng;
use tracing::{debug, info, warn};

struct ClientConfig {
    target: String,
    connections: usize,
    numbers: usize,
    delay: Duration,
    digits: u32,
    deadline: Duration,
    terminate: bool,
    terminate_text: String,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|value| {
            let lowered = value.trim().to_ascii_lowercase();
            matches!(lowered.as_str(), "1" | "true" | "yes" | "on")
        })
        .unwrap_or(default)
}

fn load_client_config() -> ClientConfig {
    ClientConfig {
        target: env::var("CLIENT_TARGET").unwrap_or_else(|_| "127.0.0.1:4000".to_string()),
        connections: env_or("CLIENT_CONNECTIONS", 7),
        numbers: env_or("CLIENT_NUMBERS", 30),
        delay: Duration::from_millis(env_or("CLIENT_DELAY_MS", 1_000)),
        digits: env_or("CLIENT_DIGITS", MAX_DIGITS).clamp(1, MAX_DIGITS),
        deadline: Duration::from_secs(env_or("CLIENT_DEADLINE_SECS", 35)),
        terminate: env_flag("CLIENT_TERMINATE", true),
        terminate_text: env::var("DEDUP_TERMINATE_TEXT").unwrap_or_else(|_| "terminate".to_string()),
    }
}

fn send_numbers(id: usize, config: &ClientConfig) -> std::io::Result<usize> {
    let stream = TcpStream::connect(&config.target)?;
    stream.set_nodelay(true)?;
    let mut out = BufWriter::new(stream);
    let mut rng = rand::thread_rng();
    let upper = 10u64.pow(config.digits);
    let width = config.digits as usize;

    for sent in 0..config.numbers {
        let value = rng.gen_range(0..upper);
        // A rejected or dropped connection shows up as a write error.
        if let Err(e) = writeln!(out, "{:0width$}", value, width = width).and_then(|_| out.flush()) {
            debug!("client {} stopped after {} numbers: {}", id, sent, e);
            return Ok(sent);
        }
        thread::sleep(config.delay);
    }
    Ok(config.numbers)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing("info");
    let config = Arc::new(load_client_config());
    info!(
        "client starting {} connections to {}, {} numbers each",
        config.connections, config.target, config.numbers
    );

    let barrier = Arc::new(Barrier::new(config.connections));
    let (done_tx, done_rx) = bounded::<(usize, std::io::Result<usize>)>(config.connections);
    for id in 0..config.connections {
        let barrier = barrier.clone();
        let config = config.clone();
        let done_tx = done_tx.clone();
        thread::Builder::new()
            .name(format!("client-{}", id))
            .spawn(move || {
                barrier.wait();
                let _ = done_tx.send((id, send_numbers(id, &config)));
            })?;
    }
    drop(done_tx);

    let started = Instant::now();
    let mut finished = 0;
    while finished < config.connections {
        let remaining = config.deadline.saturating_sub(started.elapsed());
        match done_rx.recv_timeout(remaining) {
            Ok((id, Ok(sent))) => {
                info!("client {} done, sent {} numbers", id, sent);
                finished += 1;
            }
            Ok((id, Err(e))) => {
                warn!("client {} failed: {}", id, e);
                finished += 1;
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("deadline reached with {} clients still running", config.connections - finished);
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if config.terminate {
        info!("sending terminate command");
        let mut stream = TcpStream::connect(&config.target)?;
        writeln!(stream, "{}", config.terminate_text)?;
        stream.flush()?;
    }
    Ok(())
}
