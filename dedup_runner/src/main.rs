// dedup_runner/src/main.rs
use dedup_runner::{init_tracing, Server, ServerConfig};
use tracing::info;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing("info");

    let config = ServerConfig::from_env();
    info!(
        "starting dedup server on port {} (terminate command: {:?})",
        config.port, config.terminate_text
    );
    let server = Server::new(config)?;
    server.start()?;

    // The pipeline only stops when a client sends the terminate command.
    server.wait_stopped();
    let stats = server.stats();
    info!(
        "exiting: {} unique numbers, {} duplicates",
        stats.unique, stats.duplicates
    );
    Ok(())
}
