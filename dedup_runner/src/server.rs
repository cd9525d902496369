// dedup_runner/src/server.rs
//! Lifecycle controller tying the intake, dedup and logging stages together.

use std::fs::File;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::acceptor::Acceptor;
use crate::config::ServerConfig;
use crate::dedup_set::DedupSet;
use crate::error::{Result, ServerError};
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::pipeline::{submit, DedupProcessor, LogWriter, SubmitOutcome, FLUSH_SENTINEL};
use crate::registry::ConnectionRegistry;
use crate::reporter::Reporter;
use crate::sink::{LineRouter, RecordSink};
use crate::stats::{PipelineStats, StatsSnapshot};

/// Handles owned by one start..stop cycle.
struct PipelineRun {
    output_tx: Sender<String>,
    // Never sent on. Dropping it wakes every `select!` watching shutdown.
    shutdown_tx: Sender<()>,
    log_done: Receiver<()>,
    log_writer: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

struct ServerShared {
    config: ServerConfig,
    lifecycle: Arc<Lifecycle>,
    stats: Arc<PipelineStats>,
    registry: Arc<ConnectionRegistry>,
    acceptor: Acceptor,
    run: Mutex<Option<PipelineRun>>,
}

/// The intake server. Dropping it stops the pipeline.
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let lifecycle = Arc::new(Lifecycle::new());
        let registry = Arc::new(ConnectionRegistry::new(
            lifecycle.clone(),
            config.max_connections,
        ));
        let acceptor = Acceptor::new(config.listen_addr(), lifecycle.clone(), registry.clone());
        Ok(Self {
            shared: Arc::new(ServerShared {
                config,
                lifecycle,
                stats: Arc::new(PipelineStats::new()),
                registry,
                acceptor,
                run: Mutex::new(None),
            }),
        })
    }

    /// Starts the pipeline. A no-op unless the server is fully stopped.
    /// A `stop` issued while a start is in progress is ignored.
    ///
    /// Fails only when the numbers log cannot be created or the listener
    /// cannot be bound; the server is back in `Stopped` in both cases.
    pub fn start(&self) -> Result<()> {
        ServerShared::start(&self.shared)
    }

    /// Stops the pipeline and waits (bounded) for the log to be closed.
    /// A no-op unless the server is running.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Blocks until the server reaches `Stopped`, e.g. after a client sent
    /// the terminate command.
    pub fn wait_stopped(&self) {
        self.shared.lifecycle.wait_stopped(None);
    }

    pub fn wait_stopped_timeout(&self, timeout: Duration) -> bool {
        self.shared.lifecycle.wait_stopped(Some(timeout))
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.lifecycle.state()
    }

    pub fn is_running(&self) -> bool {
        self.shared.lifecycle.is_running()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.acceptor.local_addr()
    }

    pub fn active_connections(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shared.stop();
    }
}

impl ServerShared {
    fn start(this: &Arc<Self>) -> Result<()> {
        if !this
            .lifecycle
            .transition(LifecycleState::Stopped, LifecycleState::Starting)
        {
            debug!("start ignored, server state is {:?}", this.lifecycle.state());
            return Ok(());
        }

        let (run, input_tx, shutdown_rx) = match this.launch_pipeline() {
            Ok(launched) => launched,
            Err(e) => {
                error!("failed to start pipeline: {}", e);
                this.lifecycle
                    .transition(LifecycleState::Starting, LifecycleState::Stopped);
                return Err(e);
            }
        };
        *this.run.lock() = Some(run);

        let sink = Arc::new(PipelineSink {
            input_tx,
            shutdown_rx,
            stats: this.stats.clone(),
            server: Arc::downgrade(this),
        });
        let router = LineRouter::new(
            sink,
            this.config.digits,
            this.config.terminate_text.as_str(),
        );
        // Bound while still `Starting`: a concurrent `stop` cannot win until
        // the listener is in place, and the loop only accepts once `Running`.
        let addr = match this.acceptor.start(router) {
            Ok(addr) => addr,
            Err(e) => {
                error!("failed to start acceptor: {}", e);
                this.lifecycle
                    .transition(LifecycleState::Starting, LifecycleState::Stopping);
                this.teardown();
                return Err(e);
            }
        };
        this.lifecycle
            .transition(LifecycleState::Starting, LifecycleState::Running);
        info!(
            "dedup server started on {} (digits={}, max_connections={}, log={})",
            addr,
            this.config.digits,
            this.config.max_connections,
            this.config.log_path.display()
        );
        Ok(())
    }

    /// Opens the log and launches dedup, reporter and writer threads, in that
    /// order. On error every thread already launched exits on its own once the
    /// local channel ends are dropped.
    fn launch_pipeline(&self) -> Result<(PipelineRun, Sender<String>, Receiver<()>)> {
        let file = File::create(&self.config.log_path).map_err(|source| ServerError::LogFile {
            path: self.config.log_path.clone(),
            source,
        })?;

        let capacity = self.config.queue_capacity;
        let (input_tx, input_rx) = bounded::<String>(capacity);
        let (output_tx, output_rx) = bounded::<String>(capacity);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let (done_tx, done_rx) = bounded::<()>(1);

        let processor = DedupProcessor::new(
            DedupSet::for_digits(self.config.digits),
            input_rx,
            output_tx.clone(),
            shutdown_rx.clone(),
            self.stats.clone(),
            self.lifecycle.clone(),
        );
        let dedup = thread::Builder::new()
            .name("dedup-processor".to_string())
            .spawn(move || processor.run())?;
        debug!("started dedup processor");

        let reporter = Reporter::new(self.stats.clone());
        let interval = self.config.report_interval;
        let reporter_shutdown = shutdown_rx.clone();
        let reporter_lifecycle = self.lifecycle.clone();
        let reporter = thread::Builder::new()
            .name("dedup-reporter".to_string())
            .spawn(move || reporter.run(interval, reporter_shutdown, reporter_lifecycle))?;
        debug!("started reporter every {:?}", interval);

        let writer = LogWriter::new(file, output_rx, self.lifecycle.clone(), done_tx);
        let log_writer = thread::Builder::new()
            .name("dedup-log-writer".to_string())
            .spawn(move || writer.run())?;
        debug!("started log writer on {}", self.config.log_path.display());

        let run = PipelineRun {
            output_tx,
            shutdown_tx,
            log_done: done_rx,
            log_writer,
            workers: vec![dedup, reporter],
        };
        Ok((run, input_tx, shutdown_rx))
    }

    fn stop(&self) {
        if !self
            .lifecycle
            .transition(LifecycleState::Running, LifecycleState::Stopping)
        {
            debug!("stop ignored, server state is {:?}", self.lifecycle.state());
            return;
        }
        info!("stopping dedup server");
        self.teardown();
    }

    /// Runs with the lifecycle in `Stopping`; leaves it in `Stopped`.
    /// Numbers still on the input queue are abandoned; whatever already
    /// reached the output queue is written before the log is closed.
    fn teardown(&self) {
        self.acceptor.stop();

        let run = self.run.lock().take();
        if let Some(run) = run {
            let PipelineRun {
                output_tx,
                shutdown_tx,
                log_done,
                log_writer,
                workers,
            } = run;

            drop(shutdown_tx);
            // A full queue means the writer is not parked and will notice the
            // state change after its current record.
            let _ = output_tx.try_send(FLUSH_SENTINEL.to_string());
            drop(output_tx);

            match log_done.recv_timeout(self.config.shutdown_timeout) {
                Ok(()) => {
                    if log_writer.join().is_err() {
                        warn!("log writer panicked");
                    }
                }
                Err(RecvTimeoutError::Timeout) => warn!(
                    "log writer did not finish within {:?}, numbers log may be incomplete",
                    self.config.shutdown_timeout
                ),
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("log writer exited without closing the numbers log");
                    let _ = log_writer.join();
                }
            }

            for worker in workers {
                if worker.join().is_err() {
                    warn!("pipeline worker panicked");
                }
            }
        }

        self.lifecycle
            .transition(LifecycleState::Stopping, LifecycleState::Stopped);
        let stats = self.stats.snapshot();
        info!(
            "dedup server stopped (unique={}, duplicates={})",
            stats.unique, stats.duplicates
        );
    }
}

/// The connection side's handle on a running pipeline.
struct PipelineSink {
    input_tx: Sender<String>,
    shutdown_rx: Receiver<()>,
    stats: Arc<PipelineStats>,
    server: Weak<ServerShared>,
}

impl RecordSink for PipelineSink {
    fn submit(&self, record: String) {
        let stats = &self.stats;
        let outcome = submit(&self.input_tx, record, &self.shutdown_rx, || {
            stats.record_input_wait()
        });
        if outcome == SubmitOutcome::Abandoned {
            debug!("input queue closed, dropping record");
        }
    }

    fn terminate(&self) {
        if let Some(server) = self.server.upgrade() {
            server.stop();
        }
    }
}
