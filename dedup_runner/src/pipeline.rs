// dedup_runner/src/pipeline.rs
//! The two consumer stages behind the intake sockets.
//!
//! ```text
//! readers --(input queue)--> dedup processor --(output queue)--> log writer --> file
//! ```
//!
//! Each queue has a single consumer, so per-connection order survives both
//! hops. The dedup set lives inside the dedup processor and is never shared.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;

use crossbeam::channel::{select, Receiver, Sender, TrySendError};
use tracing::{debug, warn};

use crate::dedup_set::DedupSet;
use crate::error::{Result, ServerError};
use crate::lifecycle::Lifecycle;
use crate::stats::PipelineStats;
use crate::throttle::WarnThrottle;

/// Empty record pushed on the output queue to wake a parked log writer.
pub const FLUSH_SENTINEL: &str = "";

/// Matches the buffer size of a default `BufWriter`.
const LOG_BUFFER_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Enqueued without waiting.
    Queued,
    /// The queue was full; the producer blocked until space freed up.
    Waited,
    /// Shutdown began (or the consumer is gone) before the record fit.
    Abandoned,
}

/// Try-then-block enqueue. `on_wait` runs once, right before blocking, so the
/// caller can count backpressure events. A blocked producer is released when
/// `shutdown` disconnects.
pub fn submit<F: FnOnce()>(
    queue: &Sender<String>,
    record: String,
    shutdown: &Receiver<()>,
    on_wait: F,
) -> SubmitOutcome {
    match queue.try_send(record) {
        Ok(()) => SubmitOutcome::Queued,
        Err(TrySendError::Disconnected(_)) => SubmitOutcome::Abandoned,
        Err(TrySendError::Full(record)) => {
            on_wait();
            select! {
                send(queue, record) -> sent => match sent {
                    Ok(()) => SubmitOutcome::Waited,
                    Err(_) => SubmitOutcome::Abandoned,
                },
                recv(shutdown) -> _ => SubmitOutcome::Abandoned,
            }
        }
    }
}

/// Single consumer of the input queue and sole owner of the dedup set.
pub struct DedupProcessor {
    set: DedupSet,
    input: Receiver<String>,
    output: Sender<String>,
    shutdown: Receiver<()>,
    stats: Arc<PipelineStats>,
    lifecycle: Arc<Lifecycle>,
    errors: WarnThrottle,
}

impl DedupProcessor {
    pub fn new(
        set: DedupSet,
        input: Receiver<String>,
        output: Sender<String>,
        shutdown: Receiver<()>,
        stats: Arc<PipelineStats>,
        lifecycle: Arc<Lifecycle>,
    ) -> Self {
        Self {
            set,
            input,
            output,
            shutdown,
            stats,
            lifecycle,
            errors: WarnThrottle::new("dedup"),
        }
    }

    pub fn run(mut self) {
        while self.lifecycle.is_active() {
            let record = select! {
                recv(self.input) -> msg => match msg {
                    Ok(record) => record,
                    Err(_) => break,
                },
                recv(self.shutdown) -> _ => break,
            };
            if let Err(e) = self.process(record) {
                self.errors
                    .warn(format_args!("error while processing number: {}", e));
            }
        }
        debug!("dedup processor exited");
    }

    fn process(&mut self, record: String) -> Result<()> {
        let value: u64 = match record.parse() {
            Ok(value) => value,
            Err(source) => return Err(ServerError::Malformed { record, source }),
        };
        if !self.set.insert(value)? {
            self.stats.record_duplicate();
            return Ok(());
        }
        // Counted only once handed off, so a counted value is bound for the log.
        let stats = &self.stats;
        match submit(&self.output, record, &self.shutdown, || stats.record_output_wait()) {
            SubmitOutcome::Abandoned => debug!("dropping unique value {} at shutdown", value),
            SubmitOutcome::Queued | SubmitOutcome::Waited => {
                self.stats.record_unique();
            }
        }
        Ok(())
    }
}

/// Single consumer of the output queue; owns the numbers log for one run.
pub struct LogWriter {
    out: BufWriter<File>,
    output: Receiver<String>,
    lifecycle: Arc<Lifecycle>,
    done: Sender<()>,
    errors: WarnThrottle,
}

impl LogWriter {
    pub fn new(
        file: File,
        output: Receiver<String>,
        lifecycle: Arc<Lifecycle>,
        done: Sender<()>,
    ) -> Self {
        Self {
            out: BufWriter::with_capacity(LOG_BUFFER_BYTES, file),
            output,
            lifecycle,
            done,
            errors: WarnThrottle::new("log-writer"),
        }
    }

    /// Consumes the output queue until the lifecycle leaves its active
    /// states, writes whatever was already queued at that point, then
    /// flushes, closes the file and signals `done`, in that order.
    pub fn run(mut self) {
        while self.lifecycle.is_active() {
            match self.step() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    self.errors
                        .warn(format_args!("error while writing unique numbers to log: {}", e));
                }
            }
        }
        let drained = self.drain();
        if drained > 0 {
            debug!("wrote {} queued numbers during shutdown", drained);
        }

        let LogWriter { mut out, done, .. } = self;
        if let Err(e) = out.flush() {
            warn!("error while flushing numbers log: {}", e);
        }
        match out.into_inner() {
            Ok(file) => drop(file),
            Err(e) => warn!("error while closing numbers log: {}", e.error()),
        }
        let _ = done.send(());
        debug!("log writer exited");
    }

    fn drain(&mut self) -> usize {
        let mut written = 0;
        while let Ok(record) = self.output.try_recv() {
            if record == FLUSH_SENTINEL {
                continue;
            }
            match self.write_record(&record) {
                Ok(()) => written += 1,
                Err(e) => {
                    self.errors
                        .warn(format_args!("error while draining numbers to log: {}", e));
                }
            }
        }
        written
    }

    fn write_record(&mut self, record: &str) -> std::io::Result<()> {
        self.out.write_all(record.as_bytes())?;
        self.out.write_all(b"\n")
    }

    /// Returns `false` once the queue has no senders left.
    fn step(&mut self) -> std::io::Result<bool> {
        if self.output.is_empty() {
            self.out.flush()?;
        }
        let record = match self.output.recv() {
            Ok(record) => record,
            Err(_) => return Ok(false),
        };
        if record == FLUSH_SENTINEL {
            return Ok(true);
        }
        self.write_record(&record)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleState;
    use crossbeam::channel::bounded;
    use std::thread;
    use std::time::Duration;

    fn active_lifecycle() -> Arc<Lifecycle> {
        let lifecycle = Arc::new(Lifecycle::new());
        lifecycle.transition(LifecycleState::Stopped, LifecycleState::Starting);
        lifecycle
    }

    #[test]
    fn submit_counts_wait_only_when_full() {
        let (tx, rx) = bounded::<String>(1);
        let (_shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let mut waits = 0;
        assert_eq!(
            submit(&tx, "a".into(), &shutdown_rx, || waits += 1),
            SubmitOutcome::Queued
        );
        assert_eq!(waits, 0);

        let consumer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let first = rx.recv().unwrap();
            let second = rx.recv().unwrap();
            (first, second)
        });
        assert_eq!(
            submit(&tx, "b".into(), &shutdown_rx, || waits += 1),
            SubmitOutcome::Waited
        );
        assert_eq!(waits, 1);
        assert_eq!(consumer.join().unwrap(), ("a".to_string(), "b".to_string()));
    }

    #[test]
    fn submit_is_released_by_shutdown() {
        let (tx, _rx) = bounded::<String>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        tx.send("full".into()).unwrap();

        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            drop(shutdown_tx);
        });
        assert_eq!(
            submit(&tx, "late".into(), &shutdown_rx, || {}),
            SubmitOutcome::Abandoned
        );
        stopper.join().unwrap();
    }

    #[test]
    fn dedup_forwards_first_sighting_only() {
        let (in_tx, in_rx) = bounded::<String>(16);
        let (out_tx, out_rx) = bounded::<String>(16);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let stats = Arc::new(PipelineStats::new());
        let processor = DedupProcessor::new(
            DedupSet::for_digits(9),
            in_rx,
            out_tx,
            shutdown_rx,
            stats.clone(),
            active_lifecycle(),
        );
        let handle = thread::spawn(move || processor.run());

        for record in ["123456789", "123456789", "000000001", "not-a-num", "123456789"] {
            in_tx.send(record.to_string()).unwrap();
        }
        assert_eq!(out_rx.recv_timeout(Duration::from_secs(5)).unwrap(), "123456789");
        assert_eq!(out_rx.recv_timeout(Duration::from_secs(5)).unwrap(), "000000001");

        // input disconnect ends the loop once everything queued was consumed
        drop(in_tx);
        handle.join().unwrap();
        drop(shutdown_tx);

        assert_eq!(stats.unique(), 2);
        assert_eq!(stats.duplicates(), 2);
        assert!(out_rx.try_recv().is_err());
    }

    #[test]
    fn dedup_survives_out_of_domain_values() {
        let (in_tx, in_rx) = bounded::<String>(4);
        let (out_tx, out_rx) = bounded::<String>(4);
        let (_shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let stats = Arc::new(PipelineStats::new());
        let processor = DedupProcessor::new(
            DedupSet::for_digits(2),
            in_rx,
            out_tx,
            shutdown_rx,
            stats.clone(),
            active_lifecycle(),
        );
        let handle = thread::spawn(move || processor.run());

        in_tx.send("100".into()).unwrap();
        in_tx.send("42".into()).unwrap();
        drop(in_tx);
        handle.join().unwrap();

        assert_eq!(out_rx.try_recv().unwrap(), "42");
        assert_eq!(stats.unique(), 1);
    }

    #[test]
    fn unique_value_abandoned_at_shutdown_is_not_counted() {
        let (_in_tx, in_rx) = bounded::<String>(1);
        let (out_tx, _out_rx) = bounded::<String>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        out_tx.send("000000001".into()).unwrap();
        let stats = Arc::new(PipelineStats::new());
        let mut processor = DedupProcessor::new(
            DedupSet::for_digits(9),
            in_rx,
            out_tx,
            shutdown_rx,
            stats.clone(),
            active_lifecycle(),
        );
        drop(shutdown_tx);

        processor.process("000000005".into()).unwrap();
        assert_eq!(stats.unique(), 0);
        assert_eq!(stats.snapshot().output_queue_waits, 1);
        assert!(processor.set.contains(5).unwrap());
    }

    #[test]
    fn log_writer_drains_queued_records_at_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("numbers.log");
        let file = File::create(&path).unwrap();
        let lifecycle = active_lifecycle();
        let (out_tx, out_rx) = bounded::<String>(64);
        let (done_tx, done_rx) = bounded::<()>(1);

        let expected: Vec<String> = (0..50u64).map(|v| format!("{:09}", v)).collect();
        for record in &expected {
            out_tx.send(record.clone()).unwrap();
        }
        lifecycle.transition(LifecycleState::Starting, LifecycleState::Stopping);
        out_tx.send(FLUSH_SENTINEL.into()).unwrap();

        // started only after shutdown began, so every record goes through the drain
        let writer = LogWriter::new(file, out_rx, lifecycle, done_tx);
        let handle = thread::spawn(move || writer.run());
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines, expected);
        assert!(!contents.contains("\n\n"));
        assert!(out_tx.is_empty());
    }

    #[test]
    fn log_writer_skips_sentinel_and_signals_done() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("numbers.log");
        let file = File::create(&path).unwrap();
        let lifecycle = active_lifecycle();
        let (out_tx, out_rx) = bounded::<String>(16);
        let (done_tx, done_rx) = bounded::<()>(1);
        let writer = LogWriter::new(file, out_rx, lifecycle.clone(), done_tx);
        let handle = thread::spawn(move || writer.run());

        out_tx.send("000000007".into()).unwrap();
        out_tx.send(FLUSH_SENTINEL.into()).unwrap();
        out_tx.send("000000008".into()).unwrap();

        // idle flush makes the data visible before shutdown
        let mut contents = String::new();
        for _ in 0..100 {
            contents = std::fs::read_to_string(&path).unwrap();
            if contents.lines().count() == 2 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(contents, "000000007\n000000008\n");

        lifecycle.transition(LifecycleState::Starting, LifecycleState::Stopping);
        out_tx.send(FLUSH_SENTINEL.into()).unwrap();
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "000000007\n000000008\n");
    }
}
