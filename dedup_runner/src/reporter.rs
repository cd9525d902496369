use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{select, tick, Receiver};
use tracing::debug;

use crate::lifecycle::Lifecycle;
use crate::stats::{PipelineStats, StatsSnapshot};

/// One periodic throughput line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    pub delta_unique: u64,
    pub delta_duplicates: u64,
    pub unique_total: u64,
    pub total_read: u64,
    pub input_queue_waits: u64,
    pub output_queue_waits: u64,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Received {} unique numbers, {} duplicates. Unique total: {}, total read: {}",
            group_thousands(self.delta_unique),
            group_thousands(self.delta_duplicates),
            group_thousands(self.unique_total),
            group_thousands(self.total_read),
        )
    }
}

/// Turns cumulative counters into per-interval deltas. Never writes to the
/// counters; its only state is the previous snapshot.
pub struct Reporter {
    stats: Arc<PipelineStats>,
    last: StatsSnapshot,
}

impl Reporter {
    /// Deltas start from the counters as they are now, so a restarted server
    /// does not report the previous run's totals as new traffic.
    pub fn new(stats: Arc<PipelineStats>) -> Self {
        let last = stats.snapshot();
        Self { stats, last }
    }

    pub fn tick(&mut self) -> Report {
        let now = self.stats.snapshot();
        let report = Report {
            delta_unique: now.unique - self.last.unique,
            delta_duplicates: now.duplicates - self.last.duplicates,
            unique_total: now.unique,
            total_read: now.total_read(),
            input_queue_waits: now.input_queue_waits,
            output_queue_waits: now.output_queue_waits,
        };
        self.last = now;
        report
    }

    pub fn run(mut self, interval: Duration, shutdown: Receiver<()>, lifecycle: Arc<Lifecycle>) {
        let ticker = tick(interval);
        loop {
            select! {
                recv(ticker) -> _ => {
                    if !lifecycle.is_active() {
                        break;
                    }
                    let report = self.tick();
                    println!("{}", report);
                    debug!(
                        "queue waits: input={}, output={}",
                        report.input_queue_waits, report.output_queue_waits
                    );
                }
                recv(shutdown) -> _ => break,
            }
        }
        debug!("reporter exited");
    }
}

/// `1234567` -> `"1,234,567"`.
pub fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    grouped
}
