use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative pipeline counters.
///
/// Reader threads bump `input_queue_waits`; the dedup processor is the only
/// writer of the other three. The reporter only loads.
#[derive(Debug, Default)]
pub struct PipelineStats {
    unique: AtomicU64,
    duplicates: AtomicU64,
    input_queue_waits: AtomicU64,
    output_queue_waits: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub unique: u64,
    pub duplicates: u64,
    pub input_queue_waits: u64,
    pub output_queue_waits: u64,
}

impl StatsSnapshot {
    pub fn total_read(&self) -> u64 {
        self.unique + self.duplicates
    }
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_unique(&self) -> u64 {
        self.unique.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_duplicate(&self) -> u64 {
        self.duplicates.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_input_wait(&self) {
        self.input_queue_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_output_wait(&self) {
        self.output_queue_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unique(&self) -> u64 {
        self.unique.load(Ordering::Relaxed)
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            unique: self.unique.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            input_queue_waits: self.input_queue_waits.load(Ordering::Relaxed),
            output_queue_waits: self.output_queue_waits.load(Ordering::Relaxed),
        }
    }
}
