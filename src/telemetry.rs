/// Telemetry events sent from the loader to the orchestrator for progress tracking
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    /// A file was skipped by the ledger check
    FileSkipped,
    /// Loader started working on a file
    FileStarted,
    /// Batch of rows was committed to the target table
    BatchLoaded { duration_ms: u64 },
    /// File finished loading; `rows` is what the successful attempt inserted
    FileCompleted { rows: u64 },
    /// File failed to load
    FileFailed,
}

/// Statistics aggregated from telemetry events
#[derive(Debug, Default, Clone)]
pub struct RunStats {
    pub files_skipped: usize,
    pub files_started: usize,
    pub files_completed: usize,
    pub files_failed: usize,
    pub rows_loaded: u64,
    pub batch_durations_ms: Vec<u64>,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update stats with a telemetry event
    pub fn update(&mut self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::FileSkipped => self.files_skipped += 1,
            TelemetryEvent::FileStarted => self.files_started += 1,
            TelemetryEvent::BatchLoaded { duration_ms } => {
                self.batch_durations_ms.push(*duration_ms);
            }
            // Batches of a failed or retried attempt never reach the row count
            TelemetryEvent::FileCompleted { rows } => {
                self.files_completed += 1;
                self.rows_loaded += rows;
            }
            TelemetryEvent::FileFailed => self.files_failed += 1,
        }
    }

    /// Calculate percentile from batch durations
    pub fn percentile(&self, p: f64) -> Option<u64> {
        if self.batch_durations_ms.is_empty() {
            return None;
        }

        let mut sorted = self.batch_durations_ms.clone();
        sorted.sort_unstable();

        let index = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        let index = index.saturating_sub(1).min(sorted.len() - 1);

        Some(sorted[index])
    }

    /// Get p50, p90, p99 percentiles
    pub fn get_percentiles(&self) -> (Option<u64>, Option<u64>, Option<u64>) {
        (
            self.percentile(50.0),
            self.percentile(90.0),
            self.percentile(99.0),
        )
    }
}
