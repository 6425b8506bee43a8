use crate::market::types::PerfSnapshot;

pub const PERF_WINDOW_CAPACITY: usize = 2_048;
pub const PERF_EMIT_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Clone)]
struct RollingWindow {
    values: Box<[u32; PERF_WINDOW_CAPACITY]>,
    len: usize,
    cursor: usize,
}

impl Default for RollingWindow {
    fn default() -> Self {
        Self {
            values: Box::new([0; PERF_WINDOW_CAPACITY]),
            len: 0,
            cursor: 0,
        }
    }
}

impl RollingWindow {
    fn push(&mut self, value: u32) {
        self.values[self.cursor] = value;
        self.cursor = (self.cursor + 1) % PERF_WINDOW_CAPACITY;
        if self.len < PERF_WINDOW_CAPACITY {
            self.len += 1;
        }
    }

    fn percentiles(&self) -> (Option<u32>, Option<u32>, Option<u32>) {
        if self.len == 0 {
            return (None, None, None);
        }

        let mut sorted = self.values[..self.len].to_vec();
        sorted.sort_unstable();

        (
            percentile_from_sorted(&sorted, 50),
            percentile_from_sorted(&sorted, 95),
            percentile_from_sorted(&sorted, 99),
        )
    }
}

/// Flush cost and batch size distributions over the last [`PERF_WINDOW_CAPACITY`] flushes.
#[derive(Debug, Default)]
pub struct FlushTelemetry {
    apply_us: RollingWindow,
    batch_sizes: RollingWindow,
    ingest_count: u64,
    flush_count: u64,
}

impl FlushTelemetry {
    pub fn record_ingest(&mut self) {
        self.ingest_count = self.ingest_count.saturating_add(1);
    }

    pub fn record_flush(&mut self, apply_us: u32, batch_size: usize) {
        self.apply_us.push(apply_us);
        self.batch_sizes
            .push(batch_size.min(u32::MAX as usize) as u32);
        self.flush_count = self.flush_count.saturating_add(1);
    }

    pub fn flush_count(&self) -> u64 {
        self.flush_count
    }

    pub fn snapshot(&self, now_ms: i64) -> PerfSnapshot {
        let (apply_p50_us, apply_p95_us, apply_p99_us) = self.apply_us.percentiles();
        let (batch_p50, batch_p95, batch_p99) = self.batch_sizes.percentiles();

        PerfSnapshot {
            t: now_ms,
            apply_p50_us,
            apply_p95_us,
            apply_p99_us,
            batch_p50,
            batch_p95,
            batch_p99,
            ingest_count: self.ingest_count,
            flush_count: self.flush_count,
        }
    }
}

fn percentile_from_sorted(sorted_values: &[u32], percentile: usize) -> Option<u32> {
    if sorted_values.is_empty() {
        return None;
    }
    let max_index = sorted_values.len().saturating_sub(1);
    let index = max_index.saturating_mul(percentile).saturating_div(100);
    sorted_values.get(index).copied()
}
