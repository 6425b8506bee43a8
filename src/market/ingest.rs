use crate::market::aggregator::{Aggregator, ApplyOutcome};
use crate::market::types::{MarketFrame, Tick};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

/// Arrival-ordered queue between the producers and the aggregator. Never drops on its own.
#[derive(Debug, Default)]
pub struct IngestionBuffer {
    pending: Vec<Tick>,
}

impl IngestionBuffer {
    pub fn push(&mut self, tick: Tick) {
        self.pending.push(tick);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drops everything queued without flushing it.
    pub fn discard(&mut self) -> usize {
        let discarded = self.pending.len();
        self.pending.clear();
        discarded
    }

    pub fn drain(&mut self) -> Vec<Tick> {
        std::mem::take(&mut self.pending)
    }
}

/// Newest-first log of the last `cap` ticks.
#[derive(Debug)]
pub struct RecentEvents {
    events: VecDeque<Tick>,
    cap: usize,
}

impl RecentEvents {
    pub fn new(cap: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(cap + 1),
            cap,
        }
    }

    pub fn record_batch(&mut self, batch: &[Tick]) {
        for tick in batch {
            self.events.push_front(*tick);
        }
        self.events.truncate(self.cap);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn to_vec(&self) -> Vec<Tick> {
        self.events.iter().copied().collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub batch_size: usize,
    pub opened_buckets: usize,
    pub merged_late: usize,
    pub apply_us: u32,
}

/// The single writer of the candle, volume and recent-event sequences.
#[derive(Debug)]
pub struct MarketState {
    pub pending: IngestionBuffer,
    aggregator: Aggregator,
    recent: RecentEvents,
}

impl MarketState {
    pub fn new(max_buckets: usize, recent_events_cap: usize) -> Self {
        Self {
            pending: IngestionBuffer::default(),
            aggregator: Aggregator::new(max_buckets),
            recent: RecentEvents::new(recent_events_cap),
        }
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn recent(&self) -> &RecentEvents {
        &self.recent
    }
}

/// Drains the whole queue into the aggregator and recent log as one step.
///
/// Returns `None` when nothing was queued so empty flushes never notify.
pub fn drain_market_frame(state: &mut MarketState) -> Option<(MarketFrame, FlushStats)> {
    if state.pending.is_empty() {
        return None;
    }

    let started_at = Instant::now();
    let batch = state.pending.drain();
    let mut stats = FlushStats {
        batch_size: batch.len(),
        ..FlushStats::default()
    };

    for tick in &batch {
        match state.aggregator.apply(tick) {
            ApplyOutcome::Opened { .. } => stats.opened_buckets += 1,
            ApplyOutcome::MergedLate { .. } => stats.merged_late += 1,
            ApplyOutcome::Updated { .. } => {}
        }
    }
    state.recent.record_batch(&batch);
    stats.apply_us = started_at.elapsed().as_micros().min(u32::MAX as u128) as u32;

    let frame = MarketFrame {
        candles: Arc::new(state.aggregator.candles().to_vec()),
        volumes: Arc::new(state.aggregator.volumes().to_vec()),
        recent: Arc::new(state.recent.to_vec()),
        batch_size: stats.batch_size,
    };

    Some((frame, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::Side;

    fn tick(timestamp: i64, price: f64) -> Tick {
        Tick {
            timestamp,
            price,
            quantity: 0.5,
            side: Side::Buy,
        }
    }

    #[test]
    fn empty_queue_produces_no_frame() {
        let mut state = MarketState::new(100, 20);
        assert!(drain_market_frame(&mut state).is_none());
    }

    #[test]
    fn burst_is_delivered_whole_and_in_order() {
        let mut state = MarketState::new(100, 20);
        for step in 0..500 {
            state.pending.push(tick(10_000 + step, 100.0 + step as f64));
        }

        let (frame, stats) = drain_market_frame(&mut state).expect("burst should flush");

        assert_eq!(stats.batch_size, 500);
        assert_eq!(frame.batch_size, 500);
        assert!(state.pending.is_empty());
        assert_eq!(frame.candles.len(), 1);
        assert_eq!(frame.candles[0].open, 100.0);
        assert_eq!(frame.candles[0].close, 599.0);
        assert!((frame.volumes[0].volume - 250.0).abs() < 1e-9);
        assert!(drain_market_frame(&mut state).is_none());
    }

    #[test]
    fn recent_events_are_newest_first_and_capped() {
        let mut state = MarketState::new(100, 20);
        for step in 0..15 {
            state.pending.push(tick(step, 100.0));
        }
        let _ = drain_market_frame(&mut state);
        for step in 15..40 {
            state.pending.push(tick(step, 100.0));
        }

        let (frame, _) = drain_market_frame(&mut state).expect("second batch flushes");

        assert_eq!(frame.recent.len(), 20);
        let timestamps: Vec<i64> = frame.recent.iter().map(|t| t.timestamp).collect();
        let expected: Vec<i64> = (20..40).rev().collect();
        assert_eq!(timestamps, expected);
    }

    #[test]
    fn recent_log_never_exceeds_cap_across_batches() {
        let mut recent = RecentEvents::new(25);
        for batch_len in [0, 1, 7, 30, 2, 60] {
            let batch: Vec<Tick> = (0..batch_len).map(|i| tick(i, 1.0)).collect();
            recent.record_batch(&batch);
            assert!(recent.len() <= 25);
        }
        assert_eq!(recent.len(), 25);
    }

    #[test]
    fn discard_drops_pending_without_touching_sequences() {
        let mut state = MarketState::new(100, 20);
        state.pending.push(tick(1_000, 100.0));
        let _ = drain_market_frame(&mut state);

        state.pending.push(tick(2_000, 200.0));
        state.pending.push(tick(2_100, 210.0));
        assert_eq!(state.pending.discard(), 2);

        assert!(drain_market_frame(&mut state).is_none());
        assert_eq!(state.aggregator().candles().len(), 1);
        assert_eq!(state.recent().len(), 1);
    }
}
