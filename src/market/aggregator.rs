use crate::market::types::{Candle, Tick, VolumeBar, BUCKET_SIZE_MS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Opened { bucket: i64 },
    Updated { bucket: i64 },
    /// The tick's bucket was behind the open bucket; it was folded into the open one.
    MergedLate { bucket: i64, tick_bucket: i64 },
}

pub fn bucket_of(timestamp_ms: i64) -> i64 {
    timestamp_ms.div_euclid(BUCKET_SIZE_MS)
}

/// Folds ticks into index-aligned candle and volume sequences.
///
/// Only the last candle/bar is ever mutated. When the window exceeds `max_buckets`
/// the oldest candle and bar are evicted together.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregator {
    candles: Vec<Candle>,
    volumes: Vec<VolumeBar>,
    max_buckets: usize,
}

impl Aggregator {
    pub fn new(max_buckets: usize) -> Self {
        Self {
            candles: Vec::new(),
            volumes: Vec::new(),
            max_buckets: max_buckets.max(1),
        }
    }

    pub fn apply(&mut self, tick: &Tick) -> ApplyOutcome {
        let tick_bucket = bucket_of(tick.timestamp);

        match (self.candles.last_mut(), self.volumes.last_mut()) {
            (Some(candle), Some(volume)) if tick_bucket <= candle.bucket => {
                candle.apply_price(tick.price);
                volume.apply_quantity(tick.quantity, tick.side);
                if tick_bucket == candle.bucket {
                    ApplyOutcome::Updated {
                        bucket: candle.bucket,
                    }
                } else {
                    ApplyOutcome::MergedLate {
                        bucket: candle.bucket,
                        tick_bucket,
                    }
                }
            }
            _ => {
                self.candles.push(Candle::from_price(tick_bucket, tick.price));
                self.volumes
                    .push(VolumeBar::from_quantity(tick_bucket, tick.quantity, tick.side));
                self.evict_overflow();
                ApplyOutcome::Opened {
                    bucket: tick_bucket,
                }
            }
        }
    }

    fn evict_overflow(&mut self) {
        if self.candles.len() > self.max_buckets {
            let overflow = self.candles.len() - self.max_buckets;
            self.candles.drain(0..overflow);
            self.volumes.drain(0..overflow);
        }
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn volumes(&self) -> &[VolumeBar] {
        &self.volumes
    }
}
