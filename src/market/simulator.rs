use crate::market::now_unix_ms;
use crate::market::types::{Side, Tick, SIMULATION_PRICE_FLOOR};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};

const VOLATILITY: f64 = 0.001;
const TREND_SCALE: f64 = 0.0005;
const MIN_QUANTITY: f64 = 0.1;
const QUANTITY_SPAN: f64 = 0.5;

/// Bounded multiplicative random walk. The trend term is redrawn every step.
#[derive(Debug, Clone)]
pub struct SimulatedTickSource {
    rng: ChaCha8Rng,
    last_price: f64,
}

impl SimulatedTickSource {
    pub fn new(start_price: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            rng,
            last_price: start_price.max(SIMULATION_PRICE_FLOOR),
        }
    }

    pub fn last_price(&self) -> f64 {
        self.last_price
    }

    pub fn next_tick(&mut self, timestamp: i64) -> Tick {
        let trend = (self.rng.gen::<f64>() - 0.5) * TREND_SCALE;
        let noise = self.rng.gen::<f64>() - 0.5;
        let change = self.last_price * (VOLATILITY * noise + trend);

        self.last_price = (self.last_price + change).max(SIMULATION_PRICE_FLOOR);
        let quantity = self.rng.gen::<f64>() * QUANTITY_SPAN + MIN_QUANTITY;

        Tick {
            timestamp,
            price: self.last_price,
            quantity,
            side: Side::from_price_delta(change),
        }
    }
}

/// Emission timer around the source. `stop` drops the timer, so nothing fires afterwards.
#[derive(Debug)]
pub struct SimulatedFeed {
    source: SimulatedTickSource,
    period: Duration,
    ticker: Option<Interval>,
}

impl SimulatedFeed {
    pub fn new(source: SimulatedTickSource, period: Duration) -> Self {
        Self {
            source,
            period,
            ticker: None,
        }
    }

    pub fn start(&mut self) {
        if self.ticker.is_some() {
            return;
        }
        let mut ticker = tokio::time::interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.ticker = Some(ticker);
    }

    pub fn stop(&mut self) {
        self.ticker = None;
    }

    pub fn is_active(&self) -> bool {
        self.ticker.is_some()
    }

    /// Resolves on the next emission; pending forever while stopped.
    pub async fn next_tick(&mut self) -> Tick {
        match self.ticker.as_mut() {
            Some(ticker) => {
                ticker.tick().await;
                self.source.next_tick(now_unix_ms())
            }
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_sources_are_reproducible() {
        let mut first = SimulatedTickSource::new(50_000.0, Some(7));
        let mut second = SimulatedTickSource::new(50_000.0, Some(7));

        for step in 0..200 {
            assert_eq!(first.next_tick(step), second.next_tick(step));
        }
    }

    #[test]
    fn walk_respects_floor_quantity_range_and_side_rule() {
        let mut source = SimulatedTickSource::new(1_000.0, Some(11));
        let mut previous = source.last_price();

        for step in 0..5_000 {
            let tick = source.next_tick(step);
            assert!(tick.price >= SIMULATION_PRICE_FLOOR);
            assert!((MIN_QUANTITY..MIN_QUANTITY + QUANTITY_SPAN).contains(&tick.quantity));
            if tick.price > previous {
                assert_eq!(tick.side, Side::Buy);
            }
            if tick.price < previous {
                assert_eq!(tick.side, Side::Sell);
            }
            previous = tick.price;
        }
    }

    #[test]
    fn step_size_is_bounded_by_volatility_and_trend() {
        let mut source = SimulatedTickSource::new(50_000.0, Some(3));
        let bound = 0.5 * VOLATILITY + 0.5 * TREND_SCALE;

        for step in 0..1_000 {
            let before = source.last_price();
            let tick = source.next_tick(step);
            let relative = (tick.price - before).abs() / before;
            assert!(relative <= bound + 1e-12);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn emits_once_per_period_while_started() {
        let source = SimulatedTickSource::new(50_000.0, Some(1));
        let mut feed = SimulatedFeed::new(source, Duration::from_millis(200));
        feed.start();

        let started = Instant::now();
        for _ in 0..5 {
            let _ = feed.next_tick().await;
        }

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1_000));
        assert!(elapsed < Duration::from_millis(1_200));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_feed_never_emits() {
        let source = SimulatedTickSource::new(50_000.0, Some(1));
        let mut feed = SimulatedFeed::new(source, Duration::from_millis(200));
        feed.start();
        feed.stop();
        assert!(!feed.is_active());

        let outcome = tokio::time::timeout(Duration::from_secs(5), feed.next_tick()).await;
        assert!(outcome.is_err(), "a stopped feed must stay silent");
    }
}
