use crate::error::AppError;
use crate::market::decoder::{DecodeError, Decoder};
use crate::market::types::Tick;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub const DECODE_WORKER_THREAD_NAME: &str = "tick-decoder";

#[derive(Debug)]
pub struct DecodeJob {
    pub generation: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub struct DecodeOutcome {
    pub generation: u64,
    pub payload_len: usize,
    pub result: Result<Tick, DecodeError>,
}

pub type WorkerLauncher =
    fn(Decoder, mpsc::UnboundedSender<DecodeOutcome>) -> Result<DecodeWorker, AppError>;

pub struct DecodeWorker {
    jobs: Option<mpsc::UnboundedSender<DecodeJob>>,
    thread: Option<JoinHandle<()>>,
}

pub fn spawn_decode_worker(
    decoder: Decoder,
    outcomes: mpsc::UnboundedSender<DecodeOutcome>,
) -> Result<DecodeWorker, AppError> {
    let (jobs_tx, mut jobs_rx) = mpsc::unbounded_channel::<DecodeJob>();

    let thread = std::thread::Builder::new()
        .name(DECODE_WORKER_THREAD_NAME.to_string())
        .spawn(move || {
            while let Some(job) = jobs_rx.blocking_recv() {
                let outcome = DecodeOutcome {
                    generation: job.generation,
                    payload_len: job.payload.len(),
                    result: decoder(&job.payload),
                };
                if outcomes.send(outcome).is_err() {
                    break;
                }
            }
            debug!("decode worker drained");
        })
        .map_err(|error| AppError::WorkerUnavailable(error.to_string()))?;

    info!(thread = DECODE_WORKER_THREAD_NAME, "decode worker started");

    Ok(DecodeWorker {
        jobs: Some(jobs_tx),
        thread: Some(thread),
    })
}

impl DecodeWorker {
    pub fn submit(&self, job: DecodeJob) -> Result<(), AppError> {
        let Some(jobs) = self.jobs.as_ref() else {
            return Err(AppError::WorkerUnavailable(
                "decode worker already shut down".to_string(),
            ));
        };
        jobs.send(job).map_err(|_| {
            AppError::WorkerUnavailable("decode worker thread exited".to_string())
        })
    }

    /// Closes the job queue and joins the thread. Jobs already queued are still decoded.
    pub fn shutdown(mut self) {
        self.jobs.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("decode worker thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::decoder::{decode_market_data, ExchangeId, MarketDataFrame};
    use crate::market::types::Side;

    fn frame_bytes(timestamp: i64, price: f64) -> Vec<u8> {
        let tick = Tick {
            timestamp,
            price,
            quantity: 1.0,
            side: Side::Buy,
        };
        MarketDataFrame::from_tick(&tick, ExchangeId::Binance, 1)
            .to_bytes()
            .to_vec()
    }

    #[tokio::test]
    async fn returns_outcomes_in_submission_order() {
        let (outcomes_tx, mut outcomes_rx) = mpsc::unbounded_channel();
        let worker =
            spawn_decode_worker(decode_market_data, outcomes_tx).expect("worker should start");

        for step in 0..50 {
            worker
                .submit(DecodeJob {
                    generation: 3,
                    payload: frame_bytes(1_000 + step, 100.0 + step as f64),
                })
                .expect("job should be accepted");
        }

        for step in 0..50 {
            let outcome = outcomes_rx.recv().await.expect("outcome should arrive");
            assert_eq!(outcome.generation, 3);
            let tick = outcome.result.expect("frame should decode");
            assert_eq!(tick.timestamp, 1_000 + step);
        }

        worker.shutdown();
    }

    #[tokio::test]
    async fn reports_decode_failures_without_stopping() {
        let (outcomes_tx, mut outcomes_rx) = mpsc::unbounded_channel();
        let worker =
            spawn_decode_worker(decode_market_data, outcomes_tx).expect("worker should start");

        worker
            .submit(DecodeJob {
                generation: 1,
                payload: vec![1, 2, 3],
            })
            .expect("job should be accepted");
        worker
            .submit(DecodeJob {
                generation: 1,
                payload: frame_bytes(5_000, 42.0),
            })
            .expect("job should be accepted");

        let failed = outcomes_rx.recv().await.expect("failure outcome");
        assert_eq!(failed.payload_len, 3);
        assert!(failed.result.is_err());

        let decoded = outcomes_rx.recv().await.expect("success outcome");
        assert_eq!(decoded.result.expect("frame should decode").price, 42.0);

        worker.shutdown();
    }
}
