pub mod aggregator;
pub mod decoder;
pub mod ingest;
pub mod pipeline;
pub mod simulator;
pub mod telemetry;
pub mod transport;
pub mod types;
pub mod worker;

use std::time::{SystemTime, UNIX_EPOCH};

pub const MARKET_STATUS_EVENT: &str = "market_status";
pub const MARKET_FRAME_UPDATE_EVENT: &str = "market_frame_update";
pub const DECODE_WARNING_EVENT: &str = "decode_warning";
pub const MARKET_PERF_EVENT: &str = "market_perf";

pub fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}
