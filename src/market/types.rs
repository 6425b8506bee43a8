use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:8080";
pub const BUCKET_SIZE_MS: i64 = 1_000;
pub const DEFAULT_INITIAL_MODE: Mode = Mode::Live;
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 32;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 3_000;
pub const DEFAULT_SIMULATION_INTERVAL_MS: u64 = 200;
pub const DEFAULT_RECENT_EVENTS_CAP: usize = 20;
pub const DEFAULT_MAX_BUCKETS: usize = 5_000;
pub const DEFAULT_SIMULATION_START_PRICE: f64 = 50_000.0;
pub const DEFAULT_PERF_TELEMETRY: bool = false;
pub const SIMULATION_PRICE_FLOOR: f64 = 1_000.0;
pub const MIN_FLUSH_INTERVAL_MS: u64 = 8;
pub const MAX_FLUSH_INTERVAL_MS: u64 = 1_000;
pub const MIN_RETRY_DELAY_MS: u64 = 100;
pub const MAX_RETRY_DELAY_MS: u64 = 60_000;
pub const MIN_SIMULATION_INTERVAL_MS: u64 = 10;
pub const MAX_SIMULATION_INTERVAL_MS: u64 = 10_000;
pub const MIN_RECENT_EVENTS_CAP: usize = 20;
pub const MAX_RECENT_EVENTS_CAP: usize = 50;
pub const MIN_MAX_BUCKETS: usize = 50;
pub const MAX_MAX_BUCKETS: usize = 100_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Zero deltas count as buying pressure.
    pub fn from_price_delta(delta: f64) -> Self {
        if delta >= 0.0 {
            Self::Buy
        } else {
            Self::Sell
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Tick {
    pub timestamp: i64,
    pub price: f64,
    pub quantity: f64,
    pub side: Side,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub bucket: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Candle {
    pub fn from_price(bucket: i64, price: f64) -> Self {
        Self {
            bucket,
            open: price,
            high: price,
            low: price,
            close: price,
        }
    }

    pub fn apply_price(&mut self, price: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeBar {
    pub bucket: i64,
    pub volume: f64,
    pub dominant_side: Side,
    pub buy_volume: f64,
    pub sell_volume: f64,
    #[serde(skip)]
    opening_side: Side,
}

impl VolumeBar {
    pub fn from_quantity(bucket: i64, quantity: f64, side: Side) -> Self {
        let mut bar = Self {
            bucket,
            volume: 0.0,
            dominant_side: side,
            buy_volume: 0.0,
            sell_volume: 0.0,
            opening_side: side,
        };
        bar.apply_quantity(quantity, side);
        bar
    }

    pub fn apply_quantity(&mut self, quantity: f64, side: Side) {
        self.volume += quantity;
        match side {
            Side::Buy => self.buy_volume += quantity,
            Side::Sell => self.sell_volume += quantity,
        }
        self.dominant_side = if self.buy_volume > self.sell_volume {
            Side::Buy
        } else if self.sell_volume > self.buy_volume {
            Side::Sell
        } else {
            self.opening_side
        };
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    AwaitingRetry,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Live,
    Simulated,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Simulated => "simulated",
        }
    }

    pub fn parse_str(value: &str) -> Result<Self, AppError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "live" => Ok(Self::Live),
            "simulated" | "sim" | "simulation" => Ok(Self::Simulated),
            other => Err(AppError::InvalidArgument(format!(
                "unknown mode '{other}', expected 'live' or 'simulated'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum PipelineStatus {
    Initializing,
    Connecting,
    Connected,
    Disconnected,
    Retrying,
    SimulationActive,
    Stopped,
    Error(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatusSnapshot {
    pub status: PipelineStatus,
    pub mode: Mode,
    pub connection: ConnectionState,
    pub generation: u64,
    pub live_available: bool,
    pub reason: Option<String>,
    pub ticks_ingested: u64,
    pub decode_errors: u64,
    pub reconnect_attempts: u64,
}

impl PipelineStatusSnapshot {
    pub fn stopped(mode: Mode, reason: Option<String>) -> Self {
        Self {
            status: PipelineStatus::Stopped,
            mode,
            connection: ConnectionState::Idle,
            generation: 0,
            live_available: true,
            reason,
            ticks_ingested: 0,
            decode_errors: 0,
            reconnect_attempts: 0,
        }
    }
}

/// Everything a renderer needs after one flush. Sequences are shared, never mutated in place.
#[derive(Debug, Clone, Serialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MarketFrame {
    pub candles: Arc<Vec<Candle>>,
    pub volumes: Arc<Vec<VolumeBar>>,
    pub recent: Arc<Vec<Tick>>,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DecodeWarning {
    pub message: String,
    pub payload_len: usize,
    pub generation: u64,
    pub decode_errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PerfSnapshot {
    pub t: i64,
    pub apply_p50_us: Option<u32>,
    pub apply_p95_us: Option<u32>,
    pub apply_p99_us: Option<u32>,
    pub batch_p50: Option<u32>,
    pub batch_p95: Option<u32>,
    pub batch_p99: Option<u32>,
    pub ingest_count: u64,
    pub flush_count: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload")]
pub enum PipelineEvent {
    #[serde(rename = "market_status")]
    Status(PipelineStatusSnapshot),
    #[serde(rename = "market_frame_update")]
    Frame(Arc<MarketFrame>),
    #[serde(rename = "decode_warning")]
    DecodeWarning(DecodeWarning),
    #[serde(rename = "market_perf")]
    Perf(PerfSnapshot),
}

impl PipelineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Status(_) => super::MARKET_STATUS_EVENT,
            Self::Frame(_) => super::MARKET_FRAME_UPDATE_EVENT,
            Self::DecodeWarning(_) => super::DECODE_WARNING_EVENT,
            Self::Perf(_) => super::MARKET_PERF_EVENT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PipelineArgs {
    pub endpoint: Option<String>,
    pub initial_mode: Option<Mode>,
    pub flush_interval_ms: Option<u64>,
    pub retry_delay_ms: Option<u64>,
    pub simulation_interval_ms: Option<u64>,
    pub recent_events_cap: Option<usize>,
    pub max_buckets: Option<usize>,
    pub simulation_seed: Option<u64>,
    pub simulation_start_price: Option<f64>,
    pub perf_telemetry: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub endpoint: String,
    pub initial_mode: Mode,
    pub flush_interval_ms: u64,
    pub retry_delay_ms: u64,
    pub simulation_interval_ms: u64,
    pub recent_events_cap: usize,
    pub max_buckets: usize,
    pub simulation_seed: Option<u64>,
    pub simulation_start_price: f64,
    pub perf_telemetry: bool,
}

impl PipelineArgs {
    pub fn normalize(self) -> Result<PipelineConfig, AppError> {
        let endpoint = normalize_endpoint(
            &self
                .endpoint
                .unwrap_or_else(crate::config::resolve_default_endpoint),
        )?;

        let initial_mode = self.initial_mode.unwrap_or(DEFAULT_INITIAL_MODE);

        let flush_interval_ms = self.flush_interval_ms.unwrap_or(DEFAULT_FLUSH_INTERVAL_MS);
        if !(MIN_FLUSH_INTERVAL_MS..=MAX_FLUSH_INTERVAL_MS).contains(&flush_interval_ms) {
            return Err(AppError::InvalidArgument(format!(
                "flushIntervalMs must be between {MIN_FLUSH_INTERVAL_MS} and {MAX_FLUSH_INTERVAL_MS}"
            )));
        }

        let retry_delay_ms = self.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS);
        if !(MIN_RETRY_DELAY_MS..=MAX_RETRY_DELAY_MS).contains(&retry_delay_ms) {
            return Err(AppError::InvalidArgument(format!(
                "retryDelayMs must be between {MIN_RETRY_DELAY_MS} and {MAX_RETRY_DELAY_MS}"
            )));
        }

        let simulation_interval_ms = self
            .simulation_interval_ms
            .unwrap_or(DEFAULT_SIMULATION_INTERVAL_MS);
        if !(MIN_SIMULATION_INTERVAL_MS..=MAX_SIMULATION_INTERVAL_MS)
            .contains(&simulation_interval_ms)
        {
            return Err(AppError::InvalidArgument(format!(
                "simulationIntervalMs must be between {MIN_SIMULATION_INTERVAL_MS} and {MAX_SIMULATION_INTERVAL_MS}"
            )));
        }

        let recent_events_cap = self.recent_events_cap.unwrap_or(DEFAULT_RECENT_EVENTS_CAP);
        if !(MIN_RECENT_EVENTS_CAP..=MAX_RECENT_EVENTS_CAP).contains(&recent_events_cap) {
            return Err(AppError::InvalidArgument(format!(
                "recentEventsCap must be between {MIN_RECENT_EVENTS_CAP} and {MAX_RECENT_EVENTS_CAP}"
            )));
        }

        let max_buckets = self.max_buckets.unwrap_or(DEFAULT_MAX_BUCKETS);
        if !(MIN_MAX_BUCKETS..=MAX_MAX_BUCKETS).contains(&max_buckets) {
            return Err(AppError::InvalidArgument(format!(
                "maxBuckets must be between {MIN_MAX_BUCKETS} and {MAX_MAX_BUCKETS}"
            )));
        }

        let simulation_start_price = self
            .simulation_start_price
            .unwrap_or(DEFAULT_SIMULATION_START_PRICE);
        if !simulation_start_price.is_finite() || simulation_start_price < SIMULATION_PRICE_FLOOR {
            return Err(AppError::InvalidArgument(format!(
                "simulationStartPrice must be finite and at least {SIMULATION_PRICE_FLOOR}"
            )));
        }

        Ok(PipelineConfig {
            endpoint,
            initial_mode,
            flush_interval_ms,
            retry_delay_ms,
            simulation_interval_ms,
            recent_events_cap,
            max_buckets,
            simulation_seed: self.simulation_seed,
            simulation_start_price,
            perf_telemetry: self.perf_telemetry.unwrap_or(DEFAULT_PERF_TELEMETRY),
        })
    }
}

/// Accepts `host:port` or a full `ws://` / `wss://` URL and returns a URL.
pub fn normalize_endpoint(raw: &str) -> Result<String, AppError> {
    let endpoint = raw.trim();
    if endpoint.is_empty() {
        return Err(AppError::InvalidArgument(
            "endpoint must not be empty".to_string(),
        ));
    }

    if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
        return Ok(endpoint.to_string());
    }
    if endpoint.contains("://") {
        return Err(AppError::InvalidArgument(format!(
            "endpoint '{endpoint}' must use ws:// or wss://"
        )));
    }

    let valid_host_port = endpoint
        .rsplit_once(':')
        .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
        .unwrap_or(false);
    if !valid_host_port {
        return Err(AppError::InvalidArgument(format!(
            "endpoint '{endpoint}' must be host:port"
        )));
    }

    Ok(format!("ws://{endpoint}"))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSession {
    pub running: bool,
    pub endpoint: String,
    pub initial_mode: Mode,
    pub flush_interval_ms: u64,
    pub retry_delay_ms: u64,
    pub simulation_interval_ms: u64,
    pub recent_events_cap: usize,
    pub max_buckets: usize,
    pub perf_telemetry: bool,
}

impl PipelineSession {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            running: true,
            endpoint: config.endpoint.clone(),
            initial_mode: config.initial_mode,
            flush_interval_ms: config.flush_interval_ms,
            retry_delay_ms: config.retry_delay_ms,
            simulation_interval_ms: config.simulation_interval_ms,
            recent_events_cap: config.recent_events_cap,
            max_buckets: config.max_buckets,
            perf_telemetry: config.perf_telemetry,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStopResult {
    pub stopped: bool,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModeChange {
    pub previous: Mode,
    pub current: Mode,
    pub changed: bool,
}
