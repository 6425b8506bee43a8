use crate::error::AppError;
use crate::market::decoder::decode_market_data;
use crate::market::ingest::{drain_market_frame, MarketState};
use crate::market::now_unix_ms;
use crate::market::simulator::{SimulatedFeed, SimulatedTickSource};
use crate::market::telemetry::{FlushTelemetry, PERF_EMIT_INTERVAL_MS};
use crate::market::transport::{LifecycleAction, TransportEvent, TransportManager};
use crate::market::types::{
    ConnectionState, DecodeWarning, MarketFrame, Mode, ModeChange, PipelineConfig,
    PipelineEvent, PipelineStatus, PipelineStatusSnapshot, Tick,
};
use crate::market::worker::{DecodeJob, DecodeOutcome, DecodeWorker, WorkerLauncher};
use crate::state::PipelineHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const COMMAND_QUEUE_CAPACITY: usize = 32;
pub const EVENT_CHANNEL_CAPACITY: usize = 1_024;
pub const DECODE_WARNING_THROTTLE_MS: u64 = 500;

pub type StatusStore = Arc<RwLock<PipelineStatusSnapshot>>;
pub type FrameStore = Arc<parking_lot::RwLock<Arc<MarketFrame>>>;

#[derive(Debug)]
pub enum PipelineCommand {
    SetMode {
        mode: Mode,
        reply: oneshot::Sender<ModeChange>,
    },
}

/// Where the runtime publishes. Observers read the stores or subscribe to `events`.
#[derive(Clone)]
pub struct PipelineOutputs {
    pub status_store: StatusStore,
    pub frame_store: FrameStore,
    pub events: broadcast::Sender<PipelineEvent>,
}

impl PipelineOutputs {
    pub fn new(initial_mode: Mode) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            status_store: Arc::new(RwLock::new(PipelineStatusSnapshot::stopped(
                initial_mode,
                Some("pipeline idle".to_string()),
            ))),
            frame_store: Arc::new(parking_lot::RwLock::new(Arc::new(MarketFrame::default()))),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub async fn publish_status(&self, snapshot: PipelineStatusSnapshot) {
        {
            let mut writable = self.status_store.write().await;
            *writable = snapshot.clone();
        }
        self.emit(PipelineEvent::Status(snapshot));
    }

    pub fn publish_frame(&self, frame: MarketFrame) {
        let frame = Arc::new(frame);
        *self.frame_store.write() = Arc::clone(&frame);
        self.emit(PipelineEvent::Frame(frame));
    }

    pub fn emit(&self, event: PipelineEvent) {
        // No subscribers is not an error; the stores still hold the latest state.
        let _ = self.events.send(event);
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PipelineCounters {
    ticks_ingested: u64,
    decode_errors: u64,
    reconnect_attempts: u64,
}

enum Wakeup {
    Shutdown,
    Command(PipelineCommand),
    Transport(TransportEvent),
    Decoded(DecodeOutcome),
    RetryDue(u64),
    Simulated(Tick),
    Flush,
    Heartbeat,
}

pub fn spawn_pipeline(
    config: PipelineConfig,
    outputs: PipelineOutputs,
    launcher: WorkerLauncher,
) -> PipelineHandle {
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    let cancellation_token = CancellationToken::new();
    let runtime = PipelineRuntime::new(
        config,
        outputs,
        launcher,
        commands_rx,
        cancellation_token.clone(),
    );
    let join_handle = tokio::spawn(runtime.run());

    PipelineHandle {
        commands: commands_tx,
        cancellation_token,
        join_handle,
    }
}

/// Single writer of all pipeline state. Every input is serialized through one select loop.
struct PipelineRuntime {
    config: PipelineConfig,
    mode: Mode,
    live_unavailable: Option<String>,
    launcher: WorkerLauncher,
    transport: TransportManager,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    worker: Option<DecodeWorker>,
    decoded_tx: mpsc::UnboundedSender<DecodeOutcome>,
    decoded: mpsc::UnboundedReceiver<DecodeOutcome>,
    simulator: SimulatedFeed,
    market: MarketState,
    outputs: PipelineOutputs,
    counters: PipelineCounters,
    perf: FlushTelemetry,
    last_warning_at: Option<Instant>,
    commands: mpsc::Receiver<PipelineCommand>,
    cancel_token: CancellationToken,
}

impl PipelineRuntime {
    fn new(
        config: PipelineConfig,
        outputs: PipelineOutputs,
        launcher: WorkerLauncher,
        commands: mpsc::Receiver<PipelineCommand>,
        cancel_token: CancellationToken,
    ) -> Self {
        let (transport_tx, transport_events) = mpsc::unbounded_channel();
        let (decoded_tx, decoded) = mpsc::unbounded_channel();
        let transport = TransportManager::new(
            config.endpoint.clone(),
            Duration::from_millis(config.retry_delay_ms),
            transport_tx,
        );
        let simulator = SimulatedFeed::new(
            SimulatedTickSource::new(config.simulation_start_price, config.simulation_seed),
            Duration::from_millis(config.simulation_interval_ms),
        );
        let market = MarketState::new(config.max_buckets, config.recent_events_cap);

        Self {
            mode: config.initial_mode,
            config,
            live_unavailable: None,
            launcher,
            transport,
            transport_events,
            worker: None,
            decoded_tx,
            decoded,
            simulator,
            market,
            outputs,
            counters: PipelineCounters::default(),
            perf: FlushTelemetry::default(),
            last_warning_at: None,
            commands,
            cancel_token,
        }
    }

    async fn run(mut self) {
        info!(
            endpoint = %self.config.endpoint,
            mode = self.mode.as_str(),
            "pipeline starting"
        );
        self.publish_status(PipelineStatus::Initializing, None).await;

        match (self.launcher)(decode_market_data, self.decoded_tx.clone()) {
            Ok(worker) => self.worker = Some(worker),
            Err(error) => {
                warn!(%error, "decode worker failed to start, live mode disabled");
                self.live_unavailable = Some(format!("live mode unavailable: {error}"));
            }
        }

        match self.mode {
            Mode::Live => self.enter_live().await,
            Mode::Simulated => self.enter_simulation().await,
        }

        let flush_period = Duration::from_millis(self.config.flush_interval_ms);
        let mut flush_ticker = interval_after(flush_period);
        let mut heartbeat_ticker = interval_after(Duration::from_millis(PERF_EMIT_INTERVAL_MS));

        loop {
            let wakeup = tokio::select! {
                _ = self.cancel_token.cancelled() => Wakeup::Shutdown,
                command = self.commands.recv() => match command {
                    Some(command) => Wakeup::Command(command),
                    None => Wakeup::Shutdown,
                },
                Some(event) = self.transport_events.recv() => Wakeup::Transport(event),
                Some(outcome) = self.decoded.recv() => Wakeup::Decoded(outcome),
                generation = self.transport.retry_elapsed() => Wakeup::RetryDue(generation),
                tick = self.simulator.next_tick() => Wakeup::Simulated(tick),
                _ = flush_ticker.tick() => Wakeup::Flush,
                _ = heartbeat_ticker.tick() => Wakeup::Heartbeat,
            };

            match wakeup {
                Wakeup::Shutdown => break,
                Wakeup::Command(command) => self.handle_command(command).await,
                Wakeup::Transport(event) => self.handle_transport_event(event).await,
                Wakeup::Decoded(outcome) => self.handle_decoded(outcome),
                Wakeup::RetryDue(generation) => self.handle_retry_due(generation).await,
                Wakeup::Simulated(tick) => self.ingest(tick),
                Wakeup::Flush => self.flush(),
                Wakeup::Heartbeat => self.heartbeat().await,
            }
        }

        self.teardown().await;
    }

    async fn handle_command(&mut self, command: PipelineCommand) {
        match command {
            PipelineCommand::SetMode { mode, reply } => {
                let change = self.set_mode(mode).await;
                let _ = reply.send(change);
            }
        }
    }

    async fn set_mode(&mut self, mode: Mode) -> ModeChange {
        let previous = self.mode;
        if previous == mode {
            return ModeChange {
                previous,
                current: mode,
                changed: false,
            };
        }

        self.mode = mode;
        info!(
            from = previous.as_str(),
            to = mode.as_str(),
            "switching pipeline mode"
        );

        match mode {
            Mode::Simulated => {
                self.transport.stop();
                let discarded = self.market.pending.discard();
                if discarded > 0 {
                    debug!(discarded, "dropped unflushed live ticks");
                }
                self.enter_simulation().await;
            }
            Mode::Live => {
                self.simulator.stop();
                self.enter_live().await;
            }
        }

        ModeChange {
            previous,
            current: mode,
            changed: true,
        }
    }

    async fn enter_live(&mut self) {
        if let Some(reason) = self.live_unavailable.clone() {
            self.publish_status(PipelineStatus::Error(reason.clone()), Some(reason))
                .await;
            return;
        }

        if self.transport.start(Mode::Live) {
            self.publish_status(
                PipelineStatus::Connecting,
                Some(format!("connecting to {}", self.config.endpoint)),
            )
            .await;
        }
    }

    async fn enter_simulation(&mut self) {
        self.simulator.start();
        self.publish_status(PipelineStatus::SimulationActive, None)
            .await;
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match self.transport.handle_event(event) {
            LifecycleAction::Ignored { reason } => {
                debug!(reason, "transport event ignored");
            }
            LifecycleAction::Connected => {
                self.publish_status(PipelineStatus::Connected, None).await;
            }
            LifecycleAction::Forward(payload) => self.submit_payload(payload),
            LifecycleAction::Disconnected { reason } => {
                self.publish_status(PipelineStatus::Disconnected, Some(reason))
                    .await;
                let retry_reason = format!(
                    "Connection lost. Retrying in {}...",
                    format_delay(self.transport.retry_delay())
                );
                self.publish_status(PipelineStatus::Retrying, Some(retry_reason))
                    .await;
            }
            LifecycleAction::ConnectFailed { reason } => {
                let retry_reason = format!(
                    "Connection failed ({reason}). Retrying in {}...",
                    format_delay(self.transport.retry_delay())
                );
                self.publish_status(PipelineStatus::Retrying, Some(retry_reason))
                    .await;
            }
        }
    }

    fn submit_payload(&mut self, payload: Vec<u8>) {
        let Some(worker) = self.worker.as_ref() else {
            return;
        };
        let job = DecodeJob {
            generation: self.transport.generation(),
            payload,
        };
        if let Err(error) = worker.submit(job) {
            warn!(%error, "dropping payload, decode worker unavailable");
        }
    }

    fn handle_decoded(&mut self, outcome: DecodeOutcome) {
        let current = self.mode == Mode::Live
            && self.transport.state() == ConnectionState::Connected
            && outcome.generation == self.transport.generation();
        if !current {
            debug!(
                generation = outcome.generation,
                current_generation = self.transport.generation(),
                "discarding decode outcome from previous session"
            );
            return;
        }

        match outcome.result {
            Ok(tick) => self.ingest(tick),
            Err(error) => {
                self.counters.decode_errors = self.counters.decode_errors.saturating_add(1);
                self.warn_decode_failure(error.to_string(), outcome.payload_len, outcome.generation);
            }
        }
    }

    fn warn_decode_failure(&mut self, message: String, payload_len: usize, generation: u64) {
        let now = Instant::now();
        let throttled = self
            .last_warning_at
            .map(|last| now.duration_since(last) < Duration::from_millis(DECODE_WARNING_THROTTLE_MS))
            .unwrap_or(false);
        if throttled {
            return;
        }

        self.last_warning_at = Some(now);
        warn!(payload_len, generation, %message, "dropping undecodable payload");
        self.outputs.emit(PipelineEvent::DecodeWarning(DecodeWarning {
            message,
            payload_len,
            generation,
            decode_errors: self.counters.decode_errors,
        }));
    }

    async fn handle_retry_due(&mut self, generation: u64) {
        if self.transport.fire_retry(generation, self.mode) {
            self.counters.reconnect_attempts = self.counters.reconnect_attempts.saturating_add(1);
            self.publish_status(
                PipelineStatus::Connecting,
                Some(format!(
                    "reconnect attempt {} to {}",
                    self.counters.reconnect_attempts, self.config.endpoint
                )),
            )
            .await;
        } else {
            debug!(generation, mode = self.mode.as_str(), "retry suppressed");
        }
    }

    fn ingest(&mut self, tick: Tick) {
        self.market.pending.push(tick);
        self.counters.ticks_ingested = self.counters.ticks_ingested.saturating_add(1);
        self.perf.record_ingest();
    }

    fn flush(&mut self) {
        let Some((frame, stats)) = drain_market_frame(&mut self.market) else {
            return;
        };
        if stats.merged_late > 0 {
            debug!(merged_late = stats.merged_late, "late ticks merged into open bucket");
        }
        self.perf.record_flush(stats.apply_us, stats.batch_size);
        self.outputs.publish_frame(frame);
    }

    async fn heartbeat(&mut self) {
        {
            let mut writable = self.outputs.status_store.write().await;
            writable.ticks_ingested = self.counters.ticks_ingested;
            writable.decode_errors = self.counters.decode_errors;
            writable.reconnect_attempts = self.counters.reconnect_attempts;
        }

        if self.config.perf_telemetry && self.perf.flush_count() > 0 {
            self.outputs
                .emit(PipelineEvent::Perf(self.perf.snapshot(now_unix_ms())));
        }
    }

    async fn teardown(&mut self) {
        self.simulator.stop();
        self.transport.shutdown().await;
        let discarded = self.market.pending.discard();

        if let Some(worker) = self.worker.take() {
            if let Err(error) = tokio::task::spawn_blocking(move || worker.shutdown()).await {
                warn!(%error, "decode worker shutdown task failed");
            }
        }

        info!(discarded, "pipeline stopped");
        self.publish_status(PipelineStatus::Stopped, Some("pipeline stopped".to_string()))
            .await;
    }

    async fn publish_status(&mut self, status: PipelineStatus, reason: Option<String>) {
        info!(status = ?status, reason = ?reason, generation = self.transport.generation(), "pipeline status");
        let snapshot = PipelineStatusSnapshot {
            status,
            mode: self.mode,
            connection: self.transport.state(),
            generation: self.transport.generation(),
            live_available: self.live_unavailable.is_none(),
            reason,
            ticks_ingested: self.counters.ticks_ingested,
            decode_errors: self.counters.decode_errors,
            reconnect_attempts: self.counters.reconnect_attempts,
        };
        self.outputs.publish_status(snapshot).await;
    }
}

impl PipelineHandle {
    pub async fn set_mode(&self, mode: Mode) -> Result<ModeChange, AppError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(PipelineCommand::SetMode { mode, reply })
            .await
            .map_err(|_| AppError::PipelineClosed)?;
        response.await.map_err(|_| AppError::PipelineClosed)
    }

    pub async fn shutdown(self) {
        self.cancellation_token.cancel();
        if let Err(error) = self.join_handle.await {
            warn!(%error, "pipeline task ended abnormally");
        }
    }
}

fn interval_after(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

fn format_delay(delay: Duration) -> String {
    let millis = delay.as_millis();
    if millis % 1_000 == 0 {
        format!("{}s", millis / 1_000)
    } else {
        format!("{millis}ms")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::decoder::Decoder;
    use crate::market::types::PipelineArgs;
    use crate::market::worker::spawn_decode_worker;

    fn simulated_config(seed: u64) -> PipelineConfig {
        PipelineArgs {
            endpoint: Some("127.0.0.1:9".to_string()),
            initial_mode: Some(Mode::Simulated),
            simulation_seed: Some(seed),
            simulation_interval_ms: Some(50),
            ..Default::default()
        }
        .normalize()
        .expect("test config is valid")
    }

    fn failing_launcher(
        _decoder: Decoder,
        _outcomes: mpsc::UnboundedSender<DecodeOutcome>,
    ) -> Result<DecodeWorker, AppError> {
        Err(AppError::WorkerUnavailable("thread budget exhausted".to_string()))
    }

    async fn next_status(
        events: &mut broadcast::Receiver<PipelineEvent>,
    ) -> PipelineStatusSnapshot {
        loop {
            match events.recv().await.expect("event stream open") {
                PipelineEvent::Status(snapshot) => return snapshot,
                _ => continue,
            }
        }
    }

    async fn next_frame(events: &mut broadcast::Receiver<PipelineEvent>) -> Arc<MarketFrame> {
        loop {
            match events.recv().await.expect("event stream open") {
                PipelineEvent::Frame(frame) => return frame,
                _ => continue,
            }
        }
    }

    #[test]
    fn formats_retry_delays() {
        assert_eq!(format_delay(Duration::from_millis(3_000)), "3s");
        assert_eq!(format_delay(Duration::from_millis(1_500)), "1500ms");
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_start_publishes_frames() {
        let outputs = PipelineOutputs::new(Mode::Simulated);
        let mut events = outputs.subscribe();
        let handle = spawn_pipeline(simulated_config(5), outputs.clone(), spawn_decode_worker);

        assert_eq!(next_status(&mut events).await.status, PipelineStatus::Initializing);
        let active = next_status(&mut events).await;
        assert_eq!(active.status, PipelineStatus::SimulationActive);
        assert_eq!(active.connection, ConnectionState::Idle);

        let frame = next_frame(&mut events).await;
        assert!(frame.batch_size >= 1);
        assert!(!frame.candles.is_empty());
        assert_eq!(frame.candles.len(), frame.volumes.len());
        assert_eq!(outputs.frame_store.read().batch_size, frame.batch_size);

        handle.shutdown().await;
        assert_eq!(
            outputs.status_store.read().await.status,
            PipelineStatus::Stopped
        );
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_the_current_mode_changes_nothing() {
        let outputs = PipelineOutputs::new(Mode::Simulated);
        let handle = spawn_pipeline(simulated_config(1), outputs.clone(), spawn_decode_worker);

        let change = handle
            .set_mode(Mode::Simulated)
            .await
            .expect("pipeline accepts commands");

        assert!(!change.changed);
        assert_eq!(change.previous, Mode::Simulated);
        assert_eq!(change.current, Mode::Simulated);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn worker_failure_blocks_live_but_not_simulation() {
        let mut config = simulated_config(2);
        config.initial_mode = Mode::Live;
        let outputs = PipelineOutputs::new(Mode::Live);
        let mut events = outputs.subscribe();
        let handle = spawn_pipeline(config, outputs.clone(), failing_launcher);

        assert_eq!(next_status(&mut events).await.status, PipelineStatus::Initializing);
        let degraded = next_status(&mut events).await;
        match &degraded.status {
            PipelineStatus::Error(message) => {
                assert!(message.starts_with("live mode unavailable"));
            }
            other => panic!("expected error status, got {other:?}"),
        }
        assert!(!degraded.live_available);
        assert_eq!(degraded.connection, ConnectionState::Idle);

        let change = handle
            .set_mode(Mode::Simulated)
            .await
            .expect("pipeline accepts commands");
        assert!(change.changed);
        assert_eq!(
            next_status(&mut events).await.status,
            PipelineStatus::SimulationActive
        );
        assert!(next_frame(&mut events).await.batch_size >= 1);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_refreshes_counters_and_emits_perf() {
        let mut config = simulated_config(8);
        config.perf_telemetry = true;
        let outputs = PipelineOutputs::new(Mode::Simulated);
        let mut events = outputs.subscribe();
        let handle = spawn_pipeline(config, outputs.clone(), spawn_decode_worker);

        assert_eq!(next_status(&mut events).await.status, PipelineStatus::Initializing);
        let active = next_status(&mut events).await;
        assert_eq!(active.status, PipelineStatus::SimulationActive);
        assert_eq!(active.ticks_ingested, 0);

        let started = Instant::now();
        let perf = loop {
            match events.recv().await.expect("event stream open") {
                PipelineEvent::Perf(perf) => break perf,
                PipelineEvent::Status(snapshot) => {
                    panic!("heartbeat published a status: {:?}", snapshot.status)
                }
                _ => continue,
            }
        };
        assert!(started.elapsed() >= Duration::from_millis(PERF_EMIT_INTERVAL_MS));
        assert!(perf.flush_count > 0);
        assert!(perf.ingest_count > 0);

        let stored = outputs.status_store.read().await.clone();
        assert_eq!(stored.status, PipelineStatus::SimulationActive);
        assert!(stored.ticks_ingested > 0);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn perf_stays_quiet_when_disabled() {
        let outputs = PipelineOutputs::new(Mode::Simulated);
        let mut events = outputs.subscribe();
        let handle = spawn_pipeline(simulated_config(8), outputs.clone(), spawn_decode_worker);

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        handle.shutdown().await;

        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, PipelineEvent::Perf(_)));
        }
        assert!(outputs.status_store.read().await.ticks_ingested > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn commands_after_shutdown_report_closed_pipeline() {
        let outputs = PipelineOutputs::new(Mode::Simulated);
        let handle = spawn_pipeline(simulated_config(3), outputs, spawn_decode_worker);
        let commands = handle.commands.clone();
        handle.shutdown().await;

        let (reply, _response) = oneshot::channel();
        let sent = commands
            .send(PipelineCommand::SetMode {
                mode: Mode::Live,
                reply,
            })
            .await;
        assert!(sent.is_err());
    }
}
