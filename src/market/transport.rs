use crate::error::AppError;
use crate::market::types::{ConnectionState, Mode};
use futures_util::StreamExt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CLOSE_HANDSHAKE_TIMEOUT_MS: u64 = 250;

pub type MarketWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub generation: u64,
    pub kind: TransportEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    Opened,
    Payload(Vec<u8>),
    Closed { code: Option<u16>, reason: String },
    ConnectFailed(String),
    Errored(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleAction {
    Ignored { reason: &'static str },
    Connected,
    Forward(Vec<u8>),
    Disconnected { reason: String },
    ConnectFailed { reason: String },
}

/// Events and retry timers from an older `generation` are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionLifecycle {
    state: ConnectionState,
    generation: u64,
    retry_generation: Option<u64>,
}

impl Default for ConnectionLifecycle {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            generation: 0,
            retry_generation: None,
        }
    }
}

impl ConnectionLifecycle {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn retry_pending(&self) -> bool {
        self.retry_generation.is_some()
    }

    pub fn begin_connect(&mut self, mode: Mode) -> Option<u64> {
        if mode != Mode::Live {
            return None;
        }
        match self.state {
            ConnectionState::Idle | ConnectionState::AwaitingRetry => {
                self.generation = self.generation.saturating_add(1);
                self.state = ConnectionState::Connecting;
                self.retry_generation = None;
                Some(self.generation)
            }
            ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Disconnected => None,
        }
    }

    pub fn handle_event(&mut self, event: TransportEvent) -> LifecycleAction {
        if event.generation != self.generation {
            return LifecycleAction::Ignored {
                reason: "stale generation",
            };
        }

        match (self.state, event.kind) {
            (ConnectionState::Connecting, TransportEventKind::Opened) => {
                self.state = ConnectionState::Connected;
                LifecycleAction::Connected
            }
            (ConnectionState::Connected, TransportEventKind::Payload(payload)) => {
                LifecycleAction::Forward(payload)
            }
            (ConnectionState::Connecting, TransportEventKind::ConnectFailed(reason))
            | (ConnectionState::Connecting, TransportEventKind::Errored(reason)) => {
                self.await_retry();
                LifecycleAction::ConnectFailed { reason }
            }
            (ConnectionState::Connecting, TransportEventKind::Closed { code, reason }) => {
                self.await_retry();
                LifecycleAction::ConnectFailed {
                    reason: describe_close(code, &reason),
                }
            }
            (ConnectionState::Connected, TransportEventKind::Closed { code, reason }) => {
                self.state = ConnectionState::Disconnected;
                self.await_retry();
                LifecycleAction::Disconnected {
                    reason: describe_close(code, &reason),
                }
            }
            (ConnectionState::Connected, TransportEventKind::Errored(reason))
            | (ConnectionState::Connected, TransportEventKind::ConnectFailed(reason)) => {
                self.state = ConnectionState::Disconnected;
                self.await_retry();
                LifecycleAction::Disconnected { reason }
            }
            _ => LifecycleAction::Ignored {
                reason: "event not valid in current state",
            },
        }
    }

    fn await_retry(&mut self) {
        self.state = ConnectionState::AwaitingRetry;
        self.retry_generation = Some(self.generation);
    }

    // Mode is checked when the timer fires, not when it was armed.
    pub fn retry_due(&mut self, generation: u64, mode: Mode) -> Option<u64> {
        if self.state != ConnectionState::AwaitingRetry
            || self.retry_generation != Some(generation)
        {
            return None;
        }
        if mode != Mode::Live {
            self.retry_generation = None;
            return None;
        }
        self.begin_connect(mode)
    }

    pub fn stop(&mut self) -> u64 {
        self.generation = self.generation.saturating_add(1);
        self.state = ConnectionState::Idle;
        self.retry_generation = None;
        self.generation
    }
}

fn describe_close(code: Option<u16>, reason: &str) -> String {
    match (code, reason.is_empty()) {
        (Some(code), true) => format!("connection closed with code {code}"),
        (Some(code), false) => format!("connection closed with code {code}: {reason}"),
        (None, true) => "connection closed".to_string(),
        (None, false) => format!("connection closed: {reason}"),
    }
}

struct ConnectionHandle {
    generation: u64,
    cancel_token: CancellationToken,
    join_handle: JoinHandle<()>,
}

struct RetryTimer {
    generation: u64,
    sleep: Pin<Box<Sleep>>,
}

pub struct TransportManager {
    endpoint: String,
    retry_delay: Duration,
    lifecycle: ConnectionLifecycle,
    connection: Option<ConnectionHandle>,
    retry: Option<RetryTimer>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportManager {
    pub fn new(
        endpoint: String,
        retry_delay: Duration,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            endpoint,
            retry_delay,
            lifecycle: ConnectionLifecycle::default(),
            connection: None,
            retry: None,
            events,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    pub fn generation(&self) -> u64 {
        self.lifecycle.generation()
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn has_open_connection(&self) -> bool {
        self.connection.is_some()
    }

    pub fn retry_pending(&self) -> bool {
        self.retry.is_some()
    }

    pub fn start(&mut self, mode: Mode) -> bool {
        match self.lifecycle.begin_connect(mode) {
            Some(generation) => {
                self.open_connection(generation);
                true
            }
            None => false,
        }
    }

    pub fn handle_event(&mut self, event: TransportEvent) -> LifecycleAction {
        let action = self.lifecycle.handle_event(event);
        if matches!(
            action,
            LifecycleAction::Disconnected { .. } | LifecycleAction::ConnectFailed { .. }
        ) {
            self.close_connection();
            self.schedule_retry();
        }
        action
    }

    /// Pending forever while no retry is armed.
    pub fn retry_elapsed(&mut self) -> impl Future<Output = u64> + '_ {
        async move {
            match self.retry.as_mut() {
                Some(timer) => {
                    timer.sleep.as_mut().await;
                    let generation = timer.generation;
                    self.retry = None;
                    generation
                }
                None => std::future::pending().await,
            }
        }
    }

    pub fn fire_retry(&mut self, generation: u64, mode: Mode) -> bool {
        match self.lifecycle.retry_due(generation, mode) {
            Some(next_generation) => {
                self.open_connection(next_generation);
                true
            }
            None => false,
        }
    }

    pub fn stop(&mut self) {
        let generation = self.lifecycle.stop();
        self.retry = None;
        self.close_connection();
        debug!(generation, "transport stopped");
    }

    pub async fn shutdown(&mut self) {
        self.lifecycle.stop();
        self.retry = None;
        if let Some(connection) = self.connection.take() {
            connection.cancel_token.cancel();
            let _ = connection.join_handle.await;
        }
    }

    fn schedule_retry(&mut self) {
        let generation = self.lifecycle.generation();
        self.retry = Some(RetryTimer {
            generation,
            sleep: Box::pin(tokio::time::sleep(self.retry_delay)),
        });
        info!(
            generation,
            delay_ms = self.retry_delay.as_millis() as u64,
            "reconnect scheduled"
        );
    }

    fn open_connection(&mut self, generation: u64) {
        self.close_connection();

        let cancel_token = CancellationToken::new();
        let task_token = cancel_token.clone();
        let endpoint = self.endpoint.clone();
        let events = self.events.clone();
        let join_handle = tokio::spawn(async move {
            run_connection(endpoint, generation, events, task_token).await;
        });

        self.connection = Some(ConnectionHandle {
            generation,
            cancel_token,
            join_handle,
        });
    }

    fn close_connection(&mut self) {
        if let Some(connection) = self.connection.take() {
            debug!(generation = connection.generation, "closing transport connection");
            connection.cancel_token.cancel();
        }
    }
}

pub async fn connect_market_stream(endpoint: &str) -> Result<MarketWsStream, AppError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(1 << 20),
        max_frame_size: Some(1 << 20),
        ..Default::default()
    };

    let (stream, _) = connect_async_with_config(endpoint, Some(ws_config), true).await?;
    Ok(stream)
}

async fn run_connection(
    endpoint: String,
    generation: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
    cancel_token: CancellationToken,
) {
    let send = |kind: TransportEventKind| {
        let _ = events.send(TransportEvent { generation, kind });
    };

    let connected = tokio::select! {
        _ = cancel_token.cancelled() => return,
        result = connect_market_stream(&endpoint) => result,
    };

    let mut websocket_stream = match connected {
        Ok(stream) => stream,
        Err(error) => {
            warn!(generation, endpoint = %endpoint, %error, "websocket connect failed");
            send(TransportEventKind::ConnectFailed(error.to_string()));
            return;
        }
    };

    info!(generation, endpoint = %endpoint, "websocket connected");
    send(TransportEventKind::Opened);

    loop {
        let frame = tokio::select! {
            _ = cancel_token.cancelled() => {
                let _ = tokio::time::timeout(
                    Duration::from_millis(CLOSE_HANDSHAKE_TIMEOUT_MS),
                    websocket_stream.close(None),
                )
                .await;
                return;
            }
            next_message = websocket_stream.next() => next_message,
        };

        let Some(frame_result) = frame else {
            send(TransportEventKind::Closed {
                code: None,
                reason: "stream ended".to_string(),
            });
            return;
        };

        match frame_result {
            Ok(Message::Binary(payload)) => send(TransportEventKind::Payload(payload)),
            Ok(Message::Close(close_frame)) => {
                let (code, reason) = match close_frame {
                    Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                    None => (None, String::new()),
                };
                send(TransportEventKind::Closed { code, reason });
                return;
            }
            Ok(Message::Text(_)) => {
                debug!(generation, "ignoring text frame on binary feed");
            }
            Ok(_) => {}
            Err(error) => {
                warn!(generation, %error, "websocket frame error");
                send(TransportEventKind::Errored(error.to_string()));
                return;
            }
        }
    }
}
