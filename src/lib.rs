pub mod commands;
pub mod config;
pub mod error;
pub mod market;
pub mod state;

use crate::commands::{
    app_info::app_info,
    health::health,
    pipeline::{market_snapshot, pipeline_status, set_mode, start_pipeline, stop_pipeline},
};
use crate::error::AppError;
use crate::market::types::{Mode, PipelineArgs, PipelineEvent, DEFAULT_INITIAL_MODE};
use crate::state::AppState;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Runs the headless dashboard until `quit`, end of stdin or Ctrl-C.
pub async fn run() -> Result<(), AppError> {
    let info = app_info();
    info!(
        name = %info.product_name,
        version = %info.version,
        platform = %info.platform,
        arch = %info.arch,
        "starting"
    );

    let args = match config::resolve_config_path(std::env::args().skip(1))? {
        Some(path) => {
            info!(path = %path.display(), "loading pipeline config");
            config::load_pipeline_args(&path)?
        }
        None => PipelineArgs::default(),
    };

    let state = AppState::with_mode(args.initial_mode.unwrap_or(DEFAULT_INITIAL_MODE));
    let logger = tokio::spawn(log_events(state.subscribe()));

    let session = start_pipeline(&state, Some(args)).await?;
    print_json(&session);

    drive_console(&state, BufReader::new(tokio::io::stdin())).await;

    let stopped = stop_pipeline(&state).await?;
    print_json(&stopped);
    logger.abort();
    Ok(())
}

/// Reads console commands until `quit`, end of input, a read error or Ctrl-C.
async fn drive_console<R>(state: &AppState, input: R)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    loop {
        let line = tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(error) = signal {
                    warn!(%error, "ctrl-c handler failed");
                }
                break;
            }
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) => {
                if !handle_console_command(state, line.trim()).await {
                    break;
                }
            }
            Ok(None) => break,
            Err(error) => {
                error!(%error, "console input failed, shutting down");
                break;
            }
        }
    }
}

/// Returns false when the console asked to quit.
async fn handle_console_command(state: &AppState, line: &str) -> bool {
    match line {
        "" => {}
        "quit" | "exit" => return false,
        "status" => match pipeline_status(state).await {
            Ok(snapshot) => print_json(&snapshot),
            Err(error) => error!(%error, "status unavailable"),
        },
        "health" => print_json(&health(state).await),
        "snapshot" => {
            let frame = market_snapshot(state);
            info!(
                candles = frame.candles.len(),
                volumes = frame.volumes.len(),
                recent = frame.recent.len(),
                last_close = frame.candles.last().map(|candle| candle.close),
                "market snapshot"
            );
        }
        other => match Mode::parse_str(other) {
            Ok(mode) => match set_mode(state, mode).await {
                Ok(change) => print_json(&change),
                Err(error) => error!(%error, "mode change failed"),
            },
            Err(_) => {
                warn!(command = other, "unknown command, expected live|sim|status|health|snapshot|quit");
            }
        },
    }
    true
}

async fn log_events(mut events: broadcast::Receiver<PipelineEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event logger lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match &event {
            PipelineEvent::Frame(frame) => debug!(
                event = event.name(),
                batch_size = frame.batch_size,
                candles = frame.candles.len(),
                "frame flushed"
            ),
            PipelineEvent::DecodeWarning(warning) => warn!(
                event = event.name(),
                payload_len = warning.payload_len,
                decode_errors = warning.decode_errors,
                message = %warning.message
            ),
            PipelineEvent::Status(_) | PipelineEvent::Perf(_) => {
                match simd_json::serde::to_string(&event) {
                    Ok(encoded) => info!(event = event.name(), payload = %encoded),
                    Err(error) => warn!(%error, "failed to encode event"),
                }
            }
        }
    }
}

fn print_json<T: Serialize>(value: &T) {
    match simd_json::serde::to_string(value) {
        Ok(encoded) => println!("{encoded}"),
        Err(error) => warn!(%error, "failed to encode console output"),
    }
}
