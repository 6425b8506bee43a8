use crate::error::AppError;
use crate::market::pipeline::spawn_pipeline;
use crate::market::types::{
    MarketFrame, Mode, ModeChange, PipelineArgs, PipelineSession, PipelineStatus,
    PipelineStatusSnapshot, PipelineStopResult,
};
use crate::market::worker::{spawn_decode_worker, WorkerLauncher};
use crate::state::AppState;
use std::sync::Arc;

pub async fn start_pipeline(
    state: &AppState,
    args: Option<PipelineArgs>,
) -> Result<PipelineSession, AppError> {
    start_pipeline_with(state, args, spawn_decode_worker).await
}

/// Starts the runtime with a custom worker launcher. Replaces any pipeline already running.
pub async fn start_pipeline_with(
    state: &AppState,
    args: Option<PipelineArgs>,
    launcher: WorkerLauncher,
) -> Result<PipelineSession, AppError> {
    let config = args.unwrap_or_default().normalize()?;

    let existing_handle = {
        let mut pipeline_slot = state.pipeline.lock().await;
        pipeline_slot.take()
    };
    if let Some(handle) = existing_handle {
        handle.shutdown().await;
    }

    let handle = spawn_pipeline(config.clone(), state.outputs(), launcher);

    {
        let mut pipeline_slot = state.pipeline.lock().await;
        *pipeline_slot = Some(handle);
    }

    Ok(PipelineSession::from_config(&config))
}

pub async fn stop_pipeline(state: &AppState) -> Result<PipelineStopResult, AppError> {
    let existing_handle = {
        let mut pipeline_slot = state.pipeline.lock().await;
        pipeline_slot.take()
    };

    let stopped = match existing_handle {
        Some(handle) => {
            handle.shutdown().await;
            true
        }
        None => false,
    };

    {
        let mut writable = state.status_store.write().await;
        writable.status = PipelineStatus::Stopped;
        writable.reason = Some("pipeline stopped by command".to_string());
    }

    Ok(PipelineStopResult { stopped })
}

pub async fn set_mode(state: &AppState, mode: Mode) -> Result<ModeChange, AppError> {
    let pipeline_slot = state.pipeline.lock().await;
    let Some(handle) = pipeline_slot.as_ref() else {
        return Err(AppError::PipelineClosed);
    };
    handle.set_mode(mode).await
}

pub async fn pipeline_status(state: &AppState) -> Result<PipelineStatusSnapshot, AppError> {
    let snapshot = state.status_store.read().await.clone();
    Ok(snapshot)
}

/// Latest flushed frame. Cheap: sequences are shared, not copied.
pub fn market_snapshot(state: &AppState) -> Arc<MarketFrame> {
    state.frame_store.read().clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simulated_args() -> PipelineArgs {
        PipelineArgs {
            endpoint: Some("127.0.0.1:9".to_string()),
            initial_mode: Some(Mode::Simulated),
            simulation_seed: Some(21),
            simulation_interval_ms: Some(20),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn set_mode_without_pipeline_fails() {
        let state = AppState::new();
        let result = set_mode(&state, Mode::Simulated).await;
        assert!(matches!(result, Err(AppError::PipelineClosed)));
    }

    #[tokio::test]
    async fn stop_without_pipeline_reports_nothing_stopped() {
        let state = AppState::new();
        let result = stop_pipeline(&state).await.expect("stop never fails");
        assert!(!result.stopped);
        assert_eq!(
            pipeline_status(&state).await.expect("status readable").status,
            PipelineStatus::Stopped
        );
    }

    #[tokio::test]
    async fn rejects_invalid_args_without_spawning() {
        let state = AppState::new();
        let args = PipelineArgs {
            max_buckets: Some(1),
            ..simulated_args()
        };

        assert!(start_pipeline(&state, Some(args)).await.is_err());
        assert!(state.pipeline.lock().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn start_then_stop_round_trip() {
        let state = AppState::with_mode(Mode::Simulated);
        let mut events = state.subscribe();

        let session = start_pipeline(&state, Some(simulated_args()))
            .await
            .expect("pipeline starts");
        assert!(session.running);
        assert_eq!(session.initial_mode, Mode::Simulated);

        loop {
            if let crate::market::types::PipelineEvent::Frame(_) =
                events.recv().await.expect("event stream open")
            {
                break;
            }
        }
        assert!(!market_snapshot(&state).candles.is_empty());

        let stopped = stop_pipeline(&state).await.expect("stop succeeds");
        assert!(stopped.stopped);
        assert_eq!(
            pipeline_status(&state).await.expect("status readable").status,
            PipelineStatus::Stopped
        );
    }
}
