use crate::market::pipeline::{
    FrameStore, PipelineCommand, PipelineOutputs, StatusStore,
};
use crate::market::types::{Mode, PipelineEvent, DEFAULT_INITIAL_MODE};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct PipelineHandle {
    pub commands: mpsc::Sender<PipelineCommand>,
    pub cancellation_token: CancellationToken,
    pub join_handle: JoinHandle<()>,
}

pub struct AppState {
    pub started_at: Instant,
    pub pipeline: Mutex<Option<PipelineHandle>>,
    pub status_store: StatusStore,
    pub frame_store: FrameStore,
    pub events: broadcast::Sender<PipelineEvent>,
}

impl AppState {
    pub fn new() -> Self {
        Self::with_mode(DEFAULT_INITIAL_MODE)
    }

    pub fn with_mode(initial_mode: Mode) -> Self {
        let outputs = PipelineOutputs::new(initial_mode);

        Self {
            started_at: Instant::now(),
            pipeline: Mutex::new(None),
            status_store: outputs.status_store,
            frame_store: outputs.frame_store,
            events: outputs.events,
        }
    }

    pub fn outputs(&self) -> PipelineOutputs {
        PipelineOutputs {
            status_store: self.status_store.clone(),
            frame_store: self.frame_store.clone(),
            events: self.events.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
