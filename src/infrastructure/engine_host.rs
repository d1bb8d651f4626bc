//! Process-wide engine slot.
//!
//! Holds the compute probe result, the model load state and the single engine every chat
//! session sends its requests to.

use crate::core::engine::{Engine, EngineBackend, ProgressHandler};
use crate::core::error::{ChatError, Result};
use di::{Ref, inject, injectable};
use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineStatus {
    /// The compute probe has not run yet.
    Unprobed,
    /// No GPU compute on this host. Terminal.
    Unsupported { reason: String },
    /// GPU compute is available, nothing is loaded.
    Idle { adapter: String },
    Loading { model: String },
    Ready { model: String },
    Failed { model: String, message: String },
}

struct HostState {
    status: EngineStatus,
    engine: Option<Arc<dyn Engine>>,
}

pub struct EngineHost {
    backend: Ref<dyn EngineBackend>,
    state: RwLock<HostState>,
}

#[injectable]
impl EngineHost {
    #[inject]
    pub fn create(backend: Ref<dyn EngineBackend>) -> EngineHost {
        EngineHost {
            backend,
            state: RwLock::new(HostState {
                status: EngineStatus::Unprobed,
                engine: None,
            }),
        }
    }
}

impl EngineHost {
    pub async fn status(&self) -> EngineStatus {
        self.state.read().await.status.clone()
    }

    /// The loaded engine, if a load has completed successfully.
    pub async fn engine(&self) -> Option<Arc<dyn Engine>> {
        self.state.read().await.engine.clone()
    }

    pub async fn available_models(&self) -> Vec<String> {
        self.backend.available_models().await
    }

    /// Runs the compute probe once and records the outcome.
    pub async fn probe(&self) -> EngineStatus {
        let result = self.backend.probe().await;

        let mut state = self.state.write().await;
        if state.status != EngineStatus::Unprobed {
            return state.status.clone();
        }

        state.status = match result {
            Ok(adapter) => {
                info!("GPU compute available: {}", adapter.description);
                EngineStatus::Idle {
                    adapter: adapter.description,
                }
            }
            Err(ChatError::CapabilityMissing(reason)) => {
                warn!("GPU compute unavailable: {reason}");
                EngineStatus::Unsupported { reason }
            }
            Err(err) => {
                warn!("GPU probe failed: {err}");
                EngineStatus::Unsupported {
                    reason: err.to_string(),
                }
            }
        };
        state.status.clone()
    }

    /// Marks `model` as loading, dropping any previously loaded engine.
    ///
    /// Fails without side effects if GPU compute is unavailable or a load is already running.
    pub async fn reserve(&self, model: &str) -> Result<()> {
        if self.status().await == EngineStatus::Unprobed {
            self.probe().await;
        }

        let mut state = self.state.write().await;
        match state.status.clone() {
            EngineStatus::Unsupported { reason } => Err(ChatError::CapabilityMissing(reason)),
            EngineStatus::Loading { model: loading } => Err(ChatError::Busy(format!(
                "model {loading} is already loading"
            ))),
            _ => {
                state.status = EngineStatus::Loading {
                    model: model.to_owned(),
                };
                state.engine = None;
                Ok(())
            }
        }
    }

    /// Initializes the engine for a reserved model and publishes it.
    pub async fn complete(
        &self,
        model: &str,
        progress: &dyn ProgressHandler,
    ) -> Result<Arc<dyn Engine>> {
        let started = Instant::now();
        let result = self.backend.initialize(model, progress).await;

        let mut state = self.state.write().await;
        match result {
            Ok(engine) => {
                info!(
                    "Model {model} ready in {:.2} seconds.",
                    started.elapsed().as_secs_f32()
                );
                state.status = EngineStatus::Ready {
                    model: model.to_owned(),
                };
                state.engine = Some(engine.clone());
                Ok(engine)
            }
            Err(err) => {
                error!("Failed to load model {model}: {err:?}");
                state.status = EngineStatus::Failed {
                    model: model.to_owned(),
                    message: err.to_string(),
                };
                state.engine = None;
                Err(err)
            }
        }
    }

    pub async fn load(
        &self,
        model: &str,
        progress: &dyn ProgressHandler,
    ) -> Result<Arc<dyn Engine>> {
        self.reserve(model).await?;
        self.complete(model, progress).await
    }
}

/// Writes load progress to the log.
pub struct LogProgress;

impl ProgressHandler for LogProgress {
    fn on_progress(&self, text: &str) {
        info!("{text}");
    }
}
