//! Local LLM chat server using WGPU - Library exports for testing
//!
//! (c) Softlandia 2025

pub mod api;
pub mod core;
pub mod infrastructure;

use crate::core::assistant::WgmlBackend;
use crate::core::services::{MyChatService, MyModelService};
use crate::infrastructure::engine_host::EngineHost;
use crate::infrastructure::repositories::InMemorySessionRepository;
use crate::infrastructure::settings::Settings;
use di::{Injectable, ServiceCollection};

/// The production service graph: settings from the environment and the GPU engine.
pub fn services() -> ServiceCollection {
    let mut services = ServiceCollection::new();
    services
        .add(Settings::singleton())
        .add(WgmlBackend::singleton())
        .add(EngineHost::singleton())
        .add(InMemorySessionRepository::singleton())
        .add(MyChatService::scoped())
        .add(MyModelService::scoped());
    services
}
