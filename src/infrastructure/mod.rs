pub mod engine_host;
pub mod entities;
pub mod repositories;
pub mod settings;
pub mod traits;
