pub mod assistant;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod services;
pub mod traits;
