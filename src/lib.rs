pub mod api;
pub mod app;
pub mod config;
pub mod error;
pub mod models;
pub mod providers;
pub mod services;

pub use app::App;
pub use error::{ChatError, ChatResult};
