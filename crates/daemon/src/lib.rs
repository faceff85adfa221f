mod api_error;
pub mod app;
mod handlers;

pub use api_error::ApiError;
pub use app::{AppState, router};
