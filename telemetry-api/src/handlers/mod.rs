mod app;
mod events;
mod stats;

pub use app::{app, AppState};
