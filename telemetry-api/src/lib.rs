pub mod aggregate;
pub mod api;
pub mod config;
pub mod generator;
pub mod handlers;
pub mod reconcile;
pub mod time;
pub mod validation;
