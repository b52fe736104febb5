pub mod event;
pub mod health;
pub mod memory;
pub mod metrics;
pub mod pgstore;
pub mod store;
