pub mod api;
pub mod config;
pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod opt_out;
pub mod renderer;
pub mod scheduler;
pub mod storage;
pub mod suppression;
pub mod transport;
pub mod types;
