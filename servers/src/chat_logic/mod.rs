pub mod config;
pub mod logger;
pub mod state;
pub mod limiter;
pub mod sink;
pub mod upstream;
pub mod downstream;
