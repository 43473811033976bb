pub mod backoff;
pub mod core;
pub mod engine;
pub mod error;
pub mod http;
pub mod live_edge;
pub mod resources;
pub mod session;
pub mod telemetry;
pub mod ui;

#[cfg(test)]
mod test_support;
