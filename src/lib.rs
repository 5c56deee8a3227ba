#[cfg(not(target_os = "linux"))]
compile_error!("traffic_inspector captures through AF_PACKET and only builds on Linux.");

pub mod af_packet;
pub mod api;
pub mod app;
pub mod classifier;
pub mod config;
pub mod errors;
pub mod exporter;
pub mod flow;
pub mod logging;
pub mod probe;
pub mod queue;
pub mod shutdown;
pub mod synthetic;
pub mod worker;
