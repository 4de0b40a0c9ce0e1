/// Configuration management for the kernel.
pub mod config;
/// Telemetry setup for structured logging.
pub mod telemetry;
