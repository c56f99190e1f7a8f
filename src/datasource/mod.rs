pub mod config_parser;
pub mod control_signal;
pub mod file_path;
pub mod telemetry;
