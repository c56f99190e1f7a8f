pub mod constants;
pub mod inotify;
pub mod log_monitor;
pub mod log_rotation;
pub mod logger;
