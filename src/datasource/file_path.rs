// Thread names
pub const MAIN_THREAD: &str = "KeepaliveMonitor";
pub const LOG_LEVEL_THREAD: &str = "LogLevelWatcher";

// File paths
pub const CONFIG_FILE: &str = "/etc/gpu-keepalive/config.toml";
pub const CONTROL_DIR: &str = "/tmp/gpu_keepalive_control";
pub const LOG_LEVEL_FILE_NAME: &str = "log_level";

// Telemetry
pub const NVIDIA_SMI: &str = "nvidia-smi";
pub const NVIDIA_SMI_QUERY: [&str; 2] = [
    "--query-gpu=index,utilization.gpu",
    "--format=csv,noheader,nounits",
];

// Control markers
pub const WATCH_MARKER_PREFIX: &str = "watch_";
pub const INJECT_MARKER_PREFIX: &str = "inject_";

// Worker environment
pub const VISIBLE_DEVICES_ENV: &str = "CUDA_VISIBLE_DEVICES";
pub const DEVICE_ENV: &str = "GPU_KEEPALIVE_DEVICE";
pub const WORKER_PROCESS_NAME: &str = "keepalive-gpu{id}";
