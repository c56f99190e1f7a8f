/// GPU Keepalive 常量定义
pub const NOTES: &str = "GPU Keepalive";
pub const AUTHOR: &str = "Author: Seyud @GitHub, Tools-cx-app @GitHub";
pub const VERSION: &str = concat!("Version: v", env!("CARGO_PKG_VERSION"));

/// 调度策略默认值（秒）
pub mod strategy {
    pub const POLL_INTERVAL: u64 = 5;
    pub const IDLE_THRESHOLD: u64 = 55 * 60;
    pub const DASHBOARD_INTERVAL: u64 = 5;
    pub const STOP_GRACE: u64 = 2;
    pub const SHUTDOWN_TIMEOUT: u64 = 10;
    pub const SPAWN_RETRY: u64 = 30;
    pub const TELEMETRY_TIMEOUT: u64 = 10;
}

/// 循环内部休眠切片，保证中断信号能被及时响应
pub const SLEEP_SLICE_MS: u64 = 100;

/// 日志文件默认上限（MB）
pub const LOG_MAX_SIZE_MB: u64 = 10;

/// worker 能力检查失败时的退出码
pub mod exit_code {
    pub const NO_DEVICES: u8 = 1;
    pub const NO_LOAD_COMMAND: u8 = 2;
    pub const TELEMETRY_UNAVAILABLE: u8 = 3;
    pub const INVALID_INDEX: u8 = 4;
}
