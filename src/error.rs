use std::time::Duration;

use thiserror::Error;

/// 守护进程内部的错误分类
///
/// 除了 `NoDevicesDetected` 和 `Config` 以外，所有错误都只在单个 tick 内处理，
/// 不会终止调度循环。
#[derive(Debug, Error)]
pub enum KeepaliveError {
    #[error("telemetry unavailable: {0}")]
    TelemetryUnavailable(String),

    #[error("failed to spawn worker for GPU{device}: {reason}")]
    WorkerSpawnFailed { device: u32, reason: String },

    #[error("worker pid={pid} did not exit within {grace:?}, killed")]
    WorkerStopTimeout { pid: u32, grace: Duration },

    #[error("no GPU detected")]
    NoDevicesDetected,

    #[error("invalid config: {0}")]
    Config(String),

    #[error("control channel error: {0}")]
    Control(String),
}

pub type Result<T> = std::result::Result<T, KeepaliveError>;
