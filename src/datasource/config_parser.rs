use std::{fs, path::Path, path::PathBuf, time::Duration};

use log::{debug, info, warn};
use serde::Deserialize;

use crate::{
    datasource::file_path::*,
    error::{KeepaliveError, Result},
    model::device::Mode,
    utils::constants::{LOG_MAX_SIZE_MB, strategy},
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    pub poll_interval_sec: u64,
    pub idle_threshold_sec: u64,
    pub first_idle_threshold_sec: Option<u64>,
    pub worker_duration_sec: Option<u64>,
    pub dashboard_interval_sec: u64,
    pub initial_mode: Mode,
    pub stop_grace_sec: u64,
    pub shutdown_timeout_sec: u64,
    pub spawn_retry_sec: u64,
    pub control_dir: PathBuf,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_sec: strategy::POLL_INTERVAL,
            idle_threshold_sec: strategy::IDLE_THRESHOLD,
            first_idle_threshold_sec: None,
            worker_duration_sec: None,
            dashboard_interval_sec: strategy::DASHBOARD_INTERVAL,
            initial_mode: Mode::Inject,
            stop_grace_sec: strategy::STOP_GRACE,
            shutdown_timeout_sec: strategy::SHUTDOWN_TIMEOUT,
            spawn_retry_sec: strategy::SPAWN_RETRY,
            control_dir: PathBuf::from(CONTROL_DIR),
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_sec)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_sec)
    }

    /// 首次触发的缩短阈值，0 视为未配置
    pub fn first_idle_threshold(&self) -> Option<Duration> {
        self.first_idle_threshold_sec
            .filter(|&s| s > 0)
            .map(Duration::from_secs)
    }

    /// worker 运行时长，0 或未配置表示不限时
    pub fn worker_duration(&self) -> Option<Duration> {
        self.worker_duration_sec
            .filter(|&s| s > 0)
            .map(Duration::from_secs)
    }

    pub fn dashboard_interval(&self) -> Duration {
        Duration::from_secs(self.dashboard_interval_sec)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_sec)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_sec)
    }

    pub fn spawn_retry(&self) -> Duration {
        Duration::from_secs(self.spawn_retry_sec)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    pub command: String,
    pub timeout_sec: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            command: NVIDIA_SMI.to_string(),
            timeout_sec: strategy::TELEMETRY_TIMEOUT,
        }
    }
}

impl TelemetryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// 负载程序及其参数，由 worker 子命令在目标 GPU 上执行
    pub command: Vec<String>,
    /// worker 进程名模板，`{id}` 替换为 GPU 序号
    pub process_name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            process_name: WORKER_PROCESS_NAME.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    pub level_file: PathBuf,
    pub file: Option<PathBuf>,
    pub max_size_mb: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level_file: Path::new(CONTROL_DIR).join(LOG_LEVEL_FILE_NAME),
            file: None,
            max_size_mb: LOG_MAX_SIZE_MB,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub monitor: MonitorConfig,
    pub telemetry: TelemetryConfig,
    pub worker: WorkerConfig,
    pub log: LogConfig,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let m = &self.monitor;
        if m.poll_interval_sec == 0 {
            return Err(KeepaliveError::Config(
                "monitor.poll_interval_sec must be greater than 0".into(),
            ));
        }
        if m.idle_threshold_sec == 0 {
            return Err(KeepaliveError::Config(
                "monitor.idle_threshold_sec must be greater than 0".into(),
            ));
        }
        if m.dashboard_interval_sec == 0 {
            return Err(KeepaliveError::Config(
                "monitor.dashboard_interval_sec must be greater than 0".into(),
            ));
        }
        if self.telemetry.command.trim().is_empty() {
            return Err(KeepaliveError::Config("telemetry.command is empty".into()));
        }
        if self.telemetry.timeout_sec == 0 {
            return Err(KeepaliveError::Config(
                "telemetry.timeout_sec must be greater than 0".into(),
            ));
        }
        if let Some(first) = m.first_idle_threshold_sec
            && first > m.idle_threshold_sec
        {
            warn!(
                "first_idle_threshold_sec ({first}s) is longer than idle_threshold_sec ({}s)",
                m.idle_threshold_sec
            );
        }
        Ok(())
    }

    /// monitor 额外要求配置了负载程序，否则每个 worker 都会立即退出
    pub fn validate_monitor(&self) -> Result<()> {
        self.validate()?;
        if self.worker.command.is_empty() {
            return Err(KeepaliveError::Config(
                "worker.command is empty, nothing to run on idle GPUs".into(),
            ));
        }
        Ok(())
    }
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config =
        toml::from_str(content).map_err(|e| KeepaliveError::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// 读取配置文件，文件不存在时使用默认配置
pub fn config_read<P: AsRef<Path>>(config_file: P) -> Result<Config> {
    let path = config_file.as_ref();

    if !path.exists() {
        info!(
            "Config file not found: {}, using defaults",
            path.display()
        );
        return Ok(Config::default());
    }

    let content = fs::read_to_string(path)
        .map_err(|e| KeepaliveError::Config(format!("{}: {e}", path.display())))?;
    let config = parse_config(&content)?;

    info!("Load config succeed: {}", path.display());
    debug!("{config:?}");

    Ok(config)
}
