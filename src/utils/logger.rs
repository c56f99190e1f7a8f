use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{Context, Result};
use chrono::Local;
use log::{LevelFilter, Metadata, Record};
use once_cell::sync::Lazy;

use crate::utils::log_rotation::LogRotationManager;

// 每写入这么多条检查一次是否需要轮转
const ROTATE_CHECK_EVERY: u32 = 256;

struct LogFile {
    path: PathBuf,
    file: File,
    rotation: LogRotationManager,
    records: u32,
}

impl LogFile {
    fn open(path: &Path, max_size_mb: u64) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            file: open_append(path)?,
            rotation: LogRotationManager::new(max_size_mb, None),
            records: 0,
        })
    }

    fn write(&mut self, line: &str) {
        let _ = self.file.write_all(line.as_bytes());

        self.records += 1;
        if self.records >= ROTATE_CHECK_EVERY {
            self.records = 0;
            if let Ok(true) = self.rotation.check_and_rotate(&self.path)
                && let Ok(file) = open_append(&self.path)
            {
                self.file = file;
            }
        }
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file: {}", path.display()))
}

// 控制台输出走 stderr，stdout 留给仪表盘
struct KeepaliveLogger {
    file: Mutex<Option<LogFile>>,
}

impl log::Log for KeepaliveLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        // 实际的过滤由 log 库根据 max_level 完成
        true
    }

    fn log(&self, record: &Record) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let line = format!("[{}][{}]: {}\n", timestamp, record.level(), record.args());

        eprint!("{line}");

        if let Ok(mut guard) = self.file.lock()
            && let Some(file) = guard.as_mut()
        {
            file.write(&line);
        }
    }

    fn flush(&self) {
        if let Ok(mut guard) = self.file.lock()
            && let Some(file) = guard.as_mut()
        {
            let _ = file.file.flush();
        }
    }
}

static LOGGER: Lazy<KeepaliveLogger> = Lazy::new(|| KeepaliveLogger {
    file: Mutex::new(None),
});

pub fn init_logger(level_file: &Path, log_file: Option<&Path>, max_size_mb: u64) -> Result<()> {
    let log_level = read_log_level_config(level_file);

    if let Some(path) = log_file {
        let file = LogFile::open(path, max_size_mb)?;
        if let Ok(mut guard) = LOGGER.file.lock() {
            *guard = Some(file);
        }
    }

    log::set_logger(&*LOGGER)
        .map(|()| log::set_max_level(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to set logger: {e}"))?;

    log::debug!("Logger initialized with level: {log_level}");
    log::debug!("Log level config path: {}", level_file.display());
    if let Some(path) = log_file {
        log::debug!("Log file path: {}", path.display());
    }

    Ok(())
}

/// 读取日志等级配置文件，缺失或无法识别时为 Info
pub fn read_log_level_config(level_file: &Path) -> LevelFilter {
    let Ok(content) = std::fs::read_to_string(level_file) else {
        return LevelFilter::Info;
    };
    parse_level(&content)
}

pub fn parse_level(content: &str) -> LevelFilter {
    match content.trim().to_lowercase().as_str() {
        "debug" => LevelFilter::Debug,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info,
    }
}

pub fn update_log_level(level_file: &Path) {
    let new_level = read_log_level_config(level_file);
    if new_level != log::max_level() {
        log::set_max_level(new_level);
        log::info!("Log level updated to: {new_level}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_levels() {
        assert_eq!(parse_level("debug\n"), LevelFilter::Debug);
        assert_eq!(parse_level(" WARN "), LevelFilter::Warn);
        assert_eq!(parse_level("error"), LevelFilter::Error);
        assert_eq!(parse_level("info"), LevelFilter::Info);
        assert_eq!(parse_level("verbose"), LevelFilter::Info);
    }

    #[test]
    fn missing_level_file_defaults_to_info() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            read_log_level_config(&dir.path().join("log_level")),
            LevelFilter::Info
        );
    }

    #[test]
    fn second_init_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let level_file = dir.path().join("log_level");

        // 全局 logger 只能安装一次
        let _ = init_logger(&level_file, None, 1);
        let err = init_logger(&level_file, None, 1).unwrap_err();
        assert!(err.to_string().contains("Failed to set logger"));
    }
}
