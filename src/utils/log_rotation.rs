use std::{fs, path::Path};

use anyhow::{Context, Result};
use chrono::Local;

/// 日志轮转：超过阈值后把日志改名为 `<file>.bak`
pub struct LogRotationManager {
    max_size_bytes: u64,
    rotation_threshold: f64,
}

impl LogRotationManager {
    /// `rotation_threshold` 为 0.0-1.0，默认 0.8
    pub fn new(max_size_mb: u64, rotation_threshold: Option<f64>) -> Self {
        Self {
            max_size_bytes: max_size_mb * 1024 * 1024,
            rotation_threshold: rotation_threshold.unwrap_or(0.8),
        }
    }

    pub fn should_rotate(&self, log_file: &Path) -> Result<bool> {
        if !log_file.exists() {
            return Ok(false);
        }

        let file_size = log_file
            .metadata()
            .with_context(|| format!("Failed to get metadata for: {}", log_file.display()))?
            .len();
        let threshold_size = (self.max_size_bytes as f64 * self.rotation_threshold) as u64;

        Ok(file_size > threshold_size)
    }

    /// 执行轮转，旧的备份会被覆盖
    pub fn rotate_log(&self, log_file: &Path) -> Result<()> {
        if !log_file.exists() {
            return Ok(());
        }

        let mut backup = log_file.as_os_str().to_owned();
        backup.push(".bak");

        fs::rename(log_file, &backup).with_context(|| {
            format!("Failed to rename log file to backup: {}", backup.to_string_lossy())
        })?;

        let rotation_msg = format!(
            "{} - Log rotated, previous log backed up to {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            backup.to_string_lossy()
        );
        fs::write(log_file, rotation_msg)
            .with_context(|| format!("Failed to create new log file: {}", log_file.display()))?;

        Ok(())
    }

    pub fn check_and_rotate(&self, log_file: &Path) -> Result<bool> {
        if self.should_rotate(log_file)? {
            self.rotate_log(log_file)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotates_past_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("keepalive.log");
        fs::write(&log, vec![b'x'; 900 * 1024]).unwrap();

        let manager = LogRotationManager::new(1, None);
        assert!(manager.check_and_rotate(&log).unwrap());
        assert!(dir.path().join("keepalive.log.bak").exists());
        assert!(fs::read_to_string(&log).unwrap().contains("Log rotated"));
        assert!(!manager.check_and_rotate(&log).unwrap());
    }

    #[test]
    fn small_or_missing_file_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("keepalive.log");
        let manager = LogRotationManager::new(1, None);
        assert!(!manager.check_and_rotate(&log).unwrap());

        fs::write(&log, "short").unwrap();
        assert!(!manager.check_and_rotate(&log).unwrap());
        assert!(!dir.path().join("keepalive.log.bak").exists());
    }
}
