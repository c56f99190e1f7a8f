use std::{
    io::Read,
    os::unix::process::CommandExt,
    process::{Child, Command, Stdio},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, warn};

use crate::{
    datasource::file_path::NVIDIA_SMI_QUERY,
    error::{KeepaliveError, Result},
};

const QUERY_POLL_MS: u64 = 50;

/// 单次采样结果：(GPU 序号, 利用率%)
pub type UtilSample = (u32, u32);

/// GPU 利用率数据源，每个轮询周期调用一次
pub trait TelemetrySource {
    fn read(&mut self) -> Result<Vec<UtilSample>>;
}

/// 通过 nvidia-smi 查询所有 GPU 的利用率
///
/// 每次查询最多等待 `timeout`，超时后杀掉查询进程组并返回错误。
pub struct NvidiaSmi {
    command: String,
    timeout: Duration,
}

impl NvidiaSmi {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    fn unavailable(&self, reason: impl std::fmt::Display) -> KeepaliveError {
        KeepaliveError::TelemetryUnavailable(format!("{}: {reason}", self.command))
    }
}

// 管道在后台线程中读完，避免输出过多时子进程阻塞在 write 上
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

fn kill_group(child: &mut Child) {
    let pgid = child.id() as libc::pid_t;
    unsafe {
        if libc::kill(-pgid, libc::SIGKILL) != 0 {
            debug!(
                "kill(-{pgid}) failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

impl TelemetrySource for NvidiaSmi {
    fn read(&mut self) -> Result<Vec<UtilSample>> {
        let mut child = Command::new(&self.command)
            .args(NVIDIA_SMI_QUERY)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|e| self.unavailable(format_args!("failed to run: {e}")))?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => {
                    kill_group(&mut child);
                    return Err(self.unavailable(format_args!("failed to poll: {e}")));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                // 读取线程不再 join，残留的孙进程可能仍持有管道
                kill_group(&mut child);
                warn!("{} timed out, killed pid={}", self.command, child.id());
                return Err(self.unavailable(format_args!(
                    "timed out after {}s",
                    self.timeout.as_secs_f32()
                )));
            }
            thread::sleep((deadline - now).min(Duration::from_millis(QUERY_POLL_MS)));
        };

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr).trim().to_string();
            return Err(KeepaliveError::TelemetryUnavailable(if stderr.is_empty() {
                format!("{} exited with {status}", self.command)
            } else {
                stderr
            }));
        }

        Ok(parse_util_csv(&String::from_utf8_lossy(&stdout)))
    }
}

/// 解析 "index, utilization" 格式的输出
///
/// 无法解析的行（例如 `[N/A]`）直接跳过，利用率截断到 0-100。
pub fn parse_util_csv(raw: &str) -> Vec<UtilSample> {
    let mut samples = Vec::new();

    for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() != 2 {
            debug!("Skipping telemetry line: {line}");
            continue;
        }

        match (parts[0].parse::<u32>(), parts[1].parse::<u32>()) {
            (Ok(index), Ok(util)) => samples.push((index, util.min(100))),
            _ => debug!("Skipping telemetry line: {line}"),
        }
    }

    samples
}

#[cfg(test)]
mod tests {
    use std::{fs, os::unix::fs::PermissionsExt};

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn parses_nvidia_smi_output() {
        let raw = "0, 0\n1, 37\n2, 100\n";
        assert_eq!(parse_util_csv(raw), vec![(0, 0), (1, 37), (2, 100)]);
    }

    #[test]
    fn skips_blank_and_malformed_lines() {
        let raw = "\n0, 12\n1, [N/A]\nGPU lost\n3, 4, 5\n  \n4,9\n";
        assert_eq!(parse_util_csv(raw), vec![(0, 12), (4, 9)]);
    }

    #[test]
    fn clamps_utilization() {
        assert_eq!(parse_util_csv("0, 250"), vec![(0, 100)]);
    }

    #[test]
    fn missing_binary_is_telemetry_unavailable() {
        let mut source = NvidiaSmi::new("/nonexistent/nvidia-smi", TIMEOUT);
        assert!(matches!(
            source.read(),
            Err(KeepaliveError::TelemetryUnavailable(_))
        ));
    }

    #[test]
    fn failing_command_is_telemetry_unavailable() {
        let mut source = NvidiaSmi::new("false", TIMEOUT);
        assert!(matches!(
            source.read(),
            Err(KeepaliveError::TelemetryUnavailable(_))
        ));
    }

    #[test]
    fn reads_from_query_command() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("smi");
        fs::write(&script, "#!/bin/sh\nprintf '0, 0\\n1, 55\\n'\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let mut source = NvidiaSmi::new(script.to_string_lossy(), TIMEOUT);
        assert_eq!(source.read().unwrap(), vec![(0, 0), (1, 55)]);
    }

    #[test]
    fn hung_query_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("smi");
        fs::write(&script, "#!/bin/sh\nsleep 20\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let mut source = NvidiaSmi::new(script.to_string_lossy(), Duration::from_millis(500));
        let started = Instant::now();
        let err = source.read().unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(&err, KeepaliveError::TelemetryUnavailable(m) if m.contains("timed out")));
    }
}
