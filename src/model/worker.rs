use std::{
    env,
    os::unix::process::CommandExt,
    path::PathBuf,
    process::{Child, Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use crate::error::{KeepaliveError, Result};

const STOP_POLL_MS: u64 = 50;

/// 停止 worker 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// 在宽限期内自行退出
    Graceful,
    /// 超时后被强制杀死
    Forced,
}

/// 负载 worker 句柄
pub trait Worker {
    fn pid(&self) -> u32;

    /// 非阻塞检查进程是否仍在运行
    fn is_alive(&mut self) -> bool;

    /// 先请求退出，超过 `grace` 后强制终止，并且总是回收进程
    fn stop(&mut self, grace: Duration) -> StopOutcome;
}

/// 负责在指定 GPU 上启动 worker
pub trait WorkerLauncher {
    fn start(&mut self, device_id: u32, duration: Option<Duration>) -> Result<Box<dyn Worker>>;
}

/// 由本进程启动的 worker 子进程
pub struct ProcessWorker {
    child: Child,
    group: bool,
    reaped: bool,
}

impl ProcessWorker {
    /// 子进程必须以 `process_group(0)` 启动，停止时会向整个进程组发信号
    pub fn new(child: Child) -> Self {
        Self {
            child,
            group: true,
            reaped: false,
        }
    }

    /// 与本进程同组的子进程，只向它自己发信号
    pub fn single(child: Child) -> Self {
        Self {
            child,
            group: false,
            reaped: false,
        }
    }

    pub fn exit_code(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.reaped = true;
                Some(status.code().unwrap_or(-1))
            }
            _ => None,
        }
    }

    fn send_signal(&self, signal: libc::c_int) {
        let pid = self.child.id() as libc::pid_t;
        let target = if self.group { -pid } else { pid };
        unsafe {
            if libc::kill(target, signal) != 0 {
                debug!(
                    "kill({target}, {signal}) failed: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }

    fn wait_until(&mut self, deadline: Instant) -> bool {
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!("Worker pid={} exited: {status}", self.child.id());
                    self.reaped = true;
                    return true;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Failed to poll worker pid={}: {e}", self.child.id());
                    return false;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(STOP_POLL_MS)));
        }
    }
}

impl Worker for ProcessWorker {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        if self.reaped {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!("Worker pid={} exited: {status}", self.child.id());
                self.reaped = true;
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!("Failed to poll worker pid={}: {e}", self.child.id());
                false
            }
        }
    }

    fn stop(&mut self, grace: Duration) -> StopOutcome {
        if !self.is_alive() {
            return StopOutcome::Graceful;
        }

        self.send_signal(libc::SIGTERM);
        if self.wait_until(Instant::now() + grace) {
            return StopOutcome::Graceful;
        }

        warn!(
            "{}",
            KeepaliveError::WorkerStopTimeout {
                pid: self.child.id(),
                grace,
            }
        );
        self.send_signal(libc::SIGKILL);
        if let Err(e) = self.child.kill() {
            debug!("Direct kill of pid={} failed: {e}", self.child.id());
        }
        match self.child.wait() {
            Ok(status) => debug!("Worker pid={} reaped: {status}", self.child.id()),
            Err(e) => warn!("Failed to reap worker pid={}: {e}", self.child.id()),
        }
        self.reaped = true;
        StopOutcome::Forced
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        if !self.reaped && self.is_alive() {
            warn!("Worker pid={} dropped while running, killing", self.child.id());
            self.send_signal(libc::SIGKILL);
            let _ = self.child.wait();
        }
    }
}

/// 通过重新执行自身的 `worker` 子命令启动负载进程
pub struct ProcessLauncher {
    program: PathBuf,
    base_args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: PathBuf, base_args: Vec<String>) -> Self {
        Self { program, base_args }
    }

    /// 使用当前可执行文件，`config` 会透传给 worker
    pub fn current_exe(config: Option<PathBuf>) -> Result<Self> {
        let program = env::current_exe()
            .map_err(|e| KeepaliveError::Config(format!("cannot resolve current executable: {e}")))?;
        let mut base_args = Vec::new();
        if let Some(config) = config {
            base_args.push("--config".to_string());
            base_args.push(config.display().to_string());
        }
        Ok(Self::new(program, base_args))
    }

    pub fn worker_args(&self, device_id: u32, duration: Option<Duration>) -> Vec<String> {
        let mut args = self.base_args.clone();
        args.push("worker".to_string());
        args.push("--gpu-id".to_string());
        args.push(device_id.to_string());
        if let Some(duration) = duration {
            args.push("--seconds".to_string());
            args.push(duration.as_secs().to_string());
        }
        args
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn start(&mut self, device_id: u32, duration: Option<Duration>) -> Result<Box<dyn Worker>> {
        let args = self.worker_args(device_id, duration);
        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|e| KeepaliveError::WorkerSpawnFailed {
                device: device_id,
                reason: e.to_string(),
            })?;

        info!("[GPU{device_id}] Worker started pid={}", child.id());
        Ok(Box::new(ProcessWorker::new(child)))
    }
}
