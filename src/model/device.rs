use std::{
    fmt,
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use serde::Deserialize;

use crate::{
    datasource::config_parser::MonitorConfig,
    model::worker::{StopOutcome, Worker, WorkerLauncher},
};

/// GPU 工作模式
///
/// 排序决定同一轮控制信号的应用顺序，Watch 排在最后
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// 始终运行负载
    Inject,
    /// 观察真实负载，空闲超时后回到 Inject
    Watch,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Inject => write!(f, "inject"),
            Mode::Watch => write!(f, "watch"),
        }
    }
}

/// 空闲判定和 worker 生命周期参数
#[derive(Debug, Clone)]
pub struct IdlePolicy {
    pub idle_threshold: Duration,
    pub first_idle_threshold: Option<Duration>,
    pub worker_duration: Option<Duration>,
    pub stop_grace: Duration,
    pub spawn_retry: Duration,
}

impl From<&MonitorConfig> for IdlePolicy {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            idle_threshold: config.idle_threshold(),
            first_idle_threshold: config.first_idle_threshold(),
            worker_duration: config.worker_duration(),
            stop_grace: config.stop_grace(),
            spawn_retry: config.spawn_retry(),
        }
    }
}

/// 渲染用的只读快照
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSnapshot {
    pub id: u32,
    pub mode: Mode,
    pub util: u32,
    pub idle_elapsed: Option<Duration>,
    pub idle_threshold: Duration,
    pub worker_pid: Option<u32>,
    pub worker_remaining: Option<Duration>,
    pub last_error: Option<String>,
    pub stale: bool,
}

/// 单个 GPU 的状态机
///
/// 只由调度循环修改。任何时刻最多持有一个 worker。
pub struct Device {
    id: u32,
    mode: Mode,
    last_util: u32,
    idle_since: Option<Instant>,
    worker: Option<Box<dyn Worker>>,
    worker_deadline: Option<Instant>,
    first_trigger_consumed: bool,
    next_spawn_at: Option<Instant>,
    last_error: Option<String>,
    stale: bool,
}

impl Device {
    pub fn new(id: u32, util: u32, mode: Mode) -> Self {
        Self {
            id,
            mode,
            last_util: util,
            idle_since: None,
            worker: None,
            worker_deadline: None,
            first_trigger_consumed: false,
            next_spawn_at: None,
            last_error: None,
            stale: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    #[cfg(test)]
    pub fn last_util(&self) -> u32 {
        self.last_util
    }

    #[cfg(test)]
    pub fn idle_since(&self) -> Option<Instant> {
        self.idle_since
    }

    #[cfg(test)]
    pub fn has_worker(&self) -> bool {
        self.worker.is_some()
    }

    pub fn worker_pid(&self) -> Option<u32> {
        self.worker.as_ref().map(|w| w.pid())
    }

    #[cfg(test)]
    pub fn worker_deadline(&self) -> Option<Instant> {
        self.worker_deadline
    }

    #[cfg(test)]
    pub fn first_trigger_consumed(&self) -> bool {
        self.first_trigger_consumed
    }

    #[cfg(test)]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// 当前生效的空闲阈值
    pub fn threshold(&self, policy: &IdlePolicy) -> Duration {
        match policy.first_idle_threshold {
            Some(first) if !self.first_trigger_consumed => first,
            _ => policy.idle_threshold,
        }
    }

    /// 本轮遥测中缺失该 GPU，保留上次状态
    pub fn mark_stale(&mut self) {
        if !self.stale {
            warn!("[GPU{}] Missing from telemetry, keeping last state", self.id);
        }
        self.stale = true;
    }

    /// 处理一次利用率读数，必要时触发 Watch -> Inject
    pub fn observe(
        &mut self,
        util: u32,
        now: Instant,
        policy: &IdlePolicy,
        launcher: &mut dyn WorkerLauncher,
    ) {
        self.stale = false;
        self.last_util = util;

        if util != 0 {
            // 非零读数清空计时，不保留已累计的空闲时间
            if self.idle_since.take().is_some() {
                debug!("[GPU{}] Busy again (util={util}%), idle timer reset", self.id);
            }
            return;
        }

        if self.mode != Mode::Watch {
            return;
        }

        let since = *self.idle_since.get_or_insert(now);
        let idle = now.saturating_duration_since(since);
        let threshold = self.threshold(policy);

        if idle >= threshold {
            info!(
                "[GPU{}] Idle for {}s (threshold {}s), switching to inject mode",
                self.id,
                idle.as_secs(),
                threshold.as_secs()
            );
            self.first_trigger_consumed = true;
            self.enter_inject(now, policy, launcher);
        }
    }

    /// 应用外部控制信号，返回状态是否发生变化
    pub fn apply_signal(
        &mut self,
        mode: Mode,
        now: Instant,
        policy: &IdlePolicy,
        launcher: &mut dyn WorkerLauncher,
    ) -> bool {
        if self.mode == mode {
            debug!("[GPU{}] Already in {mode} mode, signal ignored", self.id);
            return false;
        }

        match mode {
            Mode::Watch => self.enter_watch(policy),
            Mode::Inject => self.enter_inject(now, policy, launcher),
        }
        info!("[GPU{}] Switched to {mode} mode by control signal", self.id);
        true
    }

    /// 回收超时或已退出的 worker；Inject 模式下补齐缺失的 worker
    pub fn maintain(&mut self, now: Instant, policy: &IdlePolicy, launcher: &mut dyn WorkerLauncher) {
        if let Some(deadline) = self.worker_deadline
            && now >= deadline
            && self.worker.is_some()
        {
            info!("[GPU{}] Worker time budget elapsed", self.id);
            self.stop_worker(policy.stop_grace);
        }

        if let Some(worker) = self.worker.as_mut()
            && !worker.is_alive()
        {
            let pid = worker.pid();
            warn!(
                "[GPU{}] Worker pid={pid} exited on its own, retrying in {}s",
                self.id,
                policy.spawn_retry.as_secs()
            );
            self.worker = None;
            self.worker_deadline = None;
            self.last_error = Some(format!("worker pid={pid} exited"));
            self.next_spawn_at = now.checked_add(policy.spawn_retry);
        }

        if self.mode == Mode::Inject
            && self.worker.is_none()
            && self.next_spawn_at.is_none_or(|at| now >= at)
        {
            self.start_worker(now, policy, launcher);
        }
    }

    /// 停止当前 worker，没有 worker 时返回 None
    pub fn stop_worker(&mut self, grace: Duration) -> Option<StopOutcome> {
        let mut worker = self.worker.take()?;
        self.worker_deadline = None;

        let pid = worker.pid();
        let outcome = worker.stop(grace);
        match outcome {
            StopOutcome::Graceful => info!("[GPU{}] Worker pid={pid} stopped", self.id),
            StopOutcome::Forced => warn!("[GPU{}] Worker pid={pid} killed", self.id),
        }
        Some(outcome)
    }

    pub fn snapshot(&self, now: Instant, policy: &IdlePolicy) -> DeviceSnapshot {
        let idle_elapsed = match (self.mode, self.idle_since) {
            (Mode::Watch, Some(since)) => Some(now.saturating_duration_since(since)),
            _ => None,
        };

        DeviceSnapshot {
            id: self.id,
            mode: self.mode,
            util: self.last_util,
            idle_elapsed,
            idle_threshold: self.threshold(policy),
            worker_pid: self.worker_pid(),
            worker_remaining: self
                .worker_deadline
                .filter(|_| self.worker.is_some())
                .map(|deadline| deadline.saturating_duration_since(now)),
            last_error: self.last_error.clone(),
            stale: self.stale,
        }
    }

    fn enter_inject(&mut self, now: Instant, policy: &IdlePolicy, launcher: &mut dyn WorkerLauncher) {
        self.stop_worker(policy.stop_grace);
        self.mode = Mode::Inject;
        self.idle_since = None;
        self.next_spawn_at = None;
        self.start_worker(now, policy, launcher);
    }

    fn enter_watch(&mut self, policy: &IdlePolicy) {
        self.stop_worker(policy.stop_grace);
        self.mode = Mode::Watch;
        self.idle_since = None;
        self.next_spawn_at = None;
        self.last_error = None;
    }

    fn start_worker(&mut self, now: Instant, policy: &IdlePolicy, launcher: &mut dyn WorkerLauncher) {
        // 保证同一 GPU 上不会出现两个 worker
        self.stop_worker(policy.stop_grace);

        match launcher.start(self.id, policy.worker_duration) {
            Ok(worker) => {
                self.worker_deadline = policy.worker_duration.and_then(|d| now.checked_add(d));
                self.worker = Some(worker);
                self.next_spawn_at = None;
                self.last_error = None;
            }
            Err(e) => {
                warn!("{e}, retrying in {}s", policy.spawn_retry.as_secs());
                self.last_error = Some(e.to_string());
                self.next_spawn_at = now.checked_add(policy.spawn_retry);
            }
        }
    }
}
