use std::{
    collections::HashMap,
    io::Write,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

use chrono::Local;
use log::{debug, info, warn};

use crate::{
    datasource::{
        config_parser::MonitorConfig, control_signal::ControlChannel, telemetry::TelemetrySource,
    },
    error::{KeepaliveError, Result},
    model::{
        dashboard::{DashboardRenderer, TelemetryHealth, build_frame},
        device::{Device, DeviceSnapshot, IdlePolicy, Mode},
        worker::WorkerLauncher,
    },
    utils::constants::SLEEP_SLICE_MS,
};

/// 调度器：拉取控制信号和遥测，推进每个 GPU 的状态机
pub struct Scheduler<T, L, C> {
    devices: Vec<Device>,
    telemetry: T,
    launcher: L,
    control: C,
    policy: IdlePolicy,
    health: TelemetryHealth,
}

impl<T, L, C> Scheduler<T, L, C>
where
    T: TelemetrySource,
    L: WorkerLauncher,
    C: ControlChannel,
{
    /// 通过一次遥测枚举 GPU，之后不再增减
    pub fn discover(
        mut telemetry: T,
        launcher: L,
        control: C,
        config: &MonitorConfig,
    ) -> Result<Self> {
        let mut samples = telemetry.read()?;
        samples.sort_by_key(|&(id, _)| id);
        samples.dedup_by_key(|&mut (id, _)| id);

        if samples.is_empty() {
            return Err(KeepaliveError::NoDevicesDetected);
        }

        let devices: Vec<Device> = samples
            .iter()
            .map(|&(id, util)| Device::new(id, util, config.initial_mode))
            .collect();

        info!(
            "Detected GPUs {:?}, initial mode {}",
            devices.iter().map(Device::id).collect::<Vec<_>>(),
            config.initial_mode
        );

        Ok(Self {
            devices,
            telemetry,
            launcher,
            control,
            policy: IdlePolicy::from(config),
            health: TelemetryHealth::default(),
        })
    }

    #[cfg(test)]
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    #[cfg(test)]
    pub fn health(&self) -> &TelemetryHealth {
        &self.health
    }

    /// 启动时为 Inject 模式的 GPU 拉起 worker
    pub fn start(&mut self, now: Instant) {
        self.maintain_workers(now);
    }

    /// 一个轮询周期：控制信号 -> 遥测与空闲判定 -> worker 维护
    pub fn tick(&mut self, now: Instant) {
        self.apply_control_signals(now);
        self.poll_telemetry(now);
        self.maintain_workers(now);
    }

    fn apply_control_signals(&mut self, now: Instant) {
        for signal in self.control.poll_pending() {
            match self.devices.iter_mut().find(|d| d.id() == signal.device_id) {
                Some(device) => {
                    device.apply_signal(signal.mode, now, &self.policy, &mut self.launcher);
                }
                None => warn!(
                    "Control signal for unknown GPU{} ({} mode) dropped",
                    signal.device_id, signal.mode
                ),
            }
        }
    }

    fn poll_telemetry(&mut self, now: Instant) {
        let samples = match self.telemetry.read() {
            Ok(samples) => samples,
            Err(e) => {
                // 失败时不伪造 0 读数，本轮跳过
                self.health.consecutive_failures += 1;
                if self.health.consecutive_failures == 1 {
                    warn!("{e}, skipping tick");
                } else {
                    debug!("{e} ({} in a row)", self.health.consecutive_failures);
                }
                self.health.last_error = Some(e.to_string());
                return;
            }
        };

        if self.health.consecutive_failures > 0 {
            info!(
                "Telemetry recovered after {} failed reads",
                self.health.consecutive_failures
            );
            self.health = TelemetryHealth::default();
        }

        let utils: HashMap<u32, u32> = samples.into_iter().collect();
        for device in &mut self.devices {
            match utils.get(&device.id()) {
                Some(&util) => device.observe(util, now, &self.policy, &mut self.launcher),
                None => device.mark_stale(),
            }
        }
    }

    fn maintain_workers(&mut self, now: Instant) {
        for device in &mut self.devices {
            device.maintain(now, &self.policy, &mut self.launcher);
        }
    }

    pub fn snapshots(&self, now: Instant) -> Vec<DeviceSnapshot> {
        self.devices
            .iter()
            .map(|d| d.snapshot(now, &self.policy))
            .collect()
    }

    pub fn frame(&self, now: Instant) -> Vec<String> {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        build_frame(&timestamp, &self.snapshots(now), &self.health)
    }

    /// 停止所有 worker，总耗时不超过 `timeout`；返回停止的数量
    pub fn shutdown(&mut self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut stopped = 0;

        for device in &mut self.devices {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let grace = self.policy.stop_grace.min(remaining);
            if device.stop_worker(grace).is_some() {
                stopped += 1;
            }
        }

        info!("Stopped {stopped} worker(s)");
        stopped
    }

    pub fn count_mode(&self, mode: Mode) -> usize {
        self.devices.iter().filter(|d| d.mode() == mode).count()
    }
}

/// 按切片休眠，收到中断后尽快返回
fn sleep_while_running(total: Duration, running: &AtomicBool) {
    let deadline = Instant::now() + total;
    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(SLEEP_SLICE_MS)));
    }
}

/// 调度主循环，直到 `running` 被置为 false
pub fn run<T, L, C, W>(
    scheduler: &mut Scheduler<T, L, C>,
    config: &MonitorConfig,
    running: &AtomicBool,
    renderer: &mut DashboardRenderer,
    out: &mut W,
) where
    T: TelemetrySource,
    L: WorkerLauncher,
    C: ControlChannel,
    W: Write,
{
    let mut last_dashboard: Option<Instant> = None;

    scheduler.start(Instant::now());

    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        scheduler.tick(now);

        if last_dashboard.is_none_or(|t| now.duration_since(t) >= config.dashboard_interval()) {
            if let Err(e) = renderer.render(out, &scheduler.frame(now)) {
                warn!("Failed to render dashboard: {e}");
            }
            last_dashboard = Some(now);
        }

        sleep_while_running(config.poll_interval(), running);
    }

    renderer.detach();
    info!(
        "Interrupted, stopping workers (inject={}, watch={})",
        scheduler.count_mode(Mode::Inject),
        scheduler.count_mode(Mode::Watch)
    );
    scheduler.shutdown(config.shutdown_timeout());
}
