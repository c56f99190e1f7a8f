//! 测试用的假 worker / 数据源 / 控制通道

use std::{
    cell::RefCell,
    collections::VecDeque,
    rc::Rc,
    time::Duration,
};

use crate::{
    datasource::{
        control_signal::{ControlChannel, ControlSignal},
        telemetry::{TelemetrySource, UtilSample},
    },
    error::{KeepaliveError, Result},
    model::worker::{StopOutcome, Worker, WorkerLauncher},
};

#[derive(Default)]
pub struct WorkerLog {
    pub starts: Vec<(u32, Option<Duration>)>,
    pub stops: Vec<u32>,
    /// 存活 worker 的 pid
    pub alive: Vec<u32>,
    pub next_pid: u32,
    /// 大于 0 时下一次 start 失败
    pub fail_next: usize,
}

impl WorkerLog {
    pub fn live_count(&self) -> usize {
        self.alive.len()
    }

    /// 模拟 worker 自行退出
    pub fn exit(&mut self, pid: u32) {
        self.alive.retain(|&p| p != pid);
    }
}

pub struct FakeWorker {
    pid: u32,
    log: Rc<RefCell<WorkerLog>>,
}

impl Worker for FakeWorker {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&mut self) -> bool {
        self.log.borrow().alive.contains(&self.pid)
    }

    fn stop(&mut self, _grace: Duration) -> StopOutcome {
        let mut log = self.log.borrow_mut();
        log.stops.push(self.pid);
        log.exit(self.pid);
        StopOutcome::Graceful
    }
}

#[derive(Clone, Default)]
pub struct FakeLauncher {
    pub log: Rc<RefCell<WorkerLog>>,
}

impl WorkerLauncher for FakeLauncher {
    fn start(&mut self, device_id: u32, duration: Option<Duration>) -> Result<Box<dyn Worker>> {
        let mut log = self.log.borrow_mut();
        if log.fail_next > 0 {
            log.fail_next -= 1;
            return Err(KeepaliveError::WorkerSpawnFailed {
                device: device_id,
                reason: "fake spawn failure".into(),
            });
        }
        log.next_pid += 1;
        let pid = 1000 + log.next_pid;
        log.starts.push((device_id, duration));
        log.alive.push(pid);
        Ok(Box::new(FakeWorker {
            pid,
            log: self.log.clone(),
        }))
    }
}

/// 按顺序返回预设读数，读完后返回失败
#[derive(Clone, Default)]
pub struct FakeTelemetry {
    pub readings: Rc<RefCell<VecDeque<Result<Vec<UtilSample>>>>>,
}

impl FakeTelemetry {
    pub fn push(&self, reading: Vec<UtilSample>) {
        self.readings.borrow_mut().push_back(Ok(reading));
    }

    pub fn push_failure(&self) {
        self.readings
            .borrow_mut()
            .push_back(Err(KeepaliveError::TelemetryUnavailable("fake".into())));
    }
}

impl TelemetrySource for FakeTelemetry {
    fn read(&mut self) -> Result<Vec<UtilSample>> {
        self.readings
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(KeepaliveError::TelemetryUnavailable("no reading".into())))
    }
}

#[derive(Clone, Default)]
pub struct FakeControl {
    pub pending: Rc<RefCell<Vec<ControlSignal>>>,
}

impl ControlChannel for FakeControl {
    fn poll_pending(&mut self) -> Vec<ControlSignal> {
        std::mem::take(&mut *self.pending.borrow_mut())
    }
}
