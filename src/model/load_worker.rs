use std::{
    ffi::CString,
    io,
    process::{Command, Stdio},
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

use log::{error, info, warn};

use crate::{
    datasource::{
        file_path::{DEVICE_ENV, VISIBLE_DEVICES_ENV},
        telemetry::TelemetrySource,
    },
    model::worker::{ProcessWorker, StopOutcome, Worker},
    utils::constants::{SLEEP_SLICE_MS, exit_code},
};

/// 单次 worker 调用参数
pub struct LoadJob<'a> {
    pub gpu_id: u32,
    pub command: &'a [String],
    pub duration: Option<Duration>,
    pub stop_grace: Duration,
    /// 进程名模板，`{id}` 替换为 GPU 序号
    pub process_name: &'a str,
}

// 内核 comm 字段上限，不含结尾的 NUL
const COMM_MAX_LEN: usize = 15;

/// 展开进程名模板并截断到 comm 长度上限
pub fn worker_process_name(template: &str, gpu_id: u32) -> String {
    let mut name = template.replace("{id}", &gpu_id.to_string());
    if name.len() > COMM_MAX_LEN {
        let mut end = COMM_MAX_LEN;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
    name
}

/// 设置调用线程的名称，主线程上即为进程在 ps/top 中显示的名字
pub fn set_process_name(name: &str) -> io::Result<()> {
    let name = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let ret = unsafe {
        libc::prctl(
            libc::PR_SET_NAME,
            name.as_ptr() as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// 在指定 GPU 上运行负载程序，返回进程退出码
///
/// 能力检查失败返回非零；到达时间预算或收到终止信号时停止负载并返回 0，
/// 负载程序自行失败时透传它的退出码。
pub fn run_worker(
    job: &LoadJob<'_>,
    telemetry: &mut dyn TelemetrySource,
    running: &AtomicBool,
) -> u8 {
    let gpu_id = job.gpu_id;

    let Some((program, args)) = job.command.split_first() else {
        error!("[GPU{gpu_id}] No load command configured ([worker] command)");
        return exit_code::NO_LOAD_COMMAND;
    };

    match telemetry.read() {
        Ok(samples) if samples.iter().any(|&(id, _)| id == gpu_id) => {}
        Ok(samples) => {
            error!(
                "[GPU{gpu_id}] Out of range, available: {:?}",
                samples.iter().map(|&(id, _)| id).collect::<Vec<_>>()
            );
            return exit_code::INVALID_INDEX;
        }
        Err(e) => {
            error!("[GPU{gpu_id}] {e}");
            return exit_code::TELEMETRY_UNAVAILABLE;
        }
    }

    let name = worker_process_name(job.process_name, gpu_id);
    if let Err(e) = set_process_name(&name) {
        warn!("[GPU{gpu_id}] Failed to set process name {name}: {e}");
    }

    // 与本进程同组，监控端对进程组发出的 SIGTERM 会同时到达负载程序
    let child = match Command::new(program)
        .args(args)
        .env(VISIBLE_DEVICES_ENV, gpu_id.to_string())
        .env(DEVICE_ENV, gpu_id.to_string())
        .stdin(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            error!("[GPU{gpu_id}] Failed to run load command {program}: {e}");
            return exit_code::NO_LOAD_COMMAND;
        }
    };

    let mut load = ProcessWorker::single(child);
    let deadline = job.duration.and_then(|d| Instant::now().checked_add(d));
    info!(
        "[GPU{gpu_id}] Load pid={} started, budget={}",
        load.pid(),
        job.duration
            .map(|d| format!("{}s", d.as_secs()))
            .unwrap_or_else(|| "unbounded".to_string())
    );

    loop {
        if let Some(code) = load.exit_code() {
            if code != 0 {
                error!("[GPU{gpu_id}] Load command exited with {code}");
            }
            return u8::try_from(code).unwrap_or(1);
        }

        let expired = deadline.is_some_and(|d| Instant::now() >= d);
        if expired || !running.load(Ordering::SeqCst) {
            let outcome = load.stop(job.stop_grace);
            info!(
                "[GPU{gpu_id}] Load stopped ({}, {})",
                if expired { "budget elapsed" } else { "terminated" },
                match outcome {
                    StopOutcome::Graceful => "graceful",
                    StopOutcome::Forced => "forced",
                }
            );
            return 0;
        }

        thread::sleep(Duration::from_millis(SLEEP_SLICE_MS));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testing::FakeTelemetry;

    fn job(command: &[String], duration: Option<u64>) -> LoadJob<'_> {
        LoadJob {
            gpu_id: 1,
            command,
            duration: duration.map(Duration::from_secs),
            stop_grace: Duration::from_secs(2),
            process_name: "keepalive-gpu{id}",
        }
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    fn telemetry_with(ids: &[u32]) -> FakeTelemetry {
        let t = FakeTelemetry::default();
        t.push(ids.iter().map(|&id| (id, 0)).collect());
        t
    }

    #[test]
    fn missing_command_fails_capability_check() {
        let running = AtomicBool::new(true);
        let mut t = telemetry_with(&[0, 1]);
        assert_eq!(run_worker(&job(&[], None), &mut t, &running), exit_code::NO_LOAD_COMMAND);
    }

    #[test]
    fn invalid_index_fails_capability_check() {
        let running = AtomicBool::new(true);
        let mut t = telemetry_with(&[0]);
        let cmd = sh("exit 0");
        assert_eq!(run_worker(&job(&cmd, None), &mut t, &running), exit_code::INVALID_INDEX);
    }

    #[test]
    fn telemetry_failure_fails_capability_check() {
        let running = AtomicBool::new(true);
        let mut t = FakeTelemetry::default();
        t.push_failure();
        let cmd = sh("exit 0");
        assert_eq!(
            run_worker(&job(&cmd, None), &mut t, &running),
            exit_code::TELEMETRY_UNAVAILABLE
        );
    }

    #[test]
    fn load_sees_its_device() {
        let running = AtomicBool::new(true);
        let mut t = telemetry_with(&[0, 1]);
        let cmd = sh("[ \"$CUDA_VISIBLE_DEVICES\" = 1 ] && [ \"$GPU_KEEPALIVE_DEVICE\" = 1 ]");
        assert_eq!(run_worker(&job(&cmd, None), &mut t, &running), 0);
    }

    #[test]
    fn load_failure_code_is_propagated() {
        let running = AtomicBool::new(true);
        let mut t = telemetry_with(&[1]);
        let cmd = sh("exit 7");
        assert_eq!(run_worker(&job(&cmd, None), &mut t, &running), 7);
    }

    #[test]
    fn budget_stops_long_running_load() {
        let running = AtomicBool::new(true);
        let mut t = telemetry_with(&[1]);
        let cmd = sh("exec sleep 30");
        let started = Instant::now();
        assert_eq!(run_worker(&job(&cmd, Some(1)), &mut t, &running), 0);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn process_name_is_expanded_and_truncated() {
        assert_eq!(worker_process_name("keepalive-gpu{id}", 3), "keepalive-gpu3");
        assert_eq!(worker_process_name("VLLM-[GPU{id}]", 12), "VLLM-[GPU12]");
        assert_eq!(worker_process_name("keepalive-gpu{id}", 123), "keepalive-gpu12");
        assert_eq!(worker_process_name("显卡保活进程{id}", 0), "显卡保活进");
    }

    #[test]
    fn process_name_is_visible_in_comm() {
        // 在独立线程里改名，不影响测试线程
        let comm = thread::spawn(|| {
            set_process_name("keepalive-gpu7").unwrap();
            std::fs::read_to_string("/proc/thread-self/comm").unwrap()
        })
        .join()
        .unwrap();
        assert_eq!(comm.trim_end(), "keepalive-gpu7");
    }

    #[test]
    fn termination_stops_load() {
        let running = AtomicBool::new(false);
        let mut t = telemetry_with(&[1]);
        let cmd = sh("exec sleep 30");
        assert_eq!(run_worker(&job(&cmd, None), &mut t, &running), 0);
    }
}
