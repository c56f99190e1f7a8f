use std::{
    io::{self, IsTerminal, Write},
    time::Duration,
};

use crate::model::device::{DeviceSnapshot, Mode};

const CURSOR_UP_ERASE_LINE: &str = "\x1b[1A\x1b[2K";

/// 遥测健康状况，显示在标题行
#[derive(Debug, Clone, Default)]
pub struct TelemetryHealth {
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// 把秒数格式化为 1h5m / 3m20s / 42s
pub fn fmt_time(d: Duration) -> String {
    let secs = d.as_secs();
    if secs == 0 {
        return "0s".to_string();
    }
    let (h, rem) = (secs / 3600, secs % 3600);
    let (m, s) = (rem / 60, rem % 60);
    if h > 0 {
        format!("{h}h{m}m")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{s}s")
    }
}

/// 剩余时间格式 HH:MM:SS
pub fn fmt_eta(d: Duration) -> String {
    let secs = d.as_secs();
    if secs == 0 {
        return "now".to_string();
    }
    format!("{:02}:{:02}:{:02}", secs / 3600, secs % 3600 / 60, secs % 60)
}

pub fn device_line(dev: &DeviceSnapshot) -> String {
    let mut line = match dev.mode {
        Mode::Inject => match dev.worker_pid {
            Some(pid) => {
                let mut s = format!("  [GPU{}] INJECT pid={pid} util={}%", dev.id, dev.util);
                if let Some(rem) = dev.worker_remaining {
                    s.push_str(&format!(" rem={}", fmt_eta(rem)));
                }
                s
            }
            None => match &dev.last_error {
                Some(err) => format!("  [GPU{}] INJECT no worker util={}% ERR {err}", dev.id, dev.util),
                None => format!("  [GPU{}] INJECT starting util={}%", dev.id, dev.util),
            },
        },
        Mode::Watch => match dev.idle_elapsed {
            Some(idle) if dev.util == 0 => format!(
                "  [GPU{}] WATCH idle {} / {} (remaining {})",
                dev.id,
                fmt_time(idle),
                fmt_time(dev.idle_threshold),
                fmt_time(dev.idle_threshold.saturating_sub(idle))
            ),
            _ => format!("  [GPU{}] WATCH busy util={}%", dev.id, dev.util),
        },
    };

    if dev.stale {
        line.push_str(" [stale]");
    }
    line
}

/// 生成一帧：一行标题 + 每个 GPU 一行
pub fn build_frame(timestamp: &str, devices: &[DeviceSnapshot], health: &TelemetryHealth) -> Vec<String> {
    let inject = devices.iter().filter(|d| d.mode == Mode::Inject).count();
    let watch = devices.len() - inject;

    let telemetry = if health.consecutive_failures == 0 {
        "ok".to_string()
    } else {
        format!(
            "ERR x{} ({})",
            health.consecutive_failures,
            health.last_error.as_deref().unwrap_or("unknown")
        )
    };

    let mut lines = Vec::with_capacity(devices.len() + 1);
    lines.push(format!(
        "[{timestamp}] GPU keepalive inject={inject} watch={watch} telemetry={telemetry}"
    ));
    lines.extend(devices.iter().map(device_line));
    lines
}

/// 仪表盘输出，终端上原地重绘，否则追加
pub struct DashboardRenderer {
    previous_frame_line_count: usize,
    in_place: bool,
}

impl DashboardRenderer {
    pub fn new(in_place: bool) -> Self {
        Self {
            previous_frame_line_count: 0,
            in_place,
        }
    }

    pub fn for_stdout() -> Self {
        Self::new(io::stdout().is_terminal())
    }

    #[cfg(test)]
    pub fn previous_frame_line_count(&self) -> usize {
        self.previous_frame_line_count
    }

    pub fn render<W: Write>(&mut self, out: &mut W, lines: &[String]) -> io::Result<()> {
        if self.in_place {
            for _ in 0..self.previous_frame_line_count {
                out.write_all(CURSOR_UP_ERASE_LINE.as_bytes())?;
            }
        }
        for line in lines {
            writeln!(out, "{line}")?;
        }
        out.flush()?;
        self.previous_frame_line_count = lines.len();
        Ok(())
    }

    /// 帧之外插入了其他输出（例如退出提示），下一帧不再擦除
    pub fn detach(&mut self) {
        self.previous_frame_line_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(id: u32, mode: Mode) -> DeviceSnapshot {
        DeviceSnapshot {
            id,
            mode,
            util: 0,
            idle_elapsed: None,
            idle_threshold: Duration::from_secs(3300),
            worker_pid: None,
            worker_remaining: None,
            last_error: None,
            stale: false,
        }
    }

    #[test]
    fn formats_durations() {
        assert_eq!(fmt_time(Duration::ZERO), "0s");
        assert_eq!(fmt_time(Duration::from_secs(42)), "42s");
        assert_eq!(fmt_time(Duration::from_secs(200)), "3m20s");
        assert_eq!(fmt_time(Duration::from_secs(3300)), "55m0s");
        assert_eq!(fmt_time(Duration::from_secs(3900)), "1h5m");
        assert_eq!(fmt_eta(Duration::ZERO), "now");
        assert_eq!(fmt_eta(Duration::from_secs(299)), "00:04:59");
    }

    #[test]
    fn device_lines_describe_state() {
        let mut inject = snap(0, Mode::Inject);
        inject.worker_pid = Some(4242);
        inject.util = 99;
        inject.worker_remaining = Some(Duration::from_secs(61));
        assert_eq!(device_line(&inject), "  [GPU0] INJECT pid=4242 util=99% rem=00:01:01");

        inject.worker_remaining = None;
        assert_eq!(device_line(&inject), "  [GPU0] INJECT pid=4242 util=99%");

        let mut failed = snap(1, Mode::Inject);
        failed.last_error = Some("spawn failed".into());
        assert_eq!(device_line(&failed), "  [GPU1] INJECT no worker util=0% ERR spawn failed");

        let mut idle = snap(2, Mode::Watch);
        idle.idle_elapsed = Some(Duration::from_secs(65));
        assert_eq!(
            device_line(&idle),
            "  [GPU2] WATCH idle 1m5s / 55m0s (remaining 53m55s)"
        );

        let mut busy = snap(3, Mode::Watch);
        busy.util = 37;
        busy.stale = true;
        assert_eq!(device_line(&busy), "  [GPU3] WATCH busy util=37% [stale]");
    }

    #[test]
    fn frame_has_header_plus_one_line_per_device() {
        let devices = vec![snap(0, Mode::Inject), snap(1, Mode::Watch), snap(2, Mode::Watch)];
        let health = TelemetryHealth {
            consecutive_failures: 2,
            last_error: Some("nvidia-smi timeout".into()),
        };
        let frame = build_frame("2026-01-01 00:00:00", &devices, &health);
        assert_eq!(frame.len(), 4);
        assert_eq!(
            frame[0],
            "[2026-01-01 00:00:00] GPU keepalive inject=1 watch=2 telemetry=ERR x2 (nvidia-smi timeout)"
        );
    }

    #[test]
    fn in_place_redraw_erases_previous_frame() {
        let mut renderer = DashboardRenderer::new(true);
        let mut out = Vec::new();

        renderer.render(&mut out, &["a".into(), "b".into(), "c".into()]).unwrap();
        assert_eq!(String::from_utf8(out.clone()).unwrap(), "a\nb\nc\n");
        assert_eq!(renderer.previous_frame_line_count(), 3);

        out.clear();
        renderer.render(&mut out, &["x".into(), "y".into()]).unwrap();
        let expected = format!("{}x\ny\n", CURSOR_UP_ERASE_LINE.repeat(3));
        assert_eq!(String::from_utf8(out.clone()).unwrap(), expected);

        out.clear();
        renderer.render(&mut out, &["z".into()]).unwrap();
        let expected = format!("{}z\n", CURSOR_UP_ERASE_LINE.repeat(2));
        assert_eq!(String::from_utf8(out).unwrap(), expected);
    }

    #[test]
    fn non_terminal_output_appends() {
        let mut renderer = DashboardRenderer::new(false);
        let mut out = Vec::new();
        renderer.render(&mut out, &["a".into()]).unwrap();
        renderer.render(&mut out, &["b".into()]).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "a\nb\n");
    }
}
