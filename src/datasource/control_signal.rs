use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::{
    datasource::file_path::{INJECT_MARKER_PREFIX, WATCH_MARKER_PREFIX},
    error::{KeepaliveError, Result},
    model::device::Mode,
};

static MARKER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(watch|inject)_(\d+)$").expect("marker regex is valid")
});

/// 外部请求：把指定 GPU 切换到某个模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSignal {
    pub device_id: u32,
    pub mode: Mode,
}

/// 控制信号通道，返回的每个信号都视为已消费
pub trait ControlChannel {
    fn poll_pending(&mut self) -> Vec<ControlSignal>;
}

/// 基于标记文件的控制通道：`watch_<id>` / `inject_<id>`
pub struct FileControlChannel {
    dir: PathBuf,
}

impl FileControlChannel {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| {
            KeepaliveError::Control(format!("failed to create {}: {e}", dir.display()))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ControlChannel for FileControlChannel {
    fn poll_pending(&mut self) -> Vec<ControlSignal> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Control dir {} unreadable: {e}", self.dir.display());
                return Vec::new();
            }
        };

        let mut signals = Vec::new();

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            // 点开头的是 signal 子命令写入中的临时文件
            if name.starts_with('.') {
                continue;
            }
            let Some(signal) = parse_marker(name) else {
                continue;
            };

            // 删除成功才算消费，保证同一个标记最多生效一次
            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    debug!("Consumed control marker {name}");
                    signals.push(signal);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to consume control marker {name}: {e}"),
            }
        }

        // 同一 GPU 同时有 inject 和 watch 时 watch 最后应用
        signals.sort_by_key(|s| (s.device_id, s.mode));
        signals
    }
}

pub fn parse_marker(name: &str) -> Option<ControlSignal> {
    let caps = MARKER_RE.captures(name)?;
    let device_id = caps[2].parse::<u32>().ok()?;
    let mode = match &caps[1] {
        "watch" => Mode::Watch,
        _ => Mode::Inject,
    };
    Some(ControlSignal { device_id, mode })
}

fn marker_name(mode: Mode, device_id: u32) -> String {
    match mode {
        Mode::Watch => format!("{WATCH_MARKER_PREFIX}{device_id}"),
        Mode::Inject => format!("{INJECT_MARKER_PREFIX}{device_id}"),
    }
}

/// 写入控制标记：先写临时文件再 rename，避免监控端读到半写的文件
pub fn write_signal<P: AsRef<Path>>(dir: P, mode: Mode, device_id: u32) -> Result<PathBuf> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).map_err(|e| {
        KeepaliveError::Control(format!("failed to create {}: {e}", dir.display()))
    })?;

    let name = marker_name(mode, device_id);
    let tmp = dir.join(format!(".{name}.{}.tmp", std::process::id()));
    let target = dir.join(&name);

    fs::write(&tmp, chrono::Local::now().to_rfc3339())
        .and_then(|()| fs::rename(&tmp, &target))
        .map_err(|e| {
            let _ = fs::remove_file(&tmp);
            KeepaliveError::Control(format!("failed to write {}: {e}", target.display()))
        })?;

    info!("Requested {mode} mode for GPU{device_id}: {}", target.display());
    Ok(target)
}
