use std::{
    collections::HashMap,
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};
use log::debug;

const WAIT_RECREATE_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct SimpleEvent {
    pub mask: EventMask,
    pub name: Option<String>,
}

/// 目录监控，目录被删除后会重建并重新添加监控
pub struct InotifyWatcher {
    inotify: Inotify,
    watches: HashMap<WatchDescriptor, (PathBuf, WatchMask)>,
}

impl InotifyWatcher {
    pub fn new() -> Result<Self> {
        let inotify = Inotify::init().with_context(|| "Failed to initialize inotify")?;

        Ok(Self {
            inotify,
            watches: HashMap::new(),
        })
    }

    pub fn add_dir<P: AsRef<Path>>(&mut self, dir: P, mask: WatchMask) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create watch dir: {}", dir.display()))?;

        let mask = mask | WatchMask::DELETE_SELF | WatchMask::MOVE_SELF;
        let wd = self
            .inotify
            .watches()
            .add(dir, mask)
            .with_context(|| format!("Failed to add watch for: {}", dir.display()))?;

        self.watches.insert(wd, (dir.to_path_buf(), mask));
        Ok(())
    }

    /// 阻塞等待事件
    pub fn wait_and_handle(&mut self) -> Result<Vec<SimpleEvent>> {
        let mut buffer = [0; 4096];
        let events = self
            .inotify
            .read_events_blocking(&mut buffer)
            .with_context(|| "Failed to read inotify events")?;

        let mut simple_events = Vec::new();
        let mut lost = Vec::new();

        for event in events {
            if event.mask.contains(EventMask::IGNORED)
                || event.mask.contains(EventMask::DELETE_SELF)
                || event.mask.contains(EventMask::MOVE_SELF)
            {
                lost.push(event.wd.clone());
            }
            simple_events.push(SimpleEvent {
                mask: event.mask,
                name: event.name.map(|n: &OsStr| n.to_string_lossy().into_owned()),
            });
        }

        for wd in lost {
            self.rewatch(wd)?;
        }

        Ok(simple_events)
    }

    fn rewatch(&mut self, wd: WatchDescriptor) -> Result<()> {
        let Some((dir, mask)) = self.watches.remove(&wd) else {
            return Ok(());
        };

        // 稍作等待，让文件系统操作完成
        thread::sleep(Duration::from_millis(WAIT_RECREATE_MS));
        debug!("Re-watching {}", dir.display());
        self.add_dir(&dir, mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_file_events_in_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = InotifyWatcher::new().unwrap();
        watcher
            .add_dir(dir.path(), WatchMask::CLOSE_WRITE | WatchMask::MOVED_TO)
            .unwrap();

        fs::write(dir.path().join("log_level"), "debug").unwrap();

        let events = watcher.wait_and_handle().unwrap();
        assert!(
            events
                .iter()
                .any(|e| e.name.as_deref() == Some("log_level"))
        );
    }
}
