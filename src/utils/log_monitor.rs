use std::path::PathBuf;

use anyhow::{Context, Result};
use inotify::WatchMask;
use log::{debug, info};

use crate::{
    datasource::file_path::LOG_LEVEL_THREAD,
    utils::{inotify::InotifyWatcher, logger::update_log_level},
};

/// 监控日志等级文件，内容变化后立即生效
pub fn monitor_log_level(level_file: PathBuf) -> Result<()> {
    info!("{LOG_LEVEL_THREAD} Start");

    let dir = level_file
        .parent()
        .with_context(|| format!("Invalid log level path: {}", level_file.display()))?
        .to_path_buf();
    let name = level_file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("Invalid log level path: {}", level_file.display()))?;

    info!("Using log level path: {}", level_file.display());

    // 监控所在目录，文件被删除重建后依然有效
    let mut inotify = InotifyWatcher::new()?;
    inotify.add_dir(&dir, WatchMask::CLOSE_WRITE | WatchMask::MOVED_TO)?;

    loop {
        let events = inotify.wait_and_handle()?;
        if let Some(event) = events
            .iter()
            .find(|e| e.name.as_deref() == Some(name.as_str()))
        {
            debug!("Log level file changed ({:?})", event.mask);
            update_log_level(&level_file);
        }
    }
}
