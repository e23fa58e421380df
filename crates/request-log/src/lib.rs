//! Rotation-aware append-only request log.
//!
//! Lines are prefixed with a `YYYY-MM-DD HH:MM:SS` UTC timestamp (no
//! separator; include one in the message if wanted). Once per second a
//! watcher checks whether the path still names the open file; if the file
//! was renamed or deleted out from under us, it is closed and the path
//! reopened, so external log rotation just works.

use anyhow::Context;
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct RequestLog {
    inner: Arc<Inner>,
    _watcher: Arc<AbortOnDrop>,
}

struct Inner {
    path: PathBuf,
    file: Mutex<File>,
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl RequestLog {
    /// Open (creating if necessary) the log at `path`. If the file is
    /// non-empty and does not end with a newline, one is appended first.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let file = open_log_file(&path)?;
        let inner = Arc::new(Inner {
            path,
            file: Mutex::new(file),
        });

        let watcher = {
            let inner = inner.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    inner.check_rotation();
                }
            })
        };

        Ok(Self {
            inner,
            _watcher: Arc::new(AbortOnDrop(watcher)),
        })
    }

    /// Append one timestamped line. Write failures are reported to the
    /// diagnostic log but do not propagate; audit logging must not take
    /// the daemon down.
    pub fn write_line(&self, message: &str) {
        let line = format!(
            "{}{message}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S")
        );
        let mut file = self.inner.file.lock();
        if let Err(err) = file.write_all(line.as_bytes()) {
            tracing::warn!(
                "cannot write to log file {}: {err}",
                self.inner.path.display()
            );
        }
    }
}

impl Inner {
    fn check_rotation(&self) {
        let mut file = self.file.lock();

        let open_meta = match file.metadata() {
            Ok(meta) => meta,
            Err(_) => return,
        };

        let same = match std::fs::metadata(&self.path) {
            Ok(path_meta) => {
                path_meta.is_file()
                    && path_meta.dev() == open_meta.dev()
                    && path_meta.ino() == open_meta.ino()
            }
            // Path vanished (or is unreadable); reopen.
            Err(_) => false,
        };

        if !same {
            match open_log_file(&self.path) {
                Ok(fresh) => *file = fresh,
                Err(err) => {
                    tracing::warn!("cannot reopen log file: {err:#}");
                }
            }
        }
    }
}

fn open_log_file(path: &Path) -> anyhow::Result<File> {
    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)
        .with_context(|| format!("cannot open log file {}", path.display()))?;

    let meta = file.metadata()?;
    anyhow::ensure!(
        meta.is_file(),
        "log file is not a regular file: {}",
        path.display()
    );

    if meta.len() > 0 {
        file.seek(SeekFrom::End(-1))?;
        let mut last = [0u8; 1];
        file.read_exact(&mut last)?;
        if last[0] != b'\n' {
            file.write_all(b"\n")?;
        }
    }

    Ok(file)
}
