//! File logging for the plugin.
//!
//! The container runtime owns stdout (results) and usually discards stderr,
//! so diagnostics go to an append-only JSON log file instead.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Default log file location.
pub const DEFAULT_LOG_FILE: &str = "/var/log/vxnet.log";

/// Size at which the log file is rotated to `<path>.1` (4 MB).
const MAX_LOG_BYTES: u64 = 4 * 1024 * 1024;

/// Append-mode log writer.
struct PluginLogWriter {
    file: File,
}

impl PluginLogWriter {
    fn open(path: &Path, max_bytes: u64) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        if let Ok(meta) = fs::metadata(path) {
            if meta.len() >= max_bytes {
                rotate(path)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }
}

impl Write for PluginLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Move `path` aside. A concurrent invocation may have rotated it first.
fn rotate(path: &Path) -> io::Result<()> {
    match fs::rename(path, rotated_path(path)) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn rotated_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".1");
    PathBuf::from(name)
}

/// Thread-safe writer wrapper.
struct SharedWriter(Mutex<PluginLogWriter>);

impl Write for &SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.lock() {
            Ok(mut writer) => writer.write(buf),
            Err(poisoned) => poisoned.into_inner().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.0.lock() {
            Ok(mut writer) => writer.flush(),
            Err(poisoned) => poisoned.into_inner().flush(),
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for &'static SharedWriter {
    type Writer = &'static SharedWriter;

    fn make_writer(&'a self) -> Self::Writer {
        *self
    }
}

/// Initialize JSON logging to `log_path`.
pub fn init(log_path: &Path) -> anyhow::Result<()> {
    let writer = PluginLogWriter::open(log_path, MAX_LOG_BYTES)?;

    // One invocation per process, so the writer lives until exit.
    let shared: &'static SharedWriter = Box::leak(Box::new(SharedWriter(Mutex::new(writer))));

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(shared)
        .with_filter(filter);

    tracing_subscriber::registry().with(fmt_layer).try_init()?;

    Ok(())
}
