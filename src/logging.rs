//! Tracing subscriber setup.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "assistant.log";

/// Rotated copies kept next to the live log.
const KEEP_ROTATED: u32 = 3;

const DEFAULT_FILTER: &str = "ai_assistant=info,warn";

/// Install the global subscriber.
///
/// With a log directory:
/// 1. Rotates existing logs (`assistant.log` → `.1` → `.2` → `.3`).
/// 2. Opens a fresh `assistant.log` behind a line-flushing writer.
/// 3. Logs a startup banner naming the file.
///
/// Without one, logs go to stderr. `RUST_LOG` overrides the default filter.
pub fn init_tracing(log_dir: Option<&Path>) -> std::io::Result<Option<PathBuf>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let Some(dir) = log_dir else {
        fmt::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(true)
            .init();
        return Ok(None);
    };

    std::fs::create_dir_all(dir)?;
    let log_path = dir.join(LOG_FILE);
    rotate_log_file(&log_path, KEEP_ROTATED);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== ai-assistant starting ==="
    );
    Ok(Some(log_path))
}

/// Shift `base` → `base.1` → … → `base.{keep}`. The oldest is deleted and
/// gaps in the chain are skipped.
fn rotate_log_file(base: &Path, keep: u32) {
    let _ = std::fs::remove_file(format!("{}.{keep}", base.display()));

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base.display());
        let to = format!("{}.{}", base.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base.exists() {
        let _ = std::fs::rename(base, format!("{}.1", base.display()));
    }
}

/// File writer that flushes after every write so lines survive a crash.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = f.write(buf)?;
        f.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?
            .flush()
    }
}

impl<'a> fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
