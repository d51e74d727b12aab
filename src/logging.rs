//! Tracing setup and the data directory.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

/// Filter used when neither `RUST_LOG` nor `logging.filter` is set.
pub const DEFAULT_FILTER: &str = "aigis=info,warn";

const LOG_FILE: &str = "aigis.log";
const KEEP_LOGS: u32 = 3;

/// Return the platform-standard data directory for Aigis.
///
/// - macOS: `~/Library/Application Support/aigis/`
/// - Windows: `{FOLDERID_RoamingAppData}\aigis\`
/// - Linux: `$XDG_DATA_HOME/aigis/` (fallback `~/.local/share/aigis/`)
///
/// Falls back to `~/.aigis/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("aigis");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".aigis")
}

/// Initialize the tracing subscriber, writing to `<log_dir>/aigis.log`.
///
/// Existing logs are rotated first (`aigis.log` → `.1` → `.2` → `.3`).
/// `RUST_LOG` wins over `default_filter`. Returns the log file path.
pub fn init_tracing(log_dir: &Path, default_filter: &str) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join(LOG_FILE);
    rotate_log_file(&log_path, KEEP_LOGS);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    // A second init (tests, embedding hosts) keeps the first subscriber.
    let _ = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .try_init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_dir = %log_dir.display(),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== Aigis starting ==="
    );
    Ok(log_path)
}

/// Rotate log files: `aigis.log` → `aigis.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
pub fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A file writer that flushes after every write, so a crash loses no lines.
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
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        f.flush()
    }
}

impl<'a> fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_keeps_three() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join(LOG_FILE);
        for generation in 0..5 {
            std::fs::write(&base, format!("run {generation}")).unwrap();
            rotate_log_file(&base, 3);
        }
        assert!(!base.exists());
        let newest = std::fs::read_to_string(dir.path().join("aigis.log.1")).unwrap();
        assert_eq!(newest, "run 4");
        assert!(dir.path().join("aigis.log.3").exists());
        assert!(!dir.path().join("aigis.log.4").exists());
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.log");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = FlushingWriter::new(file);
        writer.write_all(b"line\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line\n");
    }
}
