//! Tracing subscriber setup.
//!
//! Logs go to stderr by default. When a log file is configured, it is rotated
//! on startup (`caprouter.log` → `.1` → `.2` → `.3`) and written through a
//! line-flushing writer so nothing is lost if the process dies.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogFormat};

/// Rotated files kept next to the active log.
const KEEP_ROTATED: u32 = 3;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `config.filter`. Calling this twice is harmless:
/// the second subscriber is discarded.
pub fn init_tracing(config: &LogConfig) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("caprouter=info,warn"));

    let (writer, ansi) = match &config.file {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            rotate_log_file(path, KEEP_ROTATED);
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            (BoxMakeWriter::new(FlushingWriter::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi && config.format == LogFormat::Text)
        .with_target(true)
        .with_thread_ids(false);

    let installed = match config.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
    Ok(())
}

/// Shift `x.log` to `x.log.1`, `x.log.1` to `x.log.2`, and so on, dropping
/// whatever would land beyond `x.log.{keep}`. Gaps in the chain are fine.
pub fn rotate_log_file(base_path: &Path, keep: u32) {
    let numbered = |n: u32| {
        let mut name = base_path.as_os_str().to_owned();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    };

    let _ = std::fs::remove_file(numbered(keep));
    for n in (1..keep).rev() {
        let _ = std::fs::rename(numbered(n), numbered(n + 1));
    }
    if keep > 0 {
        let _ = std::fs::rename(base_path, numbered(1));
    }
}

/// File writer that flushes after every write, so each log line reaches
/// the disk immediately.
#[derive(Clone)]
pub struct FlushingWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl FlushingWriter {
    pub fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut file = self.file.lock();
        let n = file.write(buf)?;
        file.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.lock().flush()
    }
}

impl<'a> MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rotate_log_file_keeps_three() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("caprouter.log");
        for generation in 0..5 {
            std::fs::write(&log, format!("run {generation}")).unwrap();
            rotate_log_file(&log, 3);
        }

        assert!(!log.exists());
        let read = |suffix: u32| {
            std::fs::read_to_string(format!("{}.{suffix}", log.display())).unwrap()
        };
        assert_eq!(read(1), "run 4");
        assert_eq!(read(2), "run 3");
        assert_eq!(read(3), "run 2");
        assert!(!Path::new(&format!("{}.4", log.display())).exists());
    }

    #[test]
    fn test_rotate_with_gap_in_chain() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("caprouter.log");
        std::fs::write(&log, "current").unwrap();
        std::fs::write(dir.path().join("caprouter.log.2"), "older").unwrap();
        rotate_log_file(&log, 3);

        let read = |name: &str| std::fs::read_to_string(dir.path().join(name)).unwrap();
        assert_eq!(read("caprouter.log.1"), "current");
        assert_eq!(read("caprouter.log.3"), "older");
        assert!(!dir.path().join("caprouter.log.2").exists());
    }

    #[test]
    fn test_rotate_missing_file_is_noop() {
        let dir = TempDir::new().unwrap();
        rotate_log_file(&dir.path().join("absent.log"), 3);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.log");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = FlushingWriter::new(file).make_writer();
        writer.write_all(b"line one\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line one\n");
    }
}
