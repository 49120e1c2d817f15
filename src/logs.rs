//! Structured logging: JSONL server logs with size-based rotation and
//! compression, plus per-task log files.

use crate::config::PathsConfig;
use crate::constants::LOG_ROTATION_BYTES;
use crate::ids::TaskId;
use crate::Result;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// A writer that rotates its file once it grows past `max_bytes`; rotated
/// files are gzip-compressed on a background thread.
pub struct SizeRotatingWriter {
    path: PathBuf,
    max_bytes: u64,
    file: BufWriter<File>,
    written: u64,
}

impl SizeRotatingWriter {
    pub fn new(path: PathBuf, max_bytes: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(SizeRotatingWriter {
            path,
            max_bytes,
            file: BufWriter::new(file),
            written,
        })
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static ROTATION_SEQUENCE: AtomicU64 = AtomicU64::new(0);

        self.file.flush()?;
        let timestamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
        let sequence = ROTATION_SEQUENCE.fetch_add(1, Ordering::SeqCst);
        let rotated = self
            .path
            .with_extension(format!("{timestamp}.{sequence}.jsonl"));
        std::fs::rename(&self.path, &rotated)?;

        let fresh = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.file = BufWriter::new(fresh);
        self.written = 0;

        // Compress off the logging path; a failed compression leaves the
        // uncompressed rotated file behind, which is still readable.
        std::thread::spawn(move || {
            if let Err(e) = compress_file(&rotated) {
                eprintln!("failed to compress rotated log {}: {e}", rotated.display());
            }
        });
        Ok(())
    }
}

impl Write for SizeRotatingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.written + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        let written = self.file.write(buf)?;
        self.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

fn compress_file(path: &PathBuf) -> std::io::Result<()> {
    let input = std::fs::read(path)?;
    let gz_path = PathBuf::from(format!("{}.gz", path.display()));
    let output = File::create(&gz_path)?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    encoder.write_all(&input)?;
    encoder.finish()?;
    std::fs::remove_file(path)?;
    Ok(())
}

/// Install the global subscriber: human-readable output on stderr plus the
/// rotated JSONL file under `logs/server/logs.jsonl`.
///
/// Returns the appender guard; drop it only at process exit so buffered
/// lines are flushed.
pub fn setup_logging(paths: &PathsConfig) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let writer = SizeRotatingWriter::new(paths.server_log_file(), LOG_ROTATION_BYTES)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(writer);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking),
        )
        .init();
    Ok(guard)
}

/// Append one JSON line to a task's log under `state/tasks/<task_id>.json`.
pub fn append_task_log_line(paths: &PathsConfig, task_id: &TaskId, line: &str) {
    let path = paths.task_log_file(task_id);
    let result = (|| -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    })();
    if let Err(e) = result {
        warn!("failed to append task log for {}: {}", task_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_appends_without_rotation_below_limit() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("logs.jsonl");
        let mut writer = SizeRotatingWriter::new(path.clone(), 1024).unwrap();
        writer.write_all(b"{\"line\":1}\n").unwrap();
        writer.flush().unwrap();
        assert!(path.exists());
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_writer_rotates_past_limit() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("logs.jsonl");
        let mut writer = SizeRotatingWriter::new(path.clone(), 64).unwrap();
        for i in 0..20 {
            writer
                .write_all(format!("{{\"line\":{i},\"pad\":\"xxxxxxxxxxxxxxxx\"}}\n").as_bytes())
                .unwrap();
        }
        writer.flush().unwrap();

        // The active file was reopened fresh and at least one rotation
        // produced a sibling (possibly already compressed).
        assert!(path.exists());
        for _ in 0..100 {
            let siblings = std::fs::read_dir(temp.path()).unwrap().count();
            if siblings >= 2 {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        panic!("no rotated log file appeared");
    }

    #[test]
    fn test_task_log_lines_accumulate() {
        let temp = tempfile::tempdir().unwrap();
        let paths = PathsConfig {
            data_dir: temp.path().to_path_buf(),
        };
        let task_id = TaskId::new();
        append_task_log_line(&paths, &task_id, "{\"event\":\"a\"}");
        append_task_log_line(&paths, &task_id, "{\"event\":\"b\"}");

        let contents = std::fs::read_to_string(paths.task_log_file(&task_id)).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
