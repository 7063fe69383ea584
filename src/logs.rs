//! Per-service log redirection.
//!
//! When a service has `log_redirect` enabled its child is spawned with
//! piped stdio and both streams are pumped line by line into
//! `{app_data_home}/{name}/logs/{name}.log`, flushing on line
//! boundaries. Rotation is size-based: when the file crosses the limit
//! it is renamed to `.1` (shifting older rotations up) and a fresh file
//! is started.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::warn;

/// Single-writer rotating log file.
pub struct RotatingWriter {
    path: PathBuf,
    max_size: u64,
    keep: usize,
    file: Option<File>,
    size: u64,
}

impl RotatingWriter {
    pub fn new(path: PathBuf, max_size: u64, keep: usize) -> Self {
        Self {
            path,
            max_size,
            keep,
            file: None,
            size: 0,
        }
    }

    /// Append one line and flush it.
    pub fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.open()?;
        if let Some(file) = self.file.as_mut() {
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
            file.flush()?;
        }
        self.size += line.len() as u64 + 1;
        if self.size >= self.max_size {
            self.rotate()?;
        }
        Ok(())
    }

    fn open(&mut self) -> std::io::Result<()> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.size = file.metadata()?.len();
            self.file = Some(file);
        }
        Ok(())
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        self.file = None;
        self.size = 0;
        if self.keep == 0 {
            let _ = std::fs::remove_file(&self.path);
            return Ok(());
        }
        let oldest = self.rotated(self.keep);
        if oldest.exists() {
            std::fs::remove_file(&oldest)?;
        }
        for n in (1..self.keep).rev() {
            let from = self.rotated(n);
            if from.exists() {
                std::fs::rename(&from, self.rotated(n + 1))?;
            }
        }
        std::fs::rename(&self.path, self.rotated(1))?;
        Ok(())
    }

    fn rotated(&self, n: usize) -> PathBuf {
        PathBuf::from(format!("{}.{}", self.path.display(), n))
    }
}

/// Pumps child output streams into the service's rotating log file.
///
/// One redirector lives per service; the writer persists across
/// generations so restarts append to the same file.
#[derive(Clone)]
pub struct LogRedirector {
    service: String,
    writer: Arc<Mutex<RotatingWriter>>,
}

impl LogRedirector {
    pub fn new(service: &str, path: PathBuf, max_size: u64, keep: usize) -> Self {
        Self {
            service: service.to_string(),
            writer: Arc::new(Mutex::new(RotatingWriter::new(path, max_size, keep))),
        }
    }

    /// Start pump tasks for both streams of a freshly spawned child.
    /// The tasks end on their own when the streams hit EOF.
    pub fn attach<O, E>(&self, stdout: O, stderr: E)
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(pump(self.service.clone(), self.writer.clone(), stdout));
        tokio::spawn(pump(self.service.clone(), self.writer.clone(), stderr));
    }
}

async fn pump<R>(service: String, writer: Arc<Mutex<RotatingWriter>>, stream: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let result = match writer.lock() {
                    Ok(mut w) => w.write_line(&line),
                    Err(_) => break,
                };
                if let Err(e) = result {
                    warn!(service = %service, error = %e, "failed to write service log");
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(service = %service, error = %e, "failed to read service output");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn writes_lines_and_flushes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("svc.log");
        let mut writer = RotatingWriter::new(path.clone(), 1024, 2);
        writer.write_line("hello").unwrap();
        writer.write_line("world").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello\nworld\n");
    }

    #[test]
    fn rotates_at_size_threshold() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("svc.log");
        let mut writer = RotatingWriter::new(path.clone(), 10, 2);
        writer.write_line("0123456789").unwrap();
        // Crossed the limit: base renamed to .1, next line starts fresh.
        writer.write_line("next").unwrap();
        assert!(path.exists());
        assert!(PathBuf::from(format!("{}.1", path.display())).exists());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "next\n");
    }

    #[test]
    fn keeps_bounded_number_of_rotations() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("svc.log");
        let mut writer = RotatingWriter::new(path.clone(), 4, 2);
        for n in 0..6 {
            writer.write_line(&format!("line{}", n)).unwrap();
        }
        assert!(PathBuf::from(format!("{}.1", path.display())).exists());
        assert!(PathBuf::from(format!("{}.2", path.display())).exists());
        assert!(!PathBuf::from(format!("{}.3", path.display())).exists());
    }

    #[tokio::test]
    async fn pumps_child_output_to_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("svc.log");
        let redirector = LogRedirector::new("svc", path.clone(), 1024 * 1024, 2);

        let stdout: &[u8] = b"from stdout\n";
        let stderr: &[u8] = b"from stderr\n";
        redirector.attach(stdout, stderr);

        // Pump tasks finish at EOF; give them a beat.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("from stdout"));
        assert!(contents.contains("from stderr"));
    }
}
