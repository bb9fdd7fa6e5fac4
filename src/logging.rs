// src/logging.rs
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use env_logger::{Builder, Env, Target};

/// Copies every log line to stderr and to a session file.
struct TeeWriter {
    file: File,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

fn session_log_path(dir: &Path) -> PathBuf {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    dir.join(format!("canscope_{stamp}.log"))
}

/// Console logging at `info` (or `RUST_LOG`), mirrored into a timestamped
/// file under `log_dir` when one is given. Returns the file path.
pub fn init(log_dir: Option<&Path>) -> Result<Option<PathBuf>> {
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} - {:<40} - {:<8} - {}",
            buf.timestamp(),
            record.target(),
            record.level(),
            record.args()
        )
    });
    let mut log_path = None;
    if let Some(dir) = log_dir {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;
        let path = session_log_path(dir);
        let file = File::create(&path)
            .with_context(|| format!("failed to create log file {}", path.display()))?;
        builder.target(Target::Pipe(Box::new(TeeWriter { file })));
        log_path = Some(path);
    }
    // A second init (tests, embedding) keeps the first logger.
    if builder.try_init().is_err() {
        return Ok(None);
    }
    Ok(log_path)
}
