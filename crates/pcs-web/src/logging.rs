use crate::config::Config;
use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const LOG_FILE_NAME: &str = "pcs-web.log";
const ROTATED_FILE_NAME: &str = "pcs-web.log.1";
/// A log file at least this large is rotated out at startup.
const ROTATE_BYTES: u64 = 8 * 1024 * 1024;

type SharedFile = Arc<Mutex<std::fs::File>>;

/// Keeps the shared log file handle alive for the life of the process.
pub struct LogGuard {
    file: Option<SharedFile>,
    pub path: Option<PathBuf>,
}

impl LogGuard {
    fn stdout_only() -> Self {
        Self {
            file: None,
            path: None,
        }
    }
}

/// `--debug` wins over `PCS_WEB_LOG_LEVEL`, which wins over `info`.
/// `RUST_LOG`, when set, replaces all of them.
fn level_directive(debug: bool, env_level: Option<String>) -> String {
    if debug {
        return "debug".to_string();
    }
    env_level
        .map(|level| level.trim().to_string())
        .filter(|level| !level.is_empty())
        .unwrap_or_else(|| "info".to_string())
}

pub fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = level_directive(config.debug, std::env::var("PCS_WEB_LOG_LEVEL").ok());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let guard = match open_log_file(&config.log_dir, ROTATE_BYTES) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard::stdout_only()
        }
    };
    let file = guard.file.clone();
    let make_writer = BoxMakeWriter::new(move || TeeWriter {
        stdout: io::stdout(),
        file: file.clone(),
    });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

/// Copies every formatted event to stdout and, when configured, the log file.
/// Write failures are swallowed so logging never takes the server down.
struct TeeWriter {
    stdout: io::Stdout,
    file: Option<SharedFile>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(Ok(mut file)) = self.file.as_ref().map(|file| file.lock()) {
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(Ok(mut file)) = self.file.as_ref().map(|file| file.lock()) {
            let _ = file.flush();
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str, rotate_bytes: u64) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard::stdout_only());
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(LOG_FILE_NAME);
    rotate_if_large(&dir, &path, rotate_bytes)?;
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
        path: Some(path),
    })
}

/// Keeps one previous generation: a large current file replaces
/// `pcs-web.log.1` and logging starts over in a fresh file.
fn rotate_if_large(dir: &Path, path: &Path, rotate_bytes: u64) -> io::Result<()> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.len() >= rotate_bytes => {
            std::fs::rename(path, dir.join(ROTATED_FILE_NAME))
        }
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
