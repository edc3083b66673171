pub mod agent_core;
pub mod inference;

#[cfg(test)]
mod testing;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

const LOG_FILE_NAME: &str = "agentflow.log";
const LOG_GENERATIONS: u32 = 3;

/// Initialize the tracing subscriber.
///
/// Without a log directory, events go to stderr. With one, the previous
/// `agentflow.log` files shift down one generation (three are kept) and a
/// fresh file receives every event, flushed as it is written. `RUST_LOG`
/// overrides the default filter.
pub fn init_tracing(log_dir: Option<&Path>) -> io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("agentflow=info,warn"));

    let log = log_dir.map(open_log).transpose()?;
    let writer = match &log {
        Some((_, file)) => {
            let file = file.clone();
            BoxMakeWriter::new(move || file.clone())
        }
        None => BoxMakeWriter::new(io::stderr),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(log.is_none())
        .with_target(true)
        .try_init()
        .map_err(io::Error::other)?;

    if let Some((path, _)) = &log {
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            log_file = %path.display(),
            pid = std::process::id(),
            "agentflow starting"
        );
    }
    Ok(())
}

fn open_log(dir: &Path) -> io::Result<(PathBuf, LogFile)> {
    fs::create_dir_all(dir)?;
    let path = dir.join(LOG_FILE_NAME);
    rotate(&path, LOG_GENERATIONS);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok((path, LogFile(Arc::new(Mutex::new(file)))))
}

/// `agentflow.log` becomes `agentflow.log.1`, `.1` becomes `.2`, up to `.{keep}`.
fn rotate(base: &Path, keep: u32) {
    let chain: Vec<PathBuf> = std::iter::once(base.to_path_buf())
        .chain((1..=keep).map(|generation| numbered(base, generation)))
        .collect();
    // Oldest pair first; rename replaces the target, which drops generation `keep`.
    for pair in chain.windows(2).rev() {
        let _ = fs::rename(&pair[0], &pair[1]);
    }
}

fn numbered(base: &Path, generation: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{generation}"));
    PathBuf::from(name)
}

/// Shared handle on the open log file.
#[derive(Clone)]
struct LogFile(Arc<Mutex<File>>);

impl Write for LogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = self.0.lock().unwrap_or_else(|e| e.into_inner());
        file.write_all(buf)?;
        file.flush()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).flush()
    }
}
