//! Logging setup.
//!
//! `login` and `add` talk to a person: they log to stdout, optionally
//! teeing into `<log-dir>/opkssh.log`. `verify` talks to sshd: stdout is
//! reserved for the single authority line, so its logs go to a file or
//! nowhere.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Shared append-only log file usable as a tracing writer.
#[derive(Clone)]
struct LogFile(Arc<File>);

impl Write for LogFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        (&*self.0).write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        (&*self.0).flush()
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Logging for the interactive commands. With a log dir, events also land
/// in `<dir>/opkssh.log`.
pub fn setup_cli_logging(log_dir: Option<&Path>) {
    let file = log_dir.and_then(|dir| {
        let path = dir.join("opkssh.log");
        match open_append(&path) {
            Ok(file) => Some(LogFile(Arc::new(file))),
            Err(e) => {
                eprintln!("failed to open log file {}: {e}", path.display());
                None
            }
        }
    });

    match file {
        Some(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_writer(std::io::stdout.and(move || file.clone()))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_writer(std::io::stdout)
                .init();
        }
    }
}

/// File-only logging for the verifier. When the log file cannot be opened
/// (unprivileged test runs, missing /var/log), logging is disabled rather
/// than risking a stray byte on stdout.
pub fn setup_verify_logging(path: &Path) {
    match open_append(path) {
        Ok(file) => {
            let file = LogFile(Arc::new(file));
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_writer(move || file.clone())
                .with_ansi(false)
                .init();
        }
        Err(_) => {
            // No log sink. Swallow events instead of touching stdout.
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::new("off"))
                .with_writer(std::io::sink)
                .init();
        }
    }
}
