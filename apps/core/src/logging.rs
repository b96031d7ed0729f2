use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing_subscriber::EnvFilter;

const LOG_FILE_NAME: &str = "searchy.log";
const ARCHIVE_PREFIX: &str = "searchy-";
const MAX_LOG_BYTES: u64 = 1_000_000;
const MAX_ARCHIVES: usize = 5;
const FILTER_ENV: &str = "SEARCHY_LOG";

static SUBSCRIBER_INSTALLED: OnceLock<()> = OnceLock::new();
static PANIC_HOOK_INSTALLED: OnceLock<()> = OnceLock::new();

pub fn logs_dir() -> PathBuf {
    crate::config::stable_app_data_dir().join("logs")
}

/// Installs the file-backed tracing subscriber. Later calls are no-ops.
pub fn init(log_dir: &Path) -> Result<(), std::io::Error> {
    if SUBSCRIBER_INSTALLED.get().is_some() {
        return Ok(());
    }

    fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join(LOG_FILE_NAME);
    rotate_if_needed(&log_path, log_dir)?;

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let filter = EnvFilter::try_from_env(FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(true)
        .with_writer(Mutex::new(file))
        .try_init()
        .is_ok();
    if installed {
        let _ = SUBSCRIBER_INSTALLED.set(());
    }

    install_panic_hook();
    tracing::info!(path = %log_path.display(), "logging initialized");
    Ok(())
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn rotate_if_needed(log_path: &Path, log_dir: &Path) -> Result<(), std::io::Error> {
    let meta = match fs::metadata(log_path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };

    if meta.len() < MAX_LOG_BYTES {
        return Ok(());
    }

    let archived = log_dir.join(format!("{ARCHIVE_PREFIX}{}.log", now_secs()));
    fs::rename(log_path, archived)?;
    prune_old_archives(log_dir)?;
    Ok(())
}

fn prune_old_archives(log_dir: &Path) -> Result<(), std::io::Error> {
    let mut archives = fs::read_dir(log_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(ARCHIVE_PREFIX) && n.ends_with(".log"))
                .unwrap_or(false)
        })
        .collect::<Vec<_>>();

    archives.sort();
    let excess = archives.len().saturating_sub(MAX_ARCHIVES);
    for oldest in archives.drain(..excess) {
        let _ = fs::remove_file(oldest);
    }
    Ok(())
}

fn install_panic_hook() {
    let _ = PANIC_HOOK_INSTALLED.get_or_init(|| {
        let prior = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |panic_info| {
            let location = panic_info
                .location()
                .map(|l| format!("{}:{}", l.file(), l.line()))
                .unwrap_or_else(|| "unknown".to_string());
            let payload = panic_info
                .payload()
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic_info.payload().downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic payload unavailable".to_string());
            tracing::error!(%location, %payload, "panic");
            prior(panic_info);
        }));
    });
}

#[cfg(test)]
mod tests {
    use super::{logs_dir, prune_old_archives, rotate_if_needed, LOG_FILE_NAME, MAX_ARCHIVES};

    #[test]
    fn logs_dir_uses_stable_app_data_layout() {
        let dir = logs_dir();
        assert!(dir.to_string_lossy().to_ascii_lowercase().contains("searchy"));
    }

    #[test]
    fn oversized_log_is_archived() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join(LOG_FILE_NAME);
        std::fs::write(&log_path, vec![b'x'; 1_000_001]).unwrap();

        rotate_if_needed(&log_path, dir.path()).unwrap();

        assert!(!log_path.exists());
        let archived = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(archived, 1);
    }

    #[test]
    fn pruning_keeps_newest_archives() {
        let dir = tempfile::tempdir().unwrap();
        for stamp in 0..(MAX_ARCHIVES + 3) {
            let name = format!("searchy-{:010}.log", stamp);
            std::fs::write(dir.path().join(name), b"old").unwrap();
        }

        prune_old_archives(dir.path()).unwrap();

        let mut remaining: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        remaining.sort();
        assert_eq!(remaining.len(), MAX_ARCHIVES);
        assert_eq!(remaining[0], "searchy-0000000003.log");
    }
}
