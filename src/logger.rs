//! Run log. Each `masktile` invocation rewrites one file in the OS data
//! directory, so it holds the last command only: the tile list and mask it
//! touched, tiles activated, edits committed, class removals and merges.
//!
//! Log location (`MASKTILE_LOG_DIR` overrides the directory):
//!   Windows:  `%APPDATA%\MaskTile\masktile.log`
//!   Linux:    `~/.local/share/MaskTile/masktile.log`
//!   macOS:    `~/Library/Application Support/MaskTile/masktile.log`
//!
//! The `log_info!` / `log_warn!` / `log_err!` macros are no-ops until
//! `init()` runs, so library users and tests log nothing.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

static LOG_FILE: OnceLock<Mutex<File>> = OnceLock::new();
static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();

const LOG_DIR_ENV: &str = "MASKTILE_LOG_DIR";

/// Where this run is logging, once `init` succeeded.
pub fn log_path() -> Option<&'static PathBuf> {
    LOG_PATH.get()
}

/// Append a raw line. I/O errors are dropped; a full disk must not abort
/// a mask save.
pub fn write_line(line: &str) {
    if let Some(mutex) = LOG_FILE.get()
        && let Ok(mut file) = mutex.lock()
    {
        let _ = writeln!(file, "{}", line);
    }
}

pub fn write(level: &str, msg: &str) {
    write_line(&format_line(clock(), level, msg));
}

fn format_line(clock: String, level: &str, msg: &str) -> String {
    // one record per line even for multi-line tile list errors
    format!("{} {:<5} {}", clock, level, msg.replace('\n', " | "))
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logger::write("INFO", &format!($($arg)*));
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logger::write("WARN", &format!($($arg)*));
    };
}

#[macro_export]
macro_rules! log_err {
    ($($arg:tt)*) => {
        $crate::logger::write("ERROR", &format!($($arg)*));
    };
}

/// Open (truncating) the run log for `command` and mirror panics into it.
pub fn init(command: &str) {
    let path = log_dir().join("masktile.log");
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }

    match OpenOptions::new().create(true).write(true).truncate(true).open(&path) {
        Ok(f) => {
            let _ = LOG_PATH.set(path);
            let _ = LOG_FILE.set(Mutex::new(f));
        }
        Err(e) => {
            eprintln!("warning: no run log ({}: {})", path.display(), e);
            return;
        }
    }

    let argv: Vec<String> = std::env::args().collect();
    write_line(&format!("=== masktile {} ({}) ===", command, unix_seconds()));
    write_line(&format!("argv: {}", argv.join(" ")));

    let prev = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        write_line(&format_line(clock(), "PANIC", &info.to_string()));
        prev(info);
    }));
}

fn log_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(LOG_DIR_ENV) {
        return PathBuf::from(dir);
    }
    data_dir().join("MaskTile")
}

/// Platform data directory (without the app sub-folder).
fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata);
        }
    }
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join("Library").join("Application Support");
        }
    }
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local").join("share");
    }
    PathBuf::from(".")
}

fn unix_seconds() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}

/// HH:MM:SS.mmm (UTC).
fn clock() -> String {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => {
            let secs = d.as_secs();
            format!(
                "{:02}:{:02}:{:02}.{:03}",
                (secs % 86400) / 3600,
                (secs % 3600) / 60,
                secs % 60,
                d.subsec_millis()
            )
        }
        Err(_) => "??:??:??.???".to_string(),
    }
}
