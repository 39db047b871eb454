// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Multi-sink logging behind the `log` facade.
//!
//! Sinks are selected with repeatable `-o` options and can be combined:
//! `stdout`, `syslog`, and `file:<path>`. With no sinks the facade stays at
//! its default (everything discarded), which keeps the hot paths free of
//! formatting work. Workers re-parse the same options from their inherited
//! argv, so a listener's sink choice follows every connection.

use std::ffi::CString;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use log::{LevelFilter, Log, Metadata, Record};

/// Parsed `-o` options.
#[derive(Clone, Debug, Default)]
pub struct SinkConfig {
    pub stdout: bool,
    pub syslog: bool,
    pub file: Option<PathBuf>,
}

impl SinkConfig {
    /// Unknown sink names are ignored, matching the permissive option
    /// handling of the CLI at large.
    pub fn parse(opts: &[String]) -> Self {
        let mut config = Self::default();
        for opt in opts {
            if opt == "stdout" {
                config.stdout = true;
            }
            if opt == "syslog" {
                config.syslog = true;
            }
            if let Some(path) = opt.strip_prefix("file:") {
                config.file = Some(PathBuf::from(path));
            }
        }
        config
    }

    pub fn is_active(&self) -> bool {
        self.stdout || self.syslog || self.file.is_some()
    }
}

struct MultiSink {
    stdout: bool,
    syslog: bool,
    file: Option<Mutex<File>>,
}

impl Log for MultiSink {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        let line = format!("{}: {}", record.target(), record.args());
        if self.stdout {
            println!("{line}");
        }
        if self.syslog {
            if let Ok(c) = CString::new(line.as_str()) {
                unsafe {
                    libc::syslog(
                        libc::LOG_DEBUG,
                        b"%s\0".as_ptr().cast(),
                        c.as_ptr(),
                    );
                }
            }
        }
        if let Some(file) = &self.file {
            let mut f = file.lock().unwrap_or_else(|e| e.into_inner());
            let _ = writeln!(f, "{line}");
            let _ = f.flush();
        }
    }

    fn flush(&self) {}
}

/// Installs the configured sinks. Does nothing when no sink was requested.
pub fn init(config: &SinkConfig) {
    if !config.is_active() {
        return;
    }
    let file = config.file.as_ref().and_then(|path| match File::create(path) {
        Ok(f) => Some(Mutex::new(f)),
        Err(err) => {
            eprintln!("failed to open {} for writing: {err}", path.display());
            None
        }
    });
    let sink = MultiSink {
        stdout: config.stdout,
        syslog: config.syslog,
        file,
    };
    if log::set_boxed_logger(Box::new(sink)).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_combines_repeated_options() {
        let config = SinkConfig::parse(&[
            "syslog".to_string(),
            "file:/tmp/log.txt".to_string(),
            "stdout".to_string(),
        ]);
        assert!(config.stdout);
        assert!(config.syslog);
        assert_eq!(config.file.as_deref(), Some(std::path::Path::new("/tmp/log.txt")));
    }

    #[test]
    fn parse_ignores_unknown_sinks() {
        let config = SinkConfig::parse(&["journal".to_string()]);
        assert!(!config.is_active());
    }
}
