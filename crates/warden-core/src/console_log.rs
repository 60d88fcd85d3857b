//! Operator console history.

use std::{
    collections::VecDeque,
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use tokio::sync::mpsc;
use warden_process::Event;

use crate::config::ConsoleLogConfig;
use crate::sink::Sink;

/// Bounded history of console events, optionally mirrored to a size-rotated file.
///
/// Roster counters are not kept: each one is superseded by the next and only matters live.
#[derive(Clone, Debug)]
pub struct ConsoleLog {
    history: Arc<Mutex<VecDeque<Event>>>,
    capacity: usize,
    file: Option<mpsc::UnboundedSender<String>>,
}

impl ConsoleLog {
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            history: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            file: None,
        }
    }

    /// Also appends each rendered event to `path`. The writer lives on the blocking pool,
    /// so this must be called inside a tokio runtime.
    pub fn with_file(path: PathBuf, cfg: ConsoleLogConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::task::spawn_blocking(move || {
            match RotatingFile::open(path.clone(), cfg.file_max_bytes, cfg.file_max_files) {
                Ok(file) => file.drain(rx),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "console log file disabled")
                }
            }
        });

        Self {
            file: Some(tx),
            ..Self::in_memory(cfg.max_lines)
        }
    }

    fn record(&self, event: Event) {
        if matches!(event, Event::RosterChanged { .. }) {
            return;
        }
        if let Some(tx) = &self.file {
            let _ = tx.send(event.render());
        }
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        if history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(event);
    }

    /// Up to `n` of the most recent events, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Event> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let skip = history.len().saturating_sub(n);
        history.iter().skip(skip).cloned().collect()
    }
}

impl Sink for ConsoleLog {
    fn emit(&self, event: Event) {
        self.record(event);
    }
}

/// `console.log` plus `console.log.1` (newest) .. `console.log.<keep>` (oldest).
struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    keep: usize,
    written: u64,
    out: BufWriter<File>,
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl RotatingFile {
    fn open(path: PathBuf, max_bytes: u64, keep: usize) -> io::Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let file = open_append(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            max_bytes,
            keep: keep.max(1),
            written,
            out: BufWriter::new(file),
        })
    }

    fn backup(&self, n: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.out.flush()?;
        let _ = std::fs::remove_file(self.backup(self.keep));
        for n in (1..self.keep).rev() {
            let _ = std::fs::rename(self.backup(n), self.backup(n + 1));
        }
        std::fs::rename(&self.path, self.backup(1))?;
        self.out = BufWriter::new(open_append(&self.path)?);
        self.written = 0;
        Ok(())
    }

    fn append_line(&mut self, line: &str) -> io::Result<()> {
        let len = line.len() as u64 + 1;
        if self.max_bytes > 0 && self.written > 0 && self.written + len > self.max_bytes {
            self.rotate()?;
        }
        writeln!(self.out, "{line}")?;
        self.written += len;
        Ok(())
    }

    /// Writes until every sender is gone, flushing after each burst.
    fn drain(mut self, mut rx: mpsc::UnboundedReceiver<String>) {
        while let Some(first) = rx.blocking_recv() {
            let mut res = self.append_line(&first);
            while res.is_ok() {
                match rx.try_recv() {
                    Ok(line) => res = self.append_line(&line),
                    Err(_) => break,
                }
            }
            if let Err(e) = res.and_then(|()| self.out.flush()) {
                tracing::warn!(path = %self.path.display(), error = %e, "console log write failed");
            }
        }
        let _ = self.out.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use warden_process::LineSource;

    fn notice(text: &str) -> Event {
        Event::notice(LineSource::Warden, text)
    }

    #[test]
    fn keeps_the_latest_events() {
        let log = ConsoleLog::in_memory(3);
        for i in 1..=5 {
            log.emit(notice(&format!("line {i}")));
        }
        let got: Vec<String> = log.recent(10).iter().map(Event::render).collect();
        assert_eq!(got, vec!["[warden] line 3", "[warden] line 4", "[warden] line 5"]);
        assert_eq!(log.recent(1), vec![notice("line 5")]);
    }

    #[test]
    fn roster_counters_are_not_history() {
        let log = ConsoleLog::in_memory(10);
        log.emit(Event::RosterChanged { online: 2 });
        log.emit(notice("hello"));
        assert_eq!(log.recent(10), vec![notice("hello")]);
    }

    #[test]
    fn rotation_keeps_the_configured_number_of_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("console.log");
        let mut file = RotatingFile::open(path.clone(), 16, 2).unwrap();
        for line in ["0123456789", "abcdefghij", "klmnopqrst", "uvwxyz0123"] {
            file.append_line(line).unwrap();
        }
        file.out.flush().unwrap();

        let read = |p: PathBuf| std::fs::read_to_string(p).unwrap();
        assert_eq!(read(path.clone()), "uvwxyz0123\n");
        assert_eq!(read(file.backup(1)), "klmnopqrst\n");
        assert_eq!(read(file.backup(2)), "abcdefghij\n");
        assert!(!file.backup(3).exists());
    }

    #[test]
    fn reopening_counts_existing_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.log");
        std::fs::write(&path, "0123456789\n").unwrap();

        let mut file = RotatingFile::open(path.clone(), 16, 1).unwrap();
        file.append_line("abcdefghij").unwrap();
        file.out.flush().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "abcdefghij\n");
        assert_eq!(std::fs::read_to_string(file.backup(1)).unwrap(), "0123456789\n");
    }

    #[tokio::test]
    async fn events_reach_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.log");
        let cfg = ConsoleLogConfig {
            max_lines: 10,
            file_max_bytes: 1024 * 1024,
            file_max_files: 2,
        };
        let log = ConsoleLog::with_file(path.clone(), cfg);
        log.emit(notice("server started"));
        log.emit(Event::RosterChanged { online: 1 });

        let mut content = String::new();
        for _ in 0..200 {
            content = std::fs::read_to_string(&path).unwrap_or_default();
            if !content.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(content, "[warden] server started\n");
    }
}
