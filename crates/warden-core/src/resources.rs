use std::sync::{Arc, Mutex};

#[cfg(target_os = "linux")]
use std::sync::OnceLock;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use warden_process::{AlertLevel, Event, ResourceSample};

use crate::config::SamplerConfig;
use crate::sink::SharedSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessMemory {
    Resident(u64),
    /// The platform cannot tell; keep sampling.
    Unknown,
    Gone,
}

pub trait MemoryProbe: Send + Sync {
    fn system_memory_percent(&self) -> Option<f64>;
    fn process_memory(&self, pid: u32) -> ProcessMemory;
}

/// Reads `/proc` on Linux; elsewhere only process liveness is known.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcProbe;

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    static PAGE: OnceLock<u64> = OnceLock::new();
    *PAGE.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_PAGESIZE);
        if v <= 0 { 4096 } else { v as u64 }
    })
}

/// Percentage of memory in use according to a `/proc/meminfo` dump.
pub fn parse_meminfo(text: &str) -> Option<f64> {
    let mut total = None;
    let mut available = None;
    let mut free_ish: u64 = 0;
    for line in text.lines() {
        let mut it = line.split_whitespace();
        let Some(key) = it.next() else {
            continue;
        };
        let kb: u64 = match it.next().and_then(|v| v.parse().ok()) {
            Some(v) => v,
            None => continue,
        };
        match key {
            "MemTotal:" => total = Some(kb),
            "MemAvailable:" => available = Some(kb),
            "MemFree:" | "Buffers:" | "Cached:" => free_ish = free_ish.saturating_add(kb),
            _ => {}
        }
    }
    let total = total.filter(|t| *t > 0)? as f64;
    let available = available.unwrap_or(free_ish) as f64;
    Some(((total - available) / total * 100.0).clamp(0.0, 100.0))
}

impl MemoryProbe for ProcProbe {
    #[cfg(target_os = "linux")]
    fn system_memory_percent(&self) -> Option<f64> {
        let s = std::fs::read_to_string("/proc/meminfo").ok()?;
        parse_meminfo(&s)
    }

    #[cfg(not(target_os = "linux"))]
    fn system_memory_percent(&self) -> Option<f64> {
        None
    }

    #[cfg(target_os = "linux")]
    fn process_memory(&self, pid: u32) -> ProcessMemory {
        let Ok(s) = std::fs::read_to_string(format!("/proc/{pid}/statm")) else {
            return ProcessMemory::Gone;
        };
        let mut it = s.split_whitespace();
        let _size_pages = it.next();
        match it.next().and_then(|v| v.parse::<u64>().ok()) {
            Some(resident_pages) => {
                ProcessMemory::Resident(resident_pages.saturating_mul(page_size()))
            }
            None => ProcessMemory::Unknown,
        }
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    fn process_memory(&self, pid: u32) -> ProcessMemory {
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        if rc == 0 {
            ProcessMemory::Unknown
        } else {
            ProcessMemory::Gone
        }
    }

    #[cfg(not(unix))]
    fn process_memory(&self, _pid: u32) -> ProcessMemory {
        ProcessMemory::Unknown
    }
}

pub(crate) fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut v = bytes as f64;
    let mut unit = 0;
    while v >= 1024.0 && unit < UNITS.len() - 1 {
        v /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{v:.1} {}", UNITS[unit])
    }
}

/// Handle to a running sampler task. Dropping it does not stop the task; call `cancel`.
#[derive(Debug)]
pub struct ResourceSampler {
    cancel: CancellationToken,
    latest: Arc<Mutex<Option<ResourceSample>>>,
    join: JoinHandle<()>,
}

impl ResourceSampler {
    pub fn spawn(
        sink: SharedSink,
        probe: Arc<dyn MemoryProbe>,
        config: SamplerConfig,
        pid: Option<u32>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let latest = Arc::new(Mutex::new(None));

        let join = tokio::spawn({
            let cancel = cancel.clone();
            let latest = latest.clone();
            async move {
                let mut ticker = tokio::time::interval(config.interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                let mut above = false;

                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }

                    let rss = match pid.map(|p| (p, probe.process_memory(p))) {
                        Some((p, ProcessMemory::Gone)) => {
                            tracing::debug!(pid = p, "tracked process gone; sampler stopping");
                            break;
                        }
                        Some((_, ProcessMemory::Resident(bytes))) => Some(bytes),
                        _ => None,
                    };
                    let Some(percent) = probe.system_memory_percent() else {
                        continue;
                    };

                    let sample = ResourceSample {
                        system_memory_percent: percent,
                        process_rss_bytes: rss,
                    };
                    *latest.lock().unwrap_or_else(|e| e.into_inner()) = Some(sample);

                    if cancel.is_cancelled() {
                        break;
                    }
                    if percent > config.alert_percent {
                        if !above {
                            above = true;
                            let mut message = format!(
                                "system memory at {percent:.1}% (threshold {:.0}%)",
                                config.alert_percent
                            );
                            if let Some(bytes) = rss {
                                message.push_str(&format!(", server using {}", human_bytes(bytes)));
                            }
                            tracing::warn!(percent, "memory alert");
                            sink.emit(Event::Alert {
                                level: AlertLevel::Critical,
                                message,
                                sample,
                            });
                        }
                    } else {
                        above = false;
                    }
                }
            }
        });

        Self {
            cancel,
            latest,
            join,
        }
    }

    pub fn latest(&self) -> Option<ResourceSample> {
        *self.latest.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
