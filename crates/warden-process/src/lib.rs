use specta::Type;

/// Identifies one launch of a supervised process.
///
/// NOTE: A new id is minted on every `start`, so UI state keyed by it never leaks
/// across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub enum ProcessState {
    Starting,
    Running,
    Stopping,
    Exited,
    Killed,
    Failed,
}

impl ProcessState {
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ProcessState::Starting | ProcessState::Running | ProcessState::Stopping
        )
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Type)]
pub struct ProcessStatus {
    pub run_id: Option<RunId>,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
}

impl ProcessStatus {
    pub fn idle() -> Self {
        Self {
            run_id: None,
            state: ProcessState::Exited,
            pid: None,
            exit_code: None,
            message: None,
        }
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type,
)]
pub enum TunnelState {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
    Crashed,
    Restarting,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type,
)]
pub enum PlayerRank {
    #[default]
    User,
    Operator,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct PlayerRecord {
    pub name: String,
    pub rank: PlayerRank,
    pub uuid: Option<String>,
    /// Display form, e.g. `42ms`.
    pub ping: Option<String>,
    /// Linked external account tag, or `-` when the snapshot reported none.
    pub link: Option<String>,
    /// Display form, e.g. `$1,234.50`.
    pub balance: Option<String>,
}

impl PlayerRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rank: PlayerRank::User,
            uuid: None,
            ping: None,
            link: None,
            balance: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize, Type)]
pub struct ResourceSample {
    pub system_memory_percent: f64,
    pub process_rss_bytes: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum LineSource {
    Server,
    Tunnel,
    Warden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum LineCategory {
    Stdout,
    Stderr,
    Link,
    Error,
    Success,
    Info,
}

impl LineCategory {
    fn tag(self) -> &'static str {
        match self {
            LineCategory::Stdout => "stdout",
            LineCategory::Stderr => "stderr",
            LineCategory::Link => "link",
            LineCategory::Error => "error",
            LineCategory::Success => "ok",
            LineCategory::Info => "info",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Critical,
}

/// Everything the core pushes towards the presentation layer.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Type)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Line {
        source: LineSource,
        category: LineCategory,
        text: String,
    },
    Notice {
        source: LineSource,
        text: String,
    },
    Error {
        source: LineSource,
        code: String,
        message: String,
    },
    ServerStatus {
        status: ProcessStatus,
    },
    TunnelState {
        state: TunnelState,
    },
    TunnelCrashed {
        attempt: u32,
        delay_ms: u64,
    },
    RosterChanged {
        online: u32,
    },
    Alert {
        level: AlertLevel,
        message: String,
        sample: ResourceSample,
    },
}

impl Event {
    pub fn notice(source: LineSource, text: impl Into<String>) -> Self {
        Event::Notice {
            source,
            text: text.into(),
        }
    }

    pub fn error(source: LineSource, code: &str, message: impl Into<String>) -> Self {
        Event::Error {
            source,
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Single-line console rendering, used for the ring buffer and `console.log`.
    pub fn render(&self) -> String {
        match self {
            Event::Line {
                source: LineSource::Server,
                category,
                text,
            } => format!("[{}] {text}", category.tag()),
            Event::Line {
                source,
                category,
                text,
            } => format!("[{}:{}] {text}", source_tag(*source), category.tag()),
            Event::Notice { source, text } => format!("[{}] {text}", warden_tag(*source)),
            Event::Error {
                source,
                code,
                message,
            } => format!("[{}] error ({code}): {message}", warden_tag(*source)),
            Event::ServerStatus { status } => {
                let mut out = format!("[warden] server {:?}", status.state);
                if let Some(pid) = status.pid {
                    out.push_str(&format!(" pid={pid}"));
                }
                if let Some(code) = status.exit_code {
                    out.push_str(&format!(" exit_code={code}"));
                }
                if let Some(msg) = status.message.as_deref().filter(|m| !m.is_empty()) {
                    out.push_str(&format!(" ({msg})"));
                }
                out
            }
            Event::TunnelState { state } => format!("[warden:tunnel] {state:?}"),
            Event::TunnelCrashed { attempt, delay_ms } => format!(
                "[warden:tunnel] agent exited unexpectedly; restart #{attempt} in {delay_ms}ms"
            ),
            Event::RosterChanged { online } => format!("[warden] players online: {online}"),
            Event::Alert { level, message, .. } => format!("[warden] {level:?}: {message}"),
        }
    }
}

fn source_tag(source: LineSource) -> &'static str {
    match source {
        LineSource::Server => "server",
        LineSource::Tunnel => "tunnel",
        LineSource::Warden => "warden",
    }
}

fn warden_tag(source: LineSource) -> &'static str {
    match source {
        LineSource::Tunnel => "warden:tunnel",
        _ => "warden",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_is_non_empty() {
        let id = RunId::new();
        assert!(!id.0.is_empty());
        assert_ne!(id, RunId::new());
    }

    #[test]
    fn server_lines_render_with_stream_tag() {
        let ev = Event::Line {
            source: LineSource::Server,
            category: LineCategory::Stderr,
            text: "boom".to_string(),
        };
        assert_eq!(ev.render(), "[stderr] boom");

        let ev = Event::Line {
            source: LineSource::Tunnel,
            category: LineCategory::Link,
            text: "https://example.invalid/claim/abc".to_string(),
        };
        assert_eq!(ev.render(), "[tunnel:link] https://example.invalid/claim/abc");
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let ev = Event::TunnelCrashed {
            attempt: 3,
            delay_ms: 4000,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "tunnel_crashed");
        assert_eq!(v["attempt"], 3);
    }
}
