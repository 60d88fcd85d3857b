use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::Arc,
    time::SystemTime,
};

use crate::roster::RosterReconciler;

/// Structured "who is online" statement written out-of-band by a server-side plugin.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
pub struct ServerSnapshot {
    #[serde(default)]
    pub players: Vec<SnapshotPlayer>,
    #[serde(default)]
    pub performance: Option<Performance>,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct SnapshotPlayer {
    pub name: String,
    #[serde(default, alias = "id")]
    pub uuid: Option<String>,
    #[serde(default)]
    pub ping: Option<i64>,
    #[serde(default, alias = "link", alias = "discord")]
    pub linked: Option<String>,
    #[serde(default)]
    pub balance: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
pub struct Performance {
    #[serde(default)]
    pub tps: Option<f64>,
    #[serde(default)]
    pub mspt: Option<f64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CapturedSnapshot {
    pub snapshot: ServerSnapshot,
    pub captured_at: SystemTime,
}

pub trait SnapshotSource: Send + Sync {
    /// `None` when no snapshot is available right now; that is not an error.
    fn read_snapshot(&self) -> Option<CapturedSnapshot>;
}

/// Reads a JSON snapshot file; the file's modification time is its capture time.
#[derive(Debug, Clone)]
pub struct FileSnapshotSource {
    path: PathBuf,
}

impl FileSnapshotSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SnapshotSource for FileSnapshotSource {
    fn read_snapshot(&self) -> Option<CapturedSnapshot> {
        let meta = std::fs::metadata(&self.path).ok()?;
        let captured_at = meta.modified().ok()?;
        let raw = std::fs::read(&self.path).ok()?;
        match serde_json::from_slice::<ServerSnapshot>(&raw) {
            Ok(snapshot) => Some(CapturedSnapshot {
                snapshot,
                captured_at,
            }),
            Err(e) => {
                // Usually a half-written file; the next tick will see the complete one.
                tracing::debug!(path = %self.path.display(), error = %e, "snapshot unreadable");
                None
            }
        }
    }
}

/// Feeds snapshots from a source into the roster, one read per tick.
pub struct SnapshotPoller {
    source: Box<dyn SnapshotSource>,
    roster: Arc<RosterReconciler>,
}

impl SnapshotPoller {
    pub fn new(source: impl SnapshotSource + 'static, roster: Arc<RosterReconciler>) -> Self {
        Self {
            source: Box::new(source),
            roster,
        }
    }

    /// Returns whether the roster changed. Nothing is read while the server is down:
    /// the roster of a stopped server stays empty whatever the file still says.
    pub fn poll(&self, server_running: bool, now: SystemTime) -> bool {
        if !server_running {
            return false;
        }
        let Some(captured) = self.source.read_snapshot() else {
            return false;
        };
        self.roster.apply_snapshot(&captured, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Fixed(CapturedSnapshot);

    impl SnapshotSource for Fixed {
        fn read_snapshot(&self) -> Option<CapturedSnapshot> {
            Some(self.0.clone())
        }
    }

    fn steve_at(captured_at: SystemTime) -> CapturedSnapshot {
        CapturedSnapshot {
            snapshot: ServerSnapshot {
                players: vec![SnapshotPlayer {
                    name: "Steve".to_string(),
                    uuid: None,
                    ping: Some(10),
                    linked: None,
                    balance: None,
                }],
                performance: None,
            },
            captured_at,
        }
    }

    #[test]
    fn missing_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let src = FileSnapshotSource::new(dir.path().join("nope.json"));
        assert_eq!(src.read_snapshot(), None);
    }

    #[test]
    fn garbage_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("players.json");
        std::fs::write(&path, b"{\"players\": [").unwrap();
        assert_eq!(FileSnapshotSource::new(&path).read_snapshot(), None);
    }

    #[test]
    fn parses_players_and_performance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("players.json");
        std::fs::write(
            &path,
            br#"{
                "players": [
                    {"name": "Steve", "uuid": "u-1", "ping": 42, "linked": null, "balance": 1234.5},
                    {"name": "Alex", "id": "u-2"}
                ],
                "performance": {"tps": 19.8, "mspt": 12.5, "chunks": 900}
            }"#,
        )
        .unwrap();

        let got = FileSnapshotSource::new(&path).read_snapshot().unwrap();
        assert_eq!(got.snapshot.players.len(), 2);
        assert_eq!(got.snapshot.players[0].ping, Some(42));
        assert_eq!(got.snapshot.players[0].linked, None);
        assert_eq!(got.snapshot.players[1].uuid.as_deref(), Some("u-2"));
        let perf = got.snapshot.performance.unwrap();
        assert_eq!(perf.tps, Some(19.8));
        assert_eq!(perf.extra.get("chunks"), Some(&serde_json::json!(900)));
    }

    #[test]
    fn poller_skips_a_stopped_server() {
        let roster = Arc::new(RosterReconciler::new(Duration::from_secs(5)));
        let now = SystemTime::now();
        let poller = SnapshotPoller::new(Fixed(steve_at(now)), roster.clone());

        assert!(!poller.poll(false, now));
        assert_eq!(roster.online(), 0);
        assert!(poller.poll(true, now));
        assert_eq!(roster.online(), 1);
    }

    #[test]
    fn poller_does_not_refill_a_cleared_roster_from_the_same_file() {
        let roster = Arc::new(RosterReconciler::new(Duration::from_secs(5)));
        let now = SystemTime::now();
        let poller = SnapshotPoller::new(Fixed(steve_at(now)), roster.clone());
        assert!(poller.poll(true, now));

        // Server exited and came back; the snapshot file was not rewritten since.
        roster.clear();
        for tick in 1..=3 {
            assert!(!poller.poll(true, now + Duration::from_secs(5 * tick)));
        }
        assert_eq!(roster.online(), 0);
    }
}
