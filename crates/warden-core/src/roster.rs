//! Live player roster reconstructed from console output and optional snapshots.

use std::{
    collections::{HashMap, HashSet},
    sync::{OnceLock, RwLock},
    time::{Duration, SystemTime},
};

use regex::Regex;
use warden_process::{PlayerRank, PlayerRecord};

use crate::snapshot::{CapturedSnapshot, Performance};

/// Link tag shown when the snapshot reports no linked account.
pub const NO_LINK: &str = "-";

const NAME: &str = r"[\w.*\-]{1,32}";

fn join_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(&format!(r"^({NAME}) joined the game")).expect("join regex"))
}

fn leave_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(&format!(r"^({NAME}) left the game")).expect("leave regex"))
}

fn op_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(&format!(r"Made ({NAME}) a server operator")).expect("op regex"))
}

fn deop_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(r"Made ({NAME}) no longer a server operator")).expect("deop regex")
    })
}

fn list_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"There are (\d+) ?(?:/|of a max of|of a max|of) ?(\d+) players online:(.*)$")
            .expect("list regex")
    })
}

/// What a single console line says about the roster, if anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvidence {
    Joined(String),
    Left(String),
    Opped(String),
    Deopped(String),
    ListReport {
        online: u32,
        max: u32,
        names: Vec<String>,
    },
}

/// Text after the logger prefix (`[12:00:00] [Server thread/INFO]: `), if there is one.
fn message_body(line: &str) -> &str {
    match line.find("]: ") {
        Some(idx) => &line[idx + 3..],
        None => line,
    }
    .trim_start()
}

fn is_chat(body: &str) -> bool {
    body.starts_with('<') || body.starts_with("[Not Secure] <")
}

pub fn parse_evidence(line: &str) -> Option<LogEvidence> {
    let body = message_body(line);
    if body.is_empty() || is_chat(body) {
        return None;
    }

    if let Some(c) = list_re().captures(body) {
        let online = c[1].parse().unwrap_or(0);
        let max = c[2].parse().unwrap_or(0);
        let names = c[3]
            .split(',')
            .filter_map(|entry| entry.split_whitespace().last())
            .map(str::to_string)
            .collect();
        return Some(LogEvidence::ListReport { online, max, names });
    }
    if let Some(c) = join_re().captures(body) {
        return Some(LogEvidence::Joined(c[1].to_string()));
    }
    if let Some(c) = leave_re().captures(body) {
        return Some(LogEvidence::Left(c[1].to_string()));
    }
    // "no longer" must win over the plain grant wording.
    if let Some(c) = deop_re().captures(body) {
        return Some(LogEvidence::Deopped(c[1].to_string()));
    }
    if let Some(c) = op_re().captures(body) {
        return Some(LogEvidence::Opped(c[1].to_string()));
    }
    None
}

#[derive(Debug, Default, Clone)]
pub struct Roster {
    players: HashMap<String, PlayerRecord>,
}

impl Roster {
    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&PlayerRecord> {
        self.players.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlayerRecord> {
        self.players.values()
    }

    /// Records ordered by name, for rendering.
    pub fn sorted(&self) -> Vec<PlayerRecord> {
        let mut out: Vec<PlayerRecord> = self.players.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    fn insert_user(&mut self, name: &str) -> bool {
        if self.players.contains_key(name) {
            return false;
        }
        self.players
            .insert(name.to_string(), PlayerRecord::new(name));
        true
    }

    fn remove(&mut self, name: &str) -> bool {
        self.players.remove(name).is_some()
    }

    fn set_rank(&mut self, name: &str, rank: PlayerRank) -> bool {
        match self.players.get_mut(name) {
            Some(p) if p.rank != rank => {
                p.rank = rank;
                true
            }
            _ => false,
        }
    }

    fn retain_names(&mut self, keep: &HashSet<&str>) -> bool {
        let before = self.players.len();
        self.players.retain(|name, _| keep.contains(name.as_str()));
        self.players.len() != before
    }

    fn clear(&mut self) -> bool {
        let changed = !self.players.is_empty();
        self.players.clear();
        changed
    }
}

/// Owns the roster. Every mutation happens under one write lock; readers take the
/// read lock for the whole render pass.
#[derive(Debug)]
pub struct RosterReconciler {
    roster: RwLock<Roster>,
    performance: RwLock<Option<Performance>>,
    last_snapshot: RwLock<Option<SystemTime>>,
    freshness: Duration,
}

impl Default for RosterReconciler {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl RosterReconciler {
    pub fn new(freshness: Duration) -> Self {
        Self {
            roster: RwLock::new(Roster::default()),
            performance: RwLock::new(None),
            last_snapshot: RwLock::new(None),
            freshness,
        }
    }

    pub fn players(&self) -> Vec<PlayerRecord> {
        self.read(|r| r.sorted())
    }

    pub fn online(&self) -> usize {
        self.read(Roster::len)
    }

    pub fn performance(&self) -> Option<Performance> {
        self.performance
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Runs `f` with the roster read-locked.
    pub fn read<T>(&self, f: impl FnOnce(&Roster) -> T) -> T {
        let guard = self.roster.read().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    fn write<T>(&self, f: impl FnOnce(&mut Roster) -> T) -> T {
        let mut guard = self.roster.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Returns whether the roster changed. Lines that match nothing are ignored.
    pub fn apply_line(&self, line: &str) -> bool {
        let Some(evidence) = parse_evidence(line) else {
            return false;
        };
        self.apply_evidence(&evidence)
    }

    pub fn apply_evidence(&self, evidence: &LogEvidence) -> bool {
        match evidence {
            LogEvidence::Joined(name) => self.write(|r| r.insert_user(name)),
            LogEvidence::Left(name) => self.write(|r| r.remove(name)),
            LogEvidence::Opped(name) => self.write(|r| r.set_rank(name, PlayerRank::Operator)),
            LogEvidence::Deopped(name) => self.write(|r| r.set_rank(name, PlayerRank::User)),
            LogEvidence::ListReport { names, .. } => self.write(|r| {
                if names.is_empty() {
                    return r.clear();
                }
                let keep: HashSet<&str> = names.iter().map(String::as_str).collect();
                let mut changed = r.retain_names(&keep);
                for name in names {
                    changed |= r.insert_user(name);
                }
                changed
            }),
        }
    }

    /// Merges a structured snapshot.
    ///
    /// Each capture is merged at most once; one that is not newer than the last merged
    /// capture is ignored. Only a snapshot captured within the freshness window may
    /// insert or evict members. An older one may lag behind the console and is only
    /// used to enrich records that already exist.
    pub fn apply_snapshot(&self, captured: &CapturedSnapshot, now: SystemTime) -> bool {
        {
            let mut last = self.last_snapshot.write().unwrap_or_else(|e| e.into_inner());
            if last.is_some_and(|at| captured.captured_at <= at) {
                return false;
            }
            *last = Some(captured.captured_at);
        }

        // A capture time in the future (clock skew) counts as brand new.
        let age = now
            .duration_since(captured.captured_at)
            .unwrap_or(Duration::ZERO);
        let fresh = age <= self.freshness;

        if let Some(perf) = &captured.snapshot.performance {
            *self.performance.write().unwrap_or_else(|e| e.into_inner()) = Some(perf.clone());
        }

        self.write(|r| {
            let mut changed = false;
            let mut seen = HashSet::<&str>::new();

            for p in &captured.snapshot.players {
                let name = p.name.trim();
                if name.is_empty() {
                    continue;
                }
                seen.insert(name);
                if !fresh && !r.players.contains_key(name) {
                    continue;
                }

                let record = r.players.entry(name.to_string()).or_insert_with(|| {
                    changed = true;
                    PlayerRecord::new(name)
                });

                let ping = p.ping.map(|ms| format!("{}ms", ms.max(0)));
                let link = Some(
                    p.linked
                        .as_deref()
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .unwrap_or(NO_LINK)
                        .to_string(),
                );
                let balance = p.balance.map(format_balance);

                changed |= update_field(&mut record.uuid, p.uuid.clone());
                changed |= update_field(&mut record.ping, ping);
                changed |= update_field(&mut record.link, link);
                changed |= update_field(&mut record.balance, balance);
            }

            if fresh {
                changed |= r.retain_names(&seen);
            }
            changed
        })
    }

    pub fn clear(&self) -> bool {
        self.write(Roster::clear)
    }
}

/// Keeps the old value when the new one is unknown.
fn update_field(slot: &mut Option<String>, value: Option<String>) -> bool {
    match value {
        Some(v) if slot.as_deref() != Some(v.as_str()) => {
            *slot = Some(v);
            true
        }
        _ => false,
    }
}

/// `1234.5` -> `$1,234.50`
pub fn format_balance(value: f64) -> String {
    if !value.is_finite() {
        return "$0.00".to_string();
    }
    let cents = (value.abs() * 100.0).round() as u64;
    let whole = (cents / 100).to_string();
    let frac = cents % 100;

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    let sign = if value < 0.0 && cents > 0 { "-" } else { "" };
    format!("{sign}${grouped}.{frac:02}")
}
