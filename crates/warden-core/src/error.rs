use std::{path::PathBuf, time::Duration};

const MAX_MESSAGE_BYTES: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process did not exit within {}ms", .0.as_millis())]
    StopTimeout(Duration),

    #[error("process exited unexpectedly")]
    UnexpectedExit,

    #[error("output relay failed: {0}")]
    Relay(#[source] std::io::Error),

    #[error("artifact unavailable at {}: {message}", .path.display())]
    Artifact { path: PathBuf, message: String },

    #[error("pseudo-terminal setup failed: {0}")]
    Pty(String),

    #[error("stale lock cleanup failed for {}: {source}", .path.display())]
    LockCleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SupervisorError {
    /// Stable machine-readable code, surfaced in `Event::Error`.
    pub fn code(&self) -> &'static str {
        match self {
            SupervisorError::Spawn { .. } => "spawn_failed",
            SupervisorError::StopTimeout(_) => "stop_timeout",
            SupervisorError::UnexpectedExit => "unexpected_exit",
            SupervisorError::Relay(_) => "relay_io",
            SupervisorError::Artifact { .. } => "artifact_unavailable",
            SupervisorError::Pty(_) => "pty_failed",
            SupervisorError::LockCleanup { .. } => "lock_cleanup_failed",
        }
    }
}

pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        // thiserror messages often embed their source already.
        if parts.last().is_some_and(|last| last.contains(&s)) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        truncate_utf8(&parts.join(": "), MAX_MESSAGE_BYTES)
    }
}

pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn error_chain_skips_duplicated_causes() {
        let err = SupervisorError::Spawn {
            program: "java".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        let err = anyhow::Error::new(err).context("start server");
        assert_eq!(
            format_error_chain(&err),
            "start server: failed to spawn java: no such file"
        );
    }

    #[test]
    fn error_chain_keeps_distinct_causes() {
        let res: anyhow::Result<()> = Err(anyhow::anyhow!("connection reset"));
        let err = res.context("download agent").unwrap_err();
        assert_eq!(format_error_chain(&err), "download agent: connection reset");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "é".repeat(100);
        let out = truncate_utf8(&s, 41);
        assert!(out.len() <= 41);
        assert!(out.ends_with("…(truncated)"));
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            SupervisorError::StopTimeout(Duration::from_secs(30)).code(),
            "stop_timeout"
        );
        assert_eq!(
            SupervisorError::StopTimeout(Duration::from_secs(30)).to_string(),
            "process did not exit within 30000ms"
        );
    }
}
