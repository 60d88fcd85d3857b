//! Supervision of the tunnel agent.
//!
//! The agent runs on a pseudo-terminal because it only prints its claim link and
//! status lines when attached to a tty. Its output is relayed by a blocking reader;
//! end-of-stream without a prior clean stop is treated as a crash and triggers a
//! delayed restart with exponential backoff.

use std::{
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use portable_pty::{CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio_util::sync::CancellationToken;
use warden_process::{Event, LineSource, TunnelState};

use crate::artifact::ArtifactFetcher;
use crate::classify::classify_tunnel_line;
use crate::config::TunnelConfig;
use crate::error::{SupervisorError, format_error_chain};
use crate::line_stream::BlockingLineStream;
use crate::retry::RetryState;
use crate::sink::SharedSink;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

struct AgentRun {
    generation: u64,
    pid: Option<u32>,
    child: Box<dyn portable_pty::Child + Send + Sync>,
    master: Option<Box<dyn MasterPty + Send>>,
    clean: Arc<AtomicBool>,
}

#[derive(Default)]
struct Shared {
    state: TunnelState,
    retry: RetryState,
    generation: u64,
    run: Option<AgentRun>,
    pending_restart: Option<CancellationToken>,
}

struct Inner {
    config: TunnelConfig,
    sink: SharedSink,
    fetcher: Arc<dyn ArtifactFetcher>,
    lifecycle: tokio::sync::Mutex<()>,
    shared: Mutex<Shared>,
}

#[derive(Clone)]
pub struct TunnelSupervisor {
    inner: Arc<Inner>,
}

impl TunnelSupervisor {
    pub fn new(config: TunnelConfig, sink: SharedSink, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                sink,
                fetcher,
                lifecycle: tokio::sync::Mutex::new(()),
                shared: Mutex::new(Shared::default()),
            }),
        }
    }

    fn shared(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.inner.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> TunnelState {
        self.shared().state
    }

    pub fn retry_state(&self) -> RetryState {
        self.shared().retry
    }

    pub fn pid(&self) -> Option<u32> {
        let s = self.shared();
        s.run.as_ref().and_then(|r| r.pid)
    }

    fn set_state(&self, state: TunnelState) {
        self.shared().state = state;
        self.inner.sink.emit(Event::TunnelState { state });
    }

    fn notice(&self, text: impl Into<String>) {
        self.inner.sink.emit(Event::notice(LineSource::Tunnel, text));
    }

    fn report(&self, err: &SupervisorError) {
        self.inner
            .sink
            .emit(Event::error(LineSource::Tunnel, err.code(), err.to_string()));
    }

    /// Operator start. A pending automatic restart is superseded by this one.
    pub async fn start(&self) -> TunnelState {
        if let Some(token) = self.shared().pending_restart.take() {
            token.cancel();
        }
        let _guard = self.inner.lifecycle.lock().await;
        self.start_locked().await
    }

    async fn start_locked(&self) -> TunnelState {
        let (has_run, state) = {
            let s = self.shared();
            (s.run.is_some(), s.state)
        };
        if has_run && matches!(state, TunnelState::Running | TunnelState::Starting) {
            self.notice("tunnel agent is already running");
            return TunnelState::Running;
        }
        if has_run {
            // Leftover of a crashed run; reap it first.
            self.shutdown_locked().await;
        }

        self.set_state(TunnelState::Starting);
        let artifact = &self.inner.config.artifact;
        let path = match self.inner.fetcher.fetch_if_absent(artifact).await {
            Ok(p) => p,
            Err(e) => {
                let err = SupervisorError::Artifact {
                    path: artifact.clone(),
                    message: format_error_chain(&e),
                };
                tracing::warn!(error = %err, "tunnel artifact unavailable");
                self.report(&err);
                self.set_state(TunnelState::Idle);
                return TunnelState::Idle;
            }
        };

        match self.spawn_agent(&path) {
            Ok(pid) => {
                match pid {
                    Some(pid) => self.notice(format!("tunnel agent started (pid {pid})")),
                    None => self.notice("tunnel agent started"),
                }
                self.inner.sink.emit(Event::TunnelState {
                    state: TunnelState::Running,
                });
                TunnelState::Running
            }
            Err(e) => {
                tracing::warn!(error = %e, "tunnel agent spawn failed");
                self.report(&e);
                self.set_state(TunnelState::Idle);
                TunnelState::Idle
            }
        }
    }

    fn spawn_agent(&self, path: &Path) -> Result<Option<u32>, SupervisorError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 120,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SupervisorError::Pty(e.to_string()))?;

        let mut cmd = CommandBuilder::new(path);
        cmd.args(&self.inner.config.args);
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            cmd.cwd(dir);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SupervisorError::Spawn {
                program: path.display().to_string(),
                source: std::io::Error::other(e.to_string()),
            })?;
        // The agent holds the only slave descriptor now, so its exit reads as EOF.
        drop(pair.slave);
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SupervisorError::Pty(e.to_string()))?;

        let pid = child.process_id();
        let clean = Arc::new(AtomicBool::new(false));
        let generation = {
            let mut s = self.shared();
            s.generation = s.generation.wrapping_add(1);
            s.run = Some(AgentRun {
                generation: s.generation,
                pid,
                child,
                master: Some(pair.master),
                clean: clean.clone(),
            });
            s.state = TunnelState::Running;
            s.generation
        };
        tracing::info!(pid = ?pid, generation, "tunnel agent spawned");

        let handle = tokio::runtime::Handle::current();
        let sink = self.inner.sink.clone();
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut lines = BlockingLineStream::new(reader);
            let mut last: Option<String> = None;
            loop {
                match lines.next_line() {
                    Ok(Some(line)) => {
                        let text = line.trim();
                        if text.is_empty() || last.as_deref() == Some(text) {
                            continue;
                        }
                        last = Some(text.to_string());
                        sink.emit(Event::Line {
                            source: LineSource::Tunnel,
                            category: classify_tunnel_line(text),
                            text: text.to_string(),
                        });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(error = %e, "tunnel relay read failed");
                        break;
                    }
                }
            }
            if !clean.load(Ordering::SeqCst) {
                handle.spawn(async move { this.handle_unexpected_exit(generation).await });
            }
        });

        Ok(pid)
    }

    /// Called when the agent's output ended without an operator stop: records the crash
    /// and schedules the restart. Stale generations are ignored.
    pub(crate) async fn handle_unexpected_exit(&self, generation: u64) {
        let (attempt, delay, token) = {
            let mut s = self.shared();
            let current = s.generation == generation
                && s.run.as_ref().is_some_and(|r| r.generation == generation)
                && s.run.as_ref().is_some_and(|r| !r.clean.load(Ordering::SeqCst));
            if !current {
                return;
            }
            s.state = TunnelState::Crashed;
            let delay = s.retry.record_crash(&self.inner.config.retry);
            let token = CancellationToken::new();
            if let Some(old) = s.pending_restart.replace(token.clone()) {
                old.cancel();
            }
            (s.retry.crashes(), delay, token)
        };

        tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, "tunnel agent crashed");
        self.inner.sink.emit(Event::TunnelState {
            state: TunnelState::Crashed,
        });
        self.inner.sink.emit(Event::TunnelCrashed {
            attempt,
            delay_ms: delay.as_millis() as u64,
        });
        self.schedule_restart(token, delay);
    }

    fn schedule_restart(&self, token: CancellationToken, delay: Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let _guard = this.inner.lifecycle.lock().await;
            {
                let mut s = this.shared();
                if token.is_cancelled() {
                    return;
                }
                s.pending_restart = None;
            }
            this.set_state(TunnelState::Restarting);
            this.shutdown_locked().await;
            this.start_locked().await;
        });
    }

    /// Operator stop: cancels any pending restart and resets the backoff.
    pub async fn stop(&self) -> TunnelState {
        if let Some(token) = self.shared().pending_restart.take() {
            token.cancel();
        }
        let _guard = self.inner.lifecycle.lock().await;

        let was_running = {
            let mut s = self.shared();
            if let Some(token) = s.pending_restart.take() {
                token.cancel();
            }
            if let Some(run) = &s.run {
                run.clean.store(true, Ordering::SeqCst);
            }
            s.run.is_some()
        };
        if was_running {
            self.set_state(TunnelState::Stopping);
        }
        self.shutdown_locked().await;

        let changed = {
            let mut s = self.shared();
            s.retry.reset();
            let changed = s.state != TunnelState::Idle;
            s.state = TunnelState::Idle;
            changed
        };
        if changed {
            self.inner.sink.emit(Event::TunnelState {
                state: TunnelState::Idle,
            });
        }
        if was_running {
            self.notice("tunnel agent stopped");
        }
        TunnelState::Idle
    }

    /// Terminates and reaps the current run, if any. RetryState is left untouched.
    async fn shutdown_locked(&self) {
        let Some(mut run) = self.shared().run.take() else {
            return;
        };
        run.clean.store(true, Ordering::SeqCst);
        drop(run.master.take());

        if let Ok(Some(_)) = run.child.try_wait() {
            return;
        }

        terminate(run.pid);
        let deadline = tokio::time::Instant::now() + self.inner.config.stop_grace;
        loop {
            match run.child.try_wait() {
                Ok(Some(_)) | Err(_) => return,
                Ok(None) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        tracing::warn!(pid = ?run.pid, "tunnel agent ignored SIGTERM; killing");
        let mut killer = run.child.clone_killer();
        let _ = killer.kill();
        let mut child = run.child;
        let _ = tokio::task::spawn_blocking(move || child.wait()).await;
    }
}

fn terminate(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // The agent is a session leader on its pty, so signal the whole group.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::artifact::HttpArtifactFetcher;
    use crate::retry::RetryPolicy;
    use crate::sink::MemorySink;
    use warden_process::LineCategory;

    fn agent_script(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("agent.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        path
    }

    fn supervisor(artifact: std::path::PathBuf) -> (TunnelSupervisor, MemorySink) {
        let sink = MemorySink::default();
        let mut cfg = TunnelConfig::new(artifact);
        cfg.retry = RetryPolicy {
            base: Duration::from_millis(50),
            cap: Duration::from_millis(200),
        };
        cfg.stop_grace = Duration::from_millis(500);
        let fetcher = Arc::new(HttpArtifactFetcher::new(None, None).unwrap());
        (
            TunnelSupervisor::new(cfg, Arc::new(sink.clone()), fetcher),
            sink,
        )
    }

    fn crashes(sink: &MemorySink) -> Vec<(u32, u64)> {
        sink.events()
            .iter()
            .filter_map(|e| match e {
                Event::TunnelCrashed { attempt, delay_ms } => Some((*attempt, *delay_ms)),
                _ => None,
            })
            .collect()
    }

    async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        cond()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn crashing_agent_is_restarted_with_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let script = agent_script(
            dir.path(),
            "echo 'Visit https://playit.gg/claim/abc123 to setup'\nexit 1",
        );
        let (sup, sink) = supervisor(script);

        assert_eq!(sup.start().await, TunnelState::Running);
        assert!(eventually(|| crashes(&sink).len() >= 3).await);
        assert_eq!(&crashes(&sink)[..3], &[(1, 50), (2, 100), (3, 200)]);
        assert!(sink.events().iter().any(|e| matches!(
            e,
            Event::Line { source: LineSource::Tunnel, category: LineCategory::Link, .. }
        )));

        assert_eq!(sup.stop().await, TunnelState::Idle);
        assert_eq!(sup.retry_state().crashes(), 0);

        let seen = crashes(&sink).len();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(crashes(&sink).len(), seen);
        assert_eq!(sup.state(), TunnelState::Idle);

        // A fresh start after the operator stop begins the backoff sequence again.
        assert_eq!(sup.start().await, TunnelState::Running);
        assert!(eventually(|| crashes(&sink).len() > seen).await);
        assert_eq!(crashes(&sink)[seen], (1, 50));
        sup.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn operator_stop_is_not_a_crash() {
        let dir = tempfile::tempdir().unwrap();
        let script = agent_script(dir.path(), "echo 'tunnel running'\nexec sleep 600");
        let (sup, sink) = supervisor(script);

        sup.start().await;
        assert!(sup.pid().is_some());
        assert!(eventually(|| sink.rendered().iter().any(|l| l.contains("tunnel running"))).await);

        assert_eq!(sup.stop().await, TunnelState::Idle);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(crashes(&sink).is_empty());
        assert!(sup.pid().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_artifact_aborts_without_counting_a_crash() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, sink) = supervisor(dir.path().join("playit"));

        assert_eq!(sup.start().await, TunnelState::Idle);
        assert_eq!(sup.retry_state().crashes(), 0);
        assert!(sink.events().iter().any(|e| matches!(
            e,
            Event::Error { code, .. } if code == "artifact_unavailable"
        )));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stale_generation_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let script = agent_script(dir.path(), "exec sleep 600");
        let (sup, sink) = supervisor(script);

        sup.start().await;
        sup.handle_unexpected_exit(0).await;
        assert!(crashes(&sink).is_empty());
        assert_eq!(sup.state(), TunnelState::Running);
        sup.stop().await;
    }
}
