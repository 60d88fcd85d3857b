use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWriteExt},
    process::{ChildStdin, Command},
    sync::watch,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use warden_process::{Event, LineCategory, LineSource, ProcessState, ProcessStatus, RunId};

use crate::config::{SamplerConfig, ServerConfig};
use crate::error::SupervisorError;
use crate::line_stream::LineStream;
use crate::lock_cleanup::clear_stale_lock;
use crate::resources::{MemoryProbe, ResourceSampler};
use crate::roster::RosterReconciler;
use crate::sink::SharedSink;

/// How long the waiter lets the relays drain after the child exited.
const RELAY_DRAIN: Duration = Duration::from_secs(1);

/// What to run. The working directory is always the directory holding `artifact`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub artifact: PathBuf,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>, artifact: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            artifact: artifact.into(),
        }
    }

    /// `<java> -Xmx<M>M -jar <jar> nogui`
    pub fn java_jar(java: String, jar: &Path, memory_mb: u32) -> Self {
        let jar_name = jar
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "server.jar".to_string());
        Self {
            program: java,
            args: vec![
                format!("-Xmx{memory_mb}M"),
                "-jar".to_string(),
                jar_name,
                "nogui".to_string(),
            ],
            artifact: jar.to_path_buf(),
        }
    }

    pub fn working_dir(&self) -> PathBuf {
        match self.artifact.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

struct ActiveRun {
    pid: Option<u32>,
    exited: watch::Receiver<bool>,
    stopping: Arc<AtomicBool>,
    forced: Arc<AtomicBool>,
    kill: CancellationToken,
}

impl ActiveRun {
    fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    async fn wait_exit(&mut self) {
        let _ = self.exited.wait_for(|exited| *exited).await;
    }
}

/// Owns the lifecycle of the game server process.
///
/// Start and stop are serialized through one lifecycle lock. Command writers share a
/// separate stdin lock so they never interleave and never wait on a pending `stop`.
pub struct ProcessSupervisor {
    config: ServerConfig,
    sink: SharedSink,
    roster: Arc<RosterReconciler>,
    sampler: Option<(Arc<dyn MemoryProbe>, SamplerConfig)>,
    lifecycle: tokio::sync::Mutex<Option<ActiveRun>>,
    stdin: Arc<tokio::sync::Mutex<Option<ChildStdin>>>,
    status: Arc<Mutex<ProcessStatus>>,
    sampling: Mutex<Option<ResourceSampler>>,
}

impl ProcessSupervisor {
    pub fn new(config: ServerConfig, sink: SharedSink, roster: Arc<RosterReconciler>) -> Self {
        Self {
            config,
            sink,
            roster,
            sampler: None,
            lifecycle: tokio::sync::Mutex::new(None),
            stdin: Arc::new(tokio::sync::Mutex::new(None)),
            status: Arc::new(Mutex::new(ProcessStatus::idle())),
            sampling: Mutex::new(None),
        }
    }

    /// Samples the server's memory while it runs.
    pub fn with_sampler(mut self, probe: Arc<dyn MemoryProbe>, config: SamplerConfig) -> Self {
        self.sampler = Some((probe, config));
        self
    }

    pub fn status(&self) -> ProcessStatus {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_running(&self) -> bool {
        self.status().state.is_live()
    }

    pub fn pid(&self) -> Option<u32> {
        let status = self.status();
        status.pid.filter(|_| status.state.is_live())
    }

    pub fn latest_sample(&self) -> Option<warden_process::ResourceSample> {
        self.sampling
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(ResourceSampler::latest)
    }

    fn stop_sampling(&self) {
        let sampler = self.sampling.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(sampler) = sampler {
            sampler.cancel();
        }
    }

    fn publish(&self, status: ProcessStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status.clone();
        self.sink.emit(Event::ServerStatus { status });
    }

    fn notice(&self, text: impl Into<String>) {
        self.sink.emit(Event::notice(LineSource::Warden, text));
    }

    fn report(&self, err: &SupervisorError) {
        self.sink
            .emit(Event::error(LineSource::Warden, err.code(), err.to_string()));
    }

    /// Launches the server unless one is already running. Failures are reported to the
    /// sink; the returned status reflects the outcome.
    pub async fn start(&self) -> ProcessStatus {
        let mut guard = self.lifecycle.lock().await;
        if let Some(run) = guard.as_ref()
            && !run.has_exited()
        {
            match run.pid {
                Some(pid) => self.notice(format!("server is already running (pid {pid})")),
                None => self.notice("server is already running"),
            }
            return self.status();
        }
        if guard.take().is_some() {
            self.stop_sampling();
        }

        let launch = &self.config.launch;
        let dir = launch.working_dir();
        let lock = dir.join(&self.config.lock_file);
        match clear_stale_lock(&lock).await {
            Ok(killed) if !killed.is_empty() => self.notice(format!(
                "terminated {} stale process(es) holding {}",
                killed.len(),
                lock.display()
            )),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "pre-start cleanup failed");
                self.report(&e);
            }
        }

        let run_id = RunId::new();
        match self.spawn(&dir, run_id.clone()).await {
            Ok(run) => {
                *guard = Some(run);
            }
            Err(e) => {
                tracing::warn!(error = %e, program = %launch.program, "server spawn failed");
                self.report(&e);
                self.publish(ProcessStatus {
                    run_id: Some(run_id),
                    state: ProcessState::Failed,
                    pid: None,
                    exit_code: None,
                    message: Some(e.to_string()),
                });
            }
        }
        self.status()
    }

    async fn spawn(&self, dir: &Path, run_id: RunId) -> Result<ActiveRun, SupervisorError> {
        let launch = &self.config.launch;
        let mut cmd = Command::new(&launch.program);
        cmd.args(&launch.args)
            .current_dir(dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            program: launch.program.clone(),
            source,
        })?;
        let pid = child.id();
        tracing::info!(pid = ?pid, program = %launch.program, cwd = %dir.display(), "server spawned");

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        *self.stdin.lock().await = stdin;

        match pid {
            Some(pid) => self.notice(format!("server started (pid {pid})")),
            None => self.notice("server started"),
        }
        self.publish(ProcessStatus {
            run_id: Some(run_id.clone()),
            state: ProcessState::Running,
            pid,
            exit_code: None,
            message: None,
        });

        let mut relays = Vec::new();
        if let Some(out) = stdout {
            relays.push(relay(
                out,
                LineCategory::Stdout,
                self.sink.clone(),
                Some(self.roster.clone()),
            ));
        }
        if let Some(err) = stderr {
            relays.push(relay(err, LineCategory::Stderr, self.sink.clone(), None));
        }

        let (exit_tx, exit_rx) = watch::channel(false);
        let stopping = Arc::new(AtomicBool::new(false));
        let forced = Arc::new(AtomicBool::new(false));
        let kill = CancellationToken::new();

        tokio::spawn({
            let sink = self.sink.clone();
            let roster = self.roster.clone();
            let status = self.status.clone();
            let stdin = self.stdin.clone();
            let stopping = stopping.clone();
            let forced = forced.clone();
            let kill = kill.clone();
            async move {
                let res = tokio::select! {
                    res = child.wait() => res,
                    _ = kill.cancelled() => {
                        kill_process_group(pid);
                        let _ = child.start_kill();
                        child.wait().await
                    }
                };
                let code = res.as_ref().ok().and_then(|s| s.code());
                stdin.lock().await.take();

                for handle in relays {
                    let _ = tokio::time::timeout(RELAY_DRAIN, handle).await;
                }

                let forced = forced.load(Ordering::SeqCst);
                let stopping = stopping.load(Ordering::SeqCst);
                let (state, message) = if forced {
                    (ProcessState::Killed, "killed")
                } else if stopping {
                    (ProcessState::Exited, "stopped")
                } else if code == Some(0) {
                    (ProcessState::Exited, "exited")
                } else {
                    (ProcessState::Exited, "exited unexpectedly")
                };
                tracing::info!(pid = ?pid, code = ?code, state = ?state, "server exited");
                if !forced && !stopping && code != Some(0) {
                    let err = SupervisorError::UnexpectedExit;
                    sink.emit(Event::error(
                        LineSource::Warden,
                        err.code(),
                        format!("{err} (exit code {code:?})"),
                    ));
                }

                if roster.clear() {
                    sink.emit(Event::RosterChanged { online: 0 });
                }
                let final_status = ProcessStatus {
                    run_id: Some(run_id),
                    state,
                    pid,
                    exit_code: code,
                    message: Some(message.to_string()),
                };
                *status.lock().unwrap_or_else(|e| e.into_inner()) = final_status.clone();
                sink.emit(Event::ServerStatus {
                    status: final_status,
                });
                let _ = exit_tx.send(true);
            }
        });

        if let (Some((probe, cfg)), Some(pid)) = (&self.sampler, pid) {
            let sampler = ResourceSampler::spawn(self.sink.clone(), probe.clone(), *cfg, Some(pid));
            *self.sampling.lock().unwrap_or_else(|e| e.into_inner()) = Some(sampler);
        }

        Ok(ActiveRun {
            pid,
            exited: exit_rx,
            stopping,
            forced,
            kill,
        })
    }

    /// Sends `command` verbatim followed by a newline. Returns false when nothing was
    /// written.
    pub async fn write(&self, command: &str) -> bool {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            self.notice(format!("server is not running; dropped command: {command}"));
            return false;
        };

        let mut line = command.to_string();
        line.push('\n');
        let res = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = res {
            tracing::debug!(error = %e, "server stdin write failed");
            self.report(&SupervisorError::Relay(e));
            guard.take();
            return false;
        }
        true
    }

    /// Graceful shutdown: the stop command, then a forced kill once the timeout passes.
    pub async fn stop(&self) -> ProcessStatus {
        let mut guard = self.lifecycle.lock().await;
        let Some(run) = guard.as_mut() else {
            return self.status();
        };
        if run.has_exited() {
            *guard = None;
            self.stop_sampling();
            return self.status();
        }

        run.stopping.store(true, Ordering::SeqCst);
        let mut stopping = self.status();
        stopping.state = ProcessState::Stopping;
        stopping.message = Some("stopping".to_string());
        self.publish(stopping);

        let command = self.config.stop_command.clone();
        self.write(&command).await;

        let timeout = self.config.stop_timeout;
        if tokio::time::timeout(timeout, run.wait_exit()).await.is_err() {
            let err = SupervisorError::StopTimeout(timeout);
            tracing::warn!(pid = ?run.pid, "graceful stop timed out; killing");
            self.report(&err);
            run.forced.store(true, Ordering::SeqCst);
            run.kill.cancel();
            run.wait_exit().await;
        }

        *guard = None;
        self.stop_sampling();
        self.status()
    }

    /// Immediate forced termination.
    pub async fn kill(&self) -> ProcessStatus {
        let mut guard = self.lifecycle.lock().await;
        let Some(run) = guard.as_mut() else {
            return self.status();
        };
        if !run.has_exited() {
            tracing::info!(pid = ?run.pid, "killing server");
            run.forced.store(true, Ordering::SeqCst);
            run.kill.cancel();
            run.wait_exit().await;
        }
        *guard = None;
        self.stop_sampling();
        self.status()
    }
}

fn relay<R>(
    reader: R,
    category: LineCategory,
    sink: SharedSink,
    roster: Option<Arc<RosterReconciler>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = LineStream::new(reader);
        loop {
            match lines.next_line().await {
                Ok(Some(text)) => {
                    let changed = roster.as_ref().is_some_and(|r| r.apply_line(&text));
                    sink.emit(Event::Line {
                        source: LineSource::Server,
                        category,
                        text,
                    });
                    if changed && let Some(r) = &roster {
                        sink.emit(Event::RosterChanged {
                            online: r.online() as u32,
                        });
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, ?category, "server relay read failed");
                    let err = SupervisorError::Relay(e);
                    sink.emit(Event::error(LineSource::Warden, err.code(), err.to_string()));
                    break;
                }
            }
        }
    })
}

fn kill_process_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // The child called setsid(), so its pid is also its process group id.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

#[cfg(target_os = "linux")]
pub(crate) unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // NOTE: `unsafe fn` bodies are not implicitly unsafe in Rust 2024.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}
