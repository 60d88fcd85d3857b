use std::{sync::Arc, time::Duration, time::SystemTime};

use tokio::io::{AsyncBufReadExt, BufReader};
use warden_core::{
    ChannelSink, FanoutSink, ProcessSupervisor, RosterReconciler, SharedSink, TunnelSupervisor,
    WardenConfig,
    artifact::HttpArtifactFetcher,
    console_log::ConsoleLog,
    resources::ProcProbe,
    snapshot::{FileSnapshotSource, SnapshotPoller},
};
use warden_process::{Event, LineSource};

use crate::console::{Command, HELP, TunnelCommand};

mod console;
mod logging;

struct App {
    server: Arc<ProcessSupervisor>,
    tunnel: TunnelSupervisor,
    roster: Arc<RosterReconciler>,
    console_log: ConsoleLog,
    sink: SharedSink,
}

impl App {
    fn say(&self, text: impl Into<String>) {
        self.sink.emit(Event::notice(LineSource::Warden, text));
    }

    /// Returns false once the operator asked to quit.
    async fn handle(&self, command: Command) -> bool {
        match command {
            Command::Empty => {}
            Command::Forward(line) => {
                self.server.write(&line).await;
            }
            Command::Start => {
                self.server.start().await;
            }
            Command::Stop => {
                self.server.stop().await;
            }
            Command::Kill => {
                self.server.kill().await;
            }
            Command::Restart => {
                self.server.stop().await;
                self.server.start().await;
            }
            Command::Status => self.print_status(),
            Command::Players => self.print_players(),
            Command::Tunnel(TunnelCommand::Start) => {
                self.tunnel.start().await;
            }
            Command::Tunnel(TunnelCommand::Stop) => {
                self.tunnel.stop().await;
            }
            Command::Tunnel(TunnelCommand::Status) => {
                let retry = self.tunnel.retry_state();
                self.say(format!(
                    "tunnel {:?} (crashes {}, next delay {}ms)",
                    self.tunnel.state(),
                    retry.crashes(),
                    retry.next_delay().as_millis()
                ));
            }
            Command::Logs(n) => {
                for event in self.console_log.recent(n) {
                    println!("{}", event.render());
                }
            }
            Command::Help => self.say(HELP),
            Command::Unknown(line) => self.say(format!("unknown command {line:?}; {HELP}")),
            Command::Quit => return false,
        }
        true
    }

    fn print_status(&self) {
        let status = self.server.status();
        let mut line = format!("server {:?}", status.state);
        if let Some(pid) = self.server.pid() {
            line.push_str(&format!(" pid={pid}"));
        }
        if let Some(msg) = status.message.as_deref() {
            line.push_str(&format!(" ({msg})"));
        }
        line.push_str(&format!(
            ", players online {}, tunnel {:?}",
            self.roster.online(),
            self.tunnel.state()
        ));
        if let Some(sample) = self.server.latest_sample() {
            line.push_str(&format!(", memory {:.1}%", sample.system_memory_percent));
        }
        self.say(line);
    }

    fn print_players(&self) {
        let players = self.roster.players();
        self.say(format!("{} player(s) online", players.len()));
        for row in console::player_rows(&players) {
            self.say(row);
        }
        if let Some(perf) = self.roster.performance()
            && let Some(line) = console::performance_line(&perf)
        {
            self.say(line);
        }
    }

    async fn shutdown(&self) {
        self.tunnel.stop().await;
        self.server.stop().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = WardenConfig::from_env();
    let _log_guard = logging::init(&config.data_root.join("logs"))?;
    tracing::info!(data_root = %config.data_root.display(), "warden starting");

    let console_log =
        ConsoleLog::with_file(config.data_root.join("console.log"), config.console_log);
    let (channel, mut events) = ChannelSink::new();
    let sink: SharedSink = Arc::new(FanoutSink::new(vec![
        Arc::new(console_log.clone()),
        Arc::new(channel),
    ]));

    let render = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("{}", event.render());
        }
    });

    let roster = Arc::new(RosterReconciler::new(config.snapshot.freshness));
    let server = Arc::new(
        ProcessSupervisor::new(config.server.clone(), sink.clone(), roster.clone())
            .with_sampler(Arc::new(ProcProbe), config.sampler),
    );
    let fetcher = Arc::new(HttpArtifactFetcher::new(
        config.tunnel.download_url.clone(),
        config.tunnel.sha1.clone(),
    )?);
    let tunnel = TunnelSupervisor::new(config.tunnel.clone(), sink.clone(), fetcher);

    if let Some(path) = config.snapshot.path.clone() {
        let poller = SnapshotPoller::new(FileSnapshotSource::new(path), roster.clone());
        let roster = roster.clone();
        let server = server.clone();
        let sink = sink.clone();
        let every = config.snapshot.poll_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if poller.poll(server.is_running(), SystemTime::now()) {
                    sink.emit(Event::RosterChanged {
                        online: roster.online() as u32,
                    });
                }
            }
        });
    }

    let app = App {
        server,
        tunnel,
        roster,
        console_log,
        sink,
    };
    app.say(HELP);
    app.server.start().await;
    app.tunnel.start().await;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if !app.handle(console::parse_command(&line)).await {
                        break;
                    }
                }
                Ok(None) | Err(_) => {
                    // Detached (e.g. under a service manager): keep running until a signal.
                    tracing::info!("stdin closed; waiting for ctrl-c");
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("ctrl-c received");
                break;
            }
        }
    }

    app.shutdown().await;
    tracing::info!("warden stopped");
    let _ = tokio::time::timeout(Duration::from_millis(200), render).await;
    Ok(())
}
