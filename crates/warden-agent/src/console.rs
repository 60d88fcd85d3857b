use warden_core::roster::NO_LINK;
use warden_core::snapshot::Performance;
use warden_process::{PlayerRank, PlayerRecord};

const DEFAULT_LOG_TAIL: usize = 20;
const MAX_LOG_TAIL: usize = 1000;

pub const HELP: &str = "commands: :start :stop :kill :restart :status :players \
:tunnel start|stop|status :logs [n] :quit (anything else is sent to the server)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelCommand {
    Start,
    Stop,
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Kill,
    Restart,
    Status,
    Players,
    Tunnel(TunnelCommand),
    Logs(usize),
    Help,
    Quit,
    /// Sent verbatim to the server's stdin.
    Forward(String),
    Unknown(String),
    Empty,
}

/// `raw` is one stdin line without its line terminator. Anything that is not a
/// `:command` is forwarded untouched, surrounding whitespace included.
pub fn parse_command(raw: &str) -> Command {
    let line = raw.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    let Some(rest) = line.strip_prefix(':') else {
        return Command::Forward(raw.to_string());
    };

    let mut words = rest.split_whitespace();
    let verb = words.next().unwrap_or_default();
    let arg = words.next();
    match (verb, arg) {
        ("start", None) => Command::Start,
        ("stop", None) => Command::Stop,
        ("kill", None) => Command::Kill,
        ("restart", None) => Command::Restart,
        ("status", None) => Command::Status,
        ("players", None) => Command::Players,
        ("help", None) => Command::Help,
        ("quit" | "exit", None) => Command::Quit,
        ("tunnel", Some("start")) => Command::Tunnel(TunnelCommand::Start),
        ("tunnel", Some("stop")) => Command::Tunnel(TunnelCommand::Stop),
        ("tunnel", Some("status") | None) => Command::Tunnel(TunnelCommand::Status),
        ("logs", None) => Command::Logs(DEFAULT_LOG_TAIL),
        ("logs", Some(n)) => match n.parse::<usize>() {
            Ok(n) => Command::Logs(n.clamp(1, MAX_LOG_TAIL)),
            Err(_) => Command::Unknown(line.to_string()),
        },
        _ => Command::Unknown(line.to_string()),
    }
}

/// One row per player, in roster order.
pub fn player_rows(players: &[PlayerRecord]) -> Vec<String> {
    players
        .iter()
        .map(|p| {
            let rank = match p.rank {
                PlayerRank::Operator => "op",
                PlayerRank::User => "user",
            };
            format!(
                "{:<16} {:<4} {:>7} {:<16} {}",
                p.name,
                rank,
                p.ping.as_deref().unwrap_or("?"),
                p.link.as_deref().unwrap_or(NO_LINK),
                p.balance.as_deref().unwrap_or(""),
            )
            .trim_end()
            .to_string()
        })
        .collect()
}

pub fn performance_line(perf: &Performance) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(tps) = perf.tps {
        parts.push(format!("tps {tps:.1}"));
    }
    if let Some(mspt) = perf.mspt {
        parts.push(format!("mspt {mspt:.1}"));
    }
    (!parts.is_empty()).then(|| parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_lines_are_forwarded() {
        assert_eq!(parse_command("say hi"), Command::Forward("say hi".into()));
        assert_eq!(parse_command("  say hi  "), Command::Forward("  say hi  ".into()));
        assert_eq!(parse_command(" :status "), Command::Status);
        assert_eq!(parse_command("   "), Command::Empty);
    }

    #[test]
    fn colon_commands() {
        assert_eq!(parse_command(":start"), Command::Start);
        assert_eq!(parse_command(":quit"), Command::Quit);
        assert_eq!(parse_command(":tunnel"), Command::Tunnel(TunnelCommand::Status));
        assert_eq!(parse_command(":tunnel stop"), Command::Tunnel(TunnelCommand::Stop));
        assert_eq!(parse_command(":logs"), Command::Logs(20));
        assert_eq!(parse_command(":logs 5000"), Command::Logs(1000));
        assert_eq!(parse_command(":logs x"), Command::Unknown(":logs x".into()));
        assert_eq!(parse_command(":reboot"), Command::Unknown(":reboot".into()));
    }

    #[test]
    fn player_rows_fill_gaps() {
        let mut op = PlayerRecord::new("Alex");
        op.rank = PlayerRank::Operator;
        op.ping = Some("42ms".into());
        op.balance = Some("$1,234.56".into());
        let rows = player_rows(&[op, PlayerRecord::new("Steve")]);
        assert!(rows[0].starts_with("Alex"));
        assert!(rows[0].contains(" op "));
        assert!(rows[0].ends_with("$1,234.56"));
        assert!(rows[1].ends_with(" -"));
        assert!(rows[1].contains('?'));
    }
}
