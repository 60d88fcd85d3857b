use warden_process::LineCategory;

type Predicate = fn(&str) -> bool;

/// Evaluated top to bottom; the first matching predicate decides the category.
const TUNNEL_RULES: &[(Predicate, LineCategory)] = &[
    (is_claim, LineCategory::Link),
    (is_error, LineCategory::Error),
    (has_url, LineCategory::Link),
    (is_success, LineCategory::Success),
];

/// Claim prompts, with or without a URL; some agent builds only print a claim code.
fn is_claim(line: &str) -> bool {
    line.to_ascii_lowercase().contains("claim")
}

fn has_url(line: &str) -> bool {
    line.contains("https://") || line.contains("http://")
}

fn is_error(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    ["error", "failed", "fatal", "panicked", "denied", "invalid secret"]
        .iter()
        .any(|k| lower.contains(k))
}

fn is_success(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    if lower.contains("disconnect") {
        return false;
    }
    [
        "started",
        "running",
        "agent registered",
        "connected",
        "ready",
        "program approved",
    ]
    .iter()
    .any(|k| lower.contains(k))
}

pub fn classify_tunnel_line(line: &str) -> LineCategory {
    TUNNEL_RULES
        .iter()
        .find(|(pred, _)| pred(line))
        .map(|(_, category)| *category)
        .unwrap_or(LineCategory::Info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_win_over_everything() {
        assert_eq!(
            classify_tunnel_line("Visit link to setup https://playit.gg/claim/d3adb33f"),
            LineCategory::Link
        );
        assert_eq!(
            classify_tunnel_line("Claim your agent: code ab12cd"),
            LineCategory::Link
        );
        assert_eq!(
            classify_tunnel_line("claim failed, retrying"),
            LineCategory::Link
        );
    }

    #[test]
    fn errors_beat_plain_urls() {
        assert_eq!(
            classify_tunnel_line("error: failed to reach https://api.playit.gg"),
            LineCategory::Error
        );
        assert_eq!(
            classify_tunnel_line("see https://playit.gg/account for details"),
            LineCategory::Link
        );
    }

    #[test]
    fn success_and_fallback() {
        assert_eq!(classify_tunnel_line("1 tunnels running"), LineCategory::Success);
        assert_eq!(classify_tunnel_line("Server running on 0.0.0.0"), LineCategory::Success);
        assert_eq!(classify_tunnel_line("playit agent started"), LineCategory::Success);
        assert_eq!(classify_tunnel_line("agent ready"), LineCategory::Success);
        assert_eq!(classify_tunnel_line("Agent registered"), LineCategory::Success);
        assert_eq!(classify_tunnel_line("checking for updates"), LineCategory::Info);
        assert_eq!(classify_tunnel_line("tunnel disconnected, retrying"), LineCategory::Info);
    }
}
