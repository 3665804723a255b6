use std::collections::HashMap;
use std::time::{Duration, Instant};

use warden_proto::Severity;

/// Per-command kind used for rate limiting. Status texts are limited per
/// severity so a CRITICAL alert is never starved by INFO chatter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Arm,
    Disarm,
    Takeoff,
    Land,
    Rth,
    SetMode,
    Goto,
    SetHeading,
    SetAltitude,
    StatusText(Severity),
}

impl CommandKind {
    fn min_interval(&self) -> Duration {
        match self {
            CommandKind::StatusText(_) => Duration::from_secs(1),
            CommandKind::Goto | CommandKind::SetHeading | CommandKind::SetAltitude => {
                Duration::from_millis(500)
            }
            _ => Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Default)]
pub struct CommandRateLimit {
    last: HashMap<CommandKind, Instant>,
}

impl CommandRateLimit {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the command may be sent now; records the attempt.
    pub fn allow(&mut self, kind: CommandKind) -> bool {
        let now = Instant::now();
        if let Some(t) = self.last.get(&kind) {
            if now.duration_since(*t) < kind.min_interval() {
                return false;
            }
        }
        self.last.insert(kind, now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_send_within_interval_is_blocked() {
        let mut rl = CommandRateLimit::new();
        assert!(rl.allow(CommandKind::Rth));
        assert!(!rl.allow(CommandKind::Rth));
        // a different kind is independent
        assert!(rl.allow(CommandKind::Land));
    }

    #[test]
    fn statustext_limited_per_severity() {
        let mut rl = CommandRateLimit::new();
        assert!(rl.allow(CommandKind::StatusText(Severity::Critical)));
        assert!(!rl.allow(CommandKind::StatusText(Severity::Critical)));
        assert!(rl.allow(CommandKind::StatusText(Severity::Info)));
    }
}
