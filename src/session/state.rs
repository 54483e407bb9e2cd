use std::fmt;

/// Lifecycle phase of a tunnel session, published on its status channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Starting,
    Running,
    Reconnecting,
    Stopping,
    Stopped,
}

impl SessionState {
    /// Whether the session has ended and will not change state again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Reconnecting => "reconnecting",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
