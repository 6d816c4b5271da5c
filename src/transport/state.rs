//! Connection state published by the transport.

/// Lifecycle of the signaling connection.
///
/// ```text
/// Disconnected ──open──▶ Connecting ──socket up──▶ Authenticating ──auth sent──▶ Open
/// Open ──unexpected close──▶ Disconnected ──backoff──▶ Connecting
/// any ──close()──▶ Closing ──▶ Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Authenticating,
    Open,
    Closing,
}

impl ConnectionState {
    /// Only `Open` accepts outbound traffic.
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    /// A short human-readable label suitable for the status bar.
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Authenticating => "Authenticating",
            ConnectionState::Open => "Connected",
            ConnectionState::Closing => "Closing",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_open_is_open() {
        assert!(ConnectionState::Open.is_open());
        assert!(!ConnectionState::Authenticating.is_open());
        assert!(!ConnectionState::Connecting.is_open());
        assert!(!ConnectionState::Closing.is_open());
        assert!(!ConnectionState::Disconnected.is_open());
    }

    #[test]
    fn default_is_disconnected() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert_eq!(ConnectionState::Open.label(), "Connected");
    }
}
