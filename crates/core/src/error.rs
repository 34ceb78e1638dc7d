use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Invalid address list: {0}")]
    InvalidAddressList(String),

    #[error("Only one overlay listener is allowed per process")]
    MultipleOverlayListeners,

    #[error("UDP is only supported in NAT traversal mode")]
    UdpUnsupported,

    #[error("Overlay client error: {0}")]
    Client(String),

    #[error("NAT traversal session error: {0}")]
    Session(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Dial failed: {0}")]
    Dial(String),

    #[error("Dial timed out after {0} ms")]
    DialTimeout(u64),

    #[error("Listener closed")]
    ListenerClosed,

    #[error("Dialer closed")]
    DialerClosed,

    #[error("Invalid seed: {0}")]
    InvalidSeed(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{}", join_errors(.0))]
    Aggregate(Vec<TunnelError>),
}

impl TunnelError {
    /// Merge independently collected errors into one.
    ///
    /// Returns `None` for an empty list and the error itself when only one
    /// was collected.
    pub fn aggregate(mut errors: Vec<TunnelError>) -> Option<TunnelError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(TunnelError::Aggregate(errors)),
        }
    }

    /// Whether this error means a handle was shut down rather than failed.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ListenerClosed | Self::DialerClosed)
    }
}

fn join_errors(errors: &[TunnelError]) -> String {
    let parts: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    format!("{} errors occurred: {}", errors.len(), parts.join("; "))
}

pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_invalid_address_list() {
        let err = TunnelError::InvalidAddressList("from and to differ in length".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid address list: from and to differ in length"
        );
    }

    #[test]
    fn test_error_display_udp_unsupported() {
        let err = TunnelError::UdpUnsupported;
        assert_eq!(err.to_string(), "UDP is only supported in NAT traversal mode");
    }

    #[test]
    fn test_error_display_dial_timeout() {
        let err = TunnelError::DialTimeout(5000);
        assert_eq!(err.to_string(), "Dial timed out after 5000 ms");
    }

    #[test]
    fn test_error_display_multiple_overlay_listeners() {
        let err = TunnelError::MultipleOverlayListeners;
        assert_eq!(
            err.to_string(),
            "Only one overlay listener is allowed per process"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: TunnelError = io.into();
        assert!(matches!(err, TunnelError::Io(_)));
        assert_eq!(err.to_string(), "IO error: refused");
    }

    #[test]
    fn test_aggregate_empty_is_none() {
        assert!(TunnelError::aggregate(Vec::new()).is_none());
    }

    #[test]
    fn test_aggregate_single_is_unwrapped() {
        let err = TunnelError::aggregate(vec![TunnelError::ListenerClosed]).unwrap();
        assert!(matches!(err, TunnelError::ListenerClosed));
    }

    #[test]
    fn test_aggregate_display_joins_all() {
        let err = TunnelError::aggregate(vec![
            TunnelError::DialerClosed,
            TunnelError::Client("gone".to_string()),
        ])
        .unwrap();
        assert_eq!(
            err.to_string(),
            "2 errors occurred: Dialer closed; Overlay client error: gone"
        );
    }

    #[test]
    fn test_is_closed() {
        assert!(TunnelError::ListenerClosed.is_closed());
        assert!(TunnelError::DialerClosed.is_closed());
        assert!(!TunnelError::UdpUnsupported.is_closed());
    }
}
