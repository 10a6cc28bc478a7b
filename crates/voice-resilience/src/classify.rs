//! Classification of transport session errors
//!
//! Decides whether a session error reported by the transport is a transient
//! link problem worth a reconnect loop, or something a reconnect will not fix.

/// Trait for classifying errors as retryable or not
pub trait RetryClassifier<E: ?Sized> {
    /// Check if the error is retryable
    fn is_retryable(&self, error: &E) -> bool;
}

/// Classifier for realtime voice transport error messages
#[derive(Debug, Clone, Default)]
pub struct TransportErrorClassifier;

impl TransportErrorClassifier {
    /// WebSocket close codes that indicate a transient condition
    pub fn is_close_code_retryable(code: u16) -> bool {
        matches!(
            code,
            1001 | // Going Away
            1006 | // Abnormal Closure
            1011 | // Internal Error
            1012 | // Service Restart
            1013   // Try Again Later
        )
    }

    fn is_fatal_message(msg: &str) -> bool {
        msg.contains("unauthorized")
            || msg.contains("forbidden")
            || msg.contains("invalid token")
            || msg.contains("permission denied")
            || msg.contains("corrupt")
            || msg.contains("invalid state")
    }
}

impl RetryClassifier<str> for TransportErrorClassifier {
    fn is_retryable(&self, error: &str) -> bool {
        let msg = error.to_lowercase();

        if Self::is_fatal_message(&msg) {
            return false;
        }

        // Link-level failures
        if msg.contains("connection")
            || msg.contains("disconnect")
            || msg.contains("timeout")
            || msg.contains("timed out")
            || msg.contains("network")
            || msg.contains("websocket")
            || msg
                .split(|c: char| !c.is_ascii_alphanumeric())
                .any(|word| word == "ice" || word == "dtls")
        {
            return true;
        }

        // Server-side hiccups
        if msg.contains("502")
            || msg.contains("503")
            || msg.contains("504")
            || msg.contains("service unavailable")
            || msg.contains("temporar")
            || msg.contains("try again")
        {
            return true;
        }

        msg.split(|c: char| !c.is_ascii_digit())
            .filter_map(|token| token.parse::<u16>().ok())
            .any(Self::is_close_code_retryable)
    }
}
