//! One-shot reply channel for client-originated feed operations.
//!
//! A token wraps a transport supplied by the caller. Exactly one result
//! reaches the transport: an explicit `send`, or, if the handler only
//! recorded a result, delivery of the pending result when the token is
//! dropped. Further sends are silently ignored, preserving
//! at-most-once delivery even when an operation passes through several
//! handlers.

use lodestone_core::{ErrorType, Timestamp};
use parking_lot::Mutex;

/// Result of a feed operation as delivered to the client.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedResult {
    /// Classification of the outcome.
    pub error_type: ErrorType,
    /// Error message; empty on success.
    pub message: String,
    /// For update results: the timestamp of the existing document
    /// (zero when none was found).
    pub existing_timestamp: Option<Timestamp>,
}

impl FeedResult {
    /// A success result.
    pub fn ok() -> Self {
        FeedResult {
            error_type: ErrorType::None,
            message: String::new(),
            existing_timestamp: None,
        }
    }

    /// An update result carrying the existing document's timestamp.
    pub fn update_ok(existing_timestamp: Timestamp) -> Self {
        FeedResult {
            error_type: ErrorType::None,
            message: String::new(),
            existing_timestamp: Some(existing_timestamp),
        }
    }

    /// An error result.
    pub fn error(error_type: ErrorType, message: impl Into<String>) -> Self {
        FeedResult {
            error_type,
            message: message.into(),
            existing_timestamp: None,
        }
    }

    /// An update-shaped error result.
    pub fn update_error(error_type: ErrorType, message: impl Into<String>) -> Self {
        FeedResult {
            error_type,
            message: message.into(),
            existing_timestamp: Some(Timestamp(0)),
        }
    }
}

impl Default for FeedResult {
    fn default() -> Self {
        FeedResult::ok()
    }
}

/// Where a token delivers its result.
pub trait FeedTokenTransport: Send {
    /// Receive the operation's result. Called at most once.
    fn send(&self, result: FeedResult, document_was_found: bool);
}

struct TokenState {
    transport: Option<Box<dyn FeedTokenTransport>>,
    pending: FeedResult,
    document_was_found: bool,
}

/// One-shot reply channel. See the module docs for delivery semantics.
pub struct FeedToken {
    state: Mutex<TokenState>,
}

impl FeedToken {
    /// Wrap a transport.
    pub fn new(transport: Box<dyn FeedTokenTransport>) -> Self {
        FeedToken {
            state: Mutex::new(TokenState {
                transport: Some(transport),
                pending: FeedResult::ok(),
                document_was_found: false,
            }),
        }
    }

    /// Record the result to deliver when the token completes, without
    /// delivering it yet. A later `set_result` overwrites an earlier one.
    pub fn set_result(&self, result: FeedResult, document_was_found: bool) {
        let mut state = self.state.lock();
        state.pending = result;
        state.document_was_found = document_was_found;
    }

    /// Deliver `result` now. No-op if the token already completed.
    pub fn send(&self, result: FeedResult, document_was_found: bool) {
        let transport = {
            let mut state = self.state.lock();
            state.transport.take()
        };
        if let Some(transport) = transport {
            transport.send(result, document_was_found);
        }
    }

    /// Deliver the recorded (or default OK) result now.
    pub fn complete(&self) {
        let (transport, result, found) = {
            let mut state = self.state.lock();
            (
                state.transport.take(),
                state.pending.clone(),
                state.document_was_found,
            )
        };
        if let Some(transport) = transport {
            transport.send(result, found);
        }
    }

    /// True when a result has already been delivered.
    pub fn completed(&self) -> bool {
        self.state.lock().transport.is_none()
    }
}

impl Drop for FeedToken {
    fn drop(&mut self) {
        self.complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Recorder {
        sends: Arc<AtomicUsize>,
        last: Arc<Mutex<Option<(FeedResult, bool)>>>,
    }

    impl FeedTokenTransport for Recorder {
        fn send(&self, result: FeedResult, document_was_found: bool) {
            self.sends.fetch_add(1, Ordering::SeqCst);
            *self.last.lock() = Some((result, document_was_found));
        }
    }

    fn recorder() -> (
        Box<Recorder>,
        Arc<AtomicUsize>,
        Arc<Mutex<Option<(FeedResult, bool)>>>,
    ) {
        let sends = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(Mutex::new(None));
        (
            Box::new(Recorder {
                sends: Arc::clone(&sends),
                last: Arc::clone(&last),
            }),
            sends,
            last,
        )
    }

    #[test]
    fn test_send_delivers_once() {
        let (transport, sends, last) = recorder();
        let token = FeedToken::new(transport);
        token.send(
            FeedResult::error(ErrorType::ResourceExhausted, "full"),
            false,
        );
        token.send(FeedResult::ok(), true);
        assert_eq!(sends.load(Ordering::SeqCst), 1);
        let (result, found) = last.lock().clone().unwrap();
        assert_eq!(result.error_type, ErrorType::ResourceExhausted);
        assert!(!found);
    }

    #[test]
    fn test_drop_delivers_pending_result() {
        let (transport, sends, last) = recorder();
        {
            let token = FeedToken::new(transport);
            token.set_result(FeedResult::update_ok(Timestamp(10)), true);
        }
        assert_eq!(sends.load(Ordering::SeqCst), 1);
        let (result, found) = last.lock().clone().unwrap();
        assert_eq!(result.existing_timestamp, Some(Timestamp(10)));
        assert!(found);
    }

    #[test]
    fn test_drop_after_send_is_silent() {
        let (transport, sends, _) = recorder();
        {
            let token = FeedToken::new(transport);
            token.send(FeedResult::ok(), true);
        }
        assert_eq!(sends.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_default_result_is_ok() {
        let (transport, _, last) = recorder();
        drop(FeedToken::new(transport));
        let (result, found) = last.lock().clone().unwrap();
        assert_eq!(result.error_type, ErrorType::None);
        assert!(result.message.is_empty());
        assert!(!found);
    }
}
