//! Handlers for server-initiated calls
//!
//! The server may call methods on the client: on the session (channel-less
//! invokes and notifies), on a NetStream (`onStatus`, `onMetaData`, ...) or
//! on a shared object (`send` events). Each target holds an optional
//! [`ClientDelegate`]. [`HandlerMap`] is the usual implementation: a table
//! from method name to closure.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::amf::AmfValue;

/// Failure raised by a delegate or observer callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackError(pub String);

impl CallbackError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl fmt::Display for CallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for CallbackError {}

/// Receiver of server-initiated calls
///
/// Called on the session's reader task, so implementations must not block.
pub trait ClientDelegate: Send + Sync {
    fn invoke(&self, method: &str, args: &[AmfValue]) -> Result<(), CallbackError>;
}

type Handler = Arc<dyn Fn(&[AmfValue]) -> Result<(), CallbackError> + Send + Sync>;

/// Delegate backed by a name to closure table
///
/// ```
/// use rtmp_client::client::HandlerMap;
///
/// let delegate = HandlerMap::new()
///     .on("onBWDone", |_args| Ok(()))
///     .on("onMetaData", |args| {
///         println!("metadata: {:?}", args);
///         Ok(())
///     });
/// assert!(delegate.contains("onBWDone"));
/// ```
#[derive(Clone, Default)]
pub struct HandlerMap {
    handlers: HashMap<String, Handler>,
}

impl HandlerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `method`, replacing any previous one
    pub fn on<F>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&[AmfValue]) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.handlers.insert(method.into(), Arc::new(handler));
        self
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }
}

impl fmt::Debug for HandlerMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

impl ClientDelegate for HandlerMap {
    fn invoke(&self, method: &str, args: &[AmfValue]) -> Result<(), CallbackError> {
        match self.handlers.get(method) {
            Some(handler) => handler(args),
            None => {
                tracing::debug!(method = method, args = args.len(), "No handler for method");
                Ok(())
            }
        }
    }
}

/// Run a delegate call, turning panics into [`CallbackError`]
pub(crate) fn call_delegate(
    delegate: &dyn ClientDelegate,
    method: &str,
    args: &[AmfValue],
) -> Result<(), CallbackError> {
    match catch_unwind(AssertUnwindSafe(|| delegate.invoke(method, args))) {
        Ok(result) => result,
        Err(panic) => Err(CallbackError(panic_message(panic.as_ref(), method))),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send), method: &str) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("handler for {} panicked: {}", method, detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_handler_map_dispatch() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let delegate = HandlerMap::new().on("onBWDone", move |args| {
            counter.fetch_add(args.len(), Ordering::SeqCst);
            Ok(())
        });

        delegate
            .invoke("onBWDone", &[AmfValue::Null, AmfValue::Number(1.0)])
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        // Unknown methods are ignored
        assert!(delegate.invoke("missing", &[]).is_ok());
    }

    #[test]
    fn test_handler_error_propagates() {
        let delegate = HandlerMap::new().on("fail", |_| Err(CallbackError::new("bad args")));
        let err = call_delegate(&delegate, "fail", &[]).unwrap_err();
        assert_eq!(err.to_string(), "bad args");
    }

    #[test]
    fn test_panic_is_caught() {
        let delegate = HandlerMap::new().on("boom", |_| panic!("kaboom"));
        let err = call_delegate(&delegate, "boom", &[]).unwrap_err();
        assert!(err.0.contains("boom"));
        assert!(err.0.contains("kaboom"));
    }
}
