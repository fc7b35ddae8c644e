// Panic isolation for engine safety
// Notifier callbacks and runner tasks must never take the engine down
use std::any::Any;
use std::panic::{catch_unwind, UnwindSafe};
use tracing::error;

/// Result of a panic-guarded call
#[derive(Debug)]
pub enum PanicGuardResult<T> {
    /// Call returned normally
    Success(T),
    /// Call panicked
    Panicked(String),
}

/// Execute a closure with panic isolation
///
/// If the closure panics, the panic is caught and returned as PanicGuardResult::Panicked.
///
/// # Example
/// ```text
/// let result = execute_guarded(|| {
///     // This panic will be caught
///     panic!("test panic");
/// });
///
/// match result {
///     PanicGuardResult::Panicked(msg) => {
///         println!("Caught panic: {}", msg);
///     }
///     _ => {}
/// }
/// ```
pub fn execute_guarded<F, T>(f: F) -> PanicGuardResult<T>
where
    F: FnOnce() -> T + UnwindSafe,
{
    match catch_unwind(f) {
        Ok(result) => PanicGuardResult::Success(result),
        Err(payload) => {
            let panic_msg = panic_message(payload.as_ref());
            error!(panic_msg = %panic_msg, "Guarded call panicked");
            PanicGuardResult::Panicked(panic_msg)
        }
    }
}

/// Extract the message of a panic payload
///
/// Works for `catch_unwind` payloads and `JoinError::into_panic`.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_passes_value_through() {
        match execute_guarded(|| 41 + 1) {
            PanicGuardResult::Success(v) => assert_eq!(v, 42),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_panic_is_caught_with_message() {
        let result: PanicGuardResult<()> = execute_guarded(|| panic!("boom {}", 7));
        match result {
            PanicGuardResult::Panicked(msg) => assert_eq!(msg, "boom 7"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_message_from_join_error() {
        let join_err = tokio::spawn(async { panic!("task down") })
            .await
            .unwrap_err();
        assert!(join_err.is_panic());
        assert_eq!(panic_message(join_err.into_panic().as_ref()), "task down");
    }
}
