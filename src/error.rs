use std::any::Any;

use thiserror::Error;

/// Boxed error returned by producers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A key's resolved outcome: the producer's value or a structured failure.
pub type Outcome<V> = Result<V, CoalesceError>;

/// Coalescing errors.
///
/// Every variant carries the diagnostic name of the [`Coalescer`] instance
/// that produced it, so failures from several instances can be told apart.
///
/// [`Coalescer`]: crate::Coalescer
#[derive(Debug, Clone, Error)]
pub enum CoalesceError {
    /// A coalescer needs exactly one producer: a fetch producer or a batch
    /// producer, never both and never neither.
    #[error("{name}: exactly one of a fetch or batch producer must be configured")]
    InvalidConfiguration {
        /// Instance name.
        name: String,
    },
    /// A keyless fetch was attempted on an instance that only has a batch
    /// producer. There is no batch to join without a key.
    #[error("{name}: keyless fetch requires a fetch producer")]
    KeylessFetch {
        /// Instance name.
        name: String,
    },
    /// A batch operation was attempted on an instance that only has a
    /// single-key fetch producer.
    #[error("{name}: batch operations require a batch producer")]
    NoBatcher {
        /// Instance name.
        name: String,
    },
    /// The producer failed. Wraps whatever error (or panic message) the
    /// producer surfaced.
    #[error("{name}: producer failed: {message}")]
    Producer {
        /// Instance name.
        name: String,
        /// Display rendering of the producer's error.
        message: String,
    },
    /// The batch producer returned an ordered list whose length does not
    /// match the number of keys it was dispatched with.
    #[error("{name}: batch producer returned {actual} results for {expected} keys")]
    LengthMismatch {
        /// Instance name.
        name: String,
        /// Number of keys dispatched.
        expected: usize,
        /// Number of results returned.
        actual: usize,
    },
    /// The batch producer completed without resolving this key, either by
    /// early write or through its returned aggregate.
    #[error("{name}: result not found for key {key}")]
    MissingResult {
        /// Instance name.
        name: String,
        /// Debug rendering of the unresolved key.
        key: String,
    },
    /// The in-flight request was abandoned before a result was delivered.
    /// Only reachable if the delivering task is torn down mid-flight, e.g.
    /// at runtime shutdown.
    #[error("{name}: in-flight request was abandoned")]
    Abandoned {
        /// Instance name.
        name: String,
    },
}

impl CoalesceError {
    /// Coerce a producer error into a structured failure.
    ///
    /// Producers are free to surface any error type. If the value is
    /// already a [`CoalesceError`] (say, from a nested coalescer) it passes
    /// through untouched; anything else is wrapped with the instance name
    /// and the original error as the message.
    pub(crate) fn wrap(name: &str, err: BoxError) -> Self {
        match err.downcast::<CoalesceError>() {
            Ok(structured) => *structured,
            Err(err) => CoalesceError::Producer {
                name: name.to_string(),
                message: err.to_string(),
            },
        }
    }

    /// Convert a caught producer panic into a failure outcome.
    pub(crate) fn panicked(name: &str, panic: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = panic.downcast_ref::<&str>() {
            format!("producer panicked: {s}")
        } else if let Some(s) = panic.downcast_ref::<String>() {
            format!("producer panicked: {s}")
        } else {
            "producer panicked".to_string()
        };
        CoalesceError::Producer {
            name: name.to_string(),
            message,
        }
    }

    pub(crate) fn missing(name: &str, key: &impl std::fmt::Debug) -> Self {
        CoalesceError::MissingResult {
            name: name.to_string(),
            key: format!("{key:?}"),
        }
    }

    pub(crate) fn abandoned(name: &str) -> Self {
        CoalesceError::Abandoned {
            name: name.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_prefixes_foreign_errors() {
        let err: BoxError = "connection reset".into();
        let wrapped = CoalesceError::wrap("users", err);
        assert_eq!(
            wrapped.to_string(),
            "users: producer failed: connection reset"
        );
    }

    #[test]
    fn wrap_passes_structured_failures_through() {
        let inner = CoalesceError::missing("inner", &42);
        let err: BoxError = Box::new(inner);
        let wrapped = CoalesceError::wrap("outer", err);
        assert_eq!(wrapped.to_string(), "inner: result not found for key 42");
    }

    #[test]
    fn panics_render_their_payload() {
        let panic: Box<dyn Any + Send> = Box::new("BAD NUMBER".to_string());
        let err = CoalesceError::panicked("users", panic);
        assert_eq!(
            err.to_string(),
            "users: producer failed: producer panicked: BAD NUMBER"
        );
    }
}
