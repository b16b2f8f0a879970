//! Error types for the mesh call path.

use std::fmt;
use std::time::Duration;

/// Classification of a mesh error, used for metric labels and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    DiscoveryUnavailable,
    ServiceNotFound,
    NoHealthyInstance,
    CircuitOpen,
    RateLimited,
    Timeout,
    Transport,
    PredictedFailure,
    BudgetExhausted,
    Cancelled,
}

impl ErrorKind {
    /// Stable label for metric counters.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::DiscoveryUnavailable => "discovery_unavailable",
            Self::ServiceNotFound => "service_not_found",
            Self::NoHealthyInstance => "no_healthy_instance",
            Self::CircuitOpen => "circuit_open",
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::Transport => "transport",
            Self::PredictedFailure => "predicted_failure",
            Self::BudgetExhausted => "budget_exhausted",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration rejected at mesh construction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("configuration rejected: {}", violations.join("; "))]
    Violations { violations: Vec<String> },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid { field, reason: reason.into() }
    }
}

/// Unified error for mesh operations, generic over the host transport error.
///
/// Admission denials (`CircuitOpen`, `RateLimited`, `PredictedFailure`) and
/// terminal errors bubble to the caller unchanged. `Transport` and `Timeout`
/// are consumed by the retry loop until attempts or budget run out.
/// `Cancelled` is terminal and is never counted as a circuit failure.
#[derive(Debug)]
pub enum MeshError<E> {
    /// Invalid or incompatible configuration.
    Config(ConfigError),
    /// The registry backend could not be reached.
    DiscoveryUnavailable { service: String, detail: String },
    /// The registry answered but knows no such service.
    ServiceNotFound { service: String },
    /// Discovery returned instances, but none was leasable.
    NoHealthyInstance { service: String, candidates: usize },
    /// The circuit breaker refused admission.
    CircuitOpen {
        service: String,
        failure_count: u64,
        open_for: Duration,
        /// Strategy-specific denial detail, e.g. `dependency_unhealthy:<dep>`.
        cause: Option<String>,
    },
    /// The rate limiter refused admission.
    RateLimited { wait: Duration, reason: String },
    /// A single attempt exceeded its deadline.
    Timeout { elapsed: Duration, limit: Duration },
    /// The underlying transport failed.
    Transport(E),
    /// The failure predictor denied admission.
    PredictedFailure { service: String, likelihood: f64, confidence: f64 },
    /// The retry wall-time budget is consumed.
    BudgetExhausted { attempts: usize, elapsed: Duration, budget: Duration },
    /// The caller cancelled the operation.
    Cancelled { elapsed: Duration },
}

impl<E> MeshError<E> {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::DiscoveryUnavailable { .. } => ErrorKind::DiscoveryUnavailable,
            Self::ServiceNotFound { .. } => ErrorKind::ServiceNotFound,
            Self::NoHealthyInstance { .. } => ErrorKind::NoHealthyInstance,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Transport(_) => ErrorKind::Transport,
            Self::PredictedFailure { .. } => ErrorKind::PredictedFailure,
            Self::BudgetExhausted { .. } => ErrorKind::BudgetExhausted,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Whether the retry loop may try again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Borrow the transport error if present.
    pub fn as_transport(&self) -> Option<&E> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }

    /// Extract the transport error if present.
    pub fn into_transport(self) -> Option<E> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for MeshError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "{}", e),
            Self::DiscoveryUnavailable { service, detail } => {
                write!(f, "discovery unavailable for {}: {}", service, detail)
            }
            Self::ServiceNotFound { service } => write!(f, "service not found: {}", service),
            Self::NoHealthyInstance { service, candidates } => {
                write!(f, "no healthy instance of {} ({} candidates)", service, candidates)
            }
            Self::CircuitOpen { service, failure_count, open_for, cause } => {
                write!(
                    f,
                    "circuit open for {} ({} failures, open {:?})",
                    service, failure_count, open_for
                )?;
                if let Some(cause) = cause {
                    write!(f, ": {}", cause)?;
                }
                Ok(())
            }
            Self::RateLimited { wait, reason } => {
                write!(f, "rate limited ({}), retry after {:?}", reason, wait)
            }
            Self::Timeout { elapsed, limit } => {
                write!(f, "attempt timed out after {:?} (limit {:?})", elapsed, limit)
            }
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::PredictedFailure { service, likelihood, confidence } => write!(
                f,
                "admission denied for {}: predicted failure (likelihood {:.2}, confidence {:.2})",
                service, likelihood, confidence
            ),
            Self::BudgetExhausted { attempts, elapsed, budget } => write!(
                f,
                "retry budget exhausted after {} attempts in {:?} (budget {:?})",
                attempts, elapsed, budget
            ),
            Self::Cancelled { elapsed } => write!(f, "cancelled after {:?}", elapsed),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for MeshError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Config(e) => Some(e),
            _ => None,
        }
    }
}

/// Structured report for a failed `call`, preserving the cause chain.
#[derive(Debug)]
pub struct CallFailure<E> {
    pub service: String,
    pub attempts: usize,
    pub elapsed: Duration,
    pub error: MeshError<E>,
}

impl<E> CallFailure<E> {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

impl<E: fmt::Display> fmt::Display for CallFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "call to {} failed after {} attempt(s) in {:?}: {}",
            self.service, self.attempts, self.elapsed, self.error
        )
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CallFailure<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
