use crate::parser::ParseError;
use thiserror::Error;

/// Raised while evaluating a subroutine body. Always caught at the
/// subroutine boundary and turned into that subroutine's fallback action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("unknown function {name} at line={line},col={col}")]
    UnknownFunction { name: String, line: usize, col: usize },
    #[error("{name} expects {expected} arguments but was called with {found} at line={line},col={col}")]
    Arity {
        name: String,
        expected: String,
        found: usize,
        line: usize,
        col: usize,
    },
    #[error("invalid regex {pattern:?}: {message}")]
    Regex { pattern: String, message: String },
    #[error("cannot convert {value:?} to {to}")]
    Coercion { value: String, to: &'static str },
    #[error("unknown subroutine {0}")]
    UnknownSub(String),
    #[error("call depth exceeded while calling {0}")]
    CallDepth(String),
    #[error("{0}")]
    Function(String),
}

/// Failures talking to an origin.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("no healthy backend available")]
    NoBackend,
    #[error("backend {0} is unhealthy")]
    Unhealthy(String),
    #[error("connection to backend {backend} failed: {message}")]
    Connect { backend: String, message: String },
    #[error("backend {0} timed out")]
    Timeout(String),
    #[error("backend request cancelled")]
    Cancelled,
}

impl BackendError {
    /// The synthetic status a client sees for this failure.
    pub fn status(&self) -> u16 {
        match self {
            BackendError::NoBackend | BackendError::Unhealthy(_) | BackendError::Cancelled => 503,
            BackendError::Connect { .. } => 502,
            BackendError::Timeout(_) => 504,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("restart limit of {0} exceeded")]
    RestartLimitExceeded(u32),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl PipelineError {
    pub fn status(&self) -> u16 {
        match self {
            PipelineError::RestartLimitExceeded(_) => 503,
            PipelineError::Backend(err) => err.status(),
        }
    }
}

/// Failures turning VCL source into a runnable program.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("invalid {kind} {name}: {message}")]
    Declaration {
        kind: &'static str,
        name: String,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_status() {
        assert_eq!(BackendError::NoBackend.status(), 503);
        assert_eq!(BackendError::Unhealthy("a".into()).status(), 503);
        assert_eq!(BackendError::Cancelled.status(), 503);
        assert_eq!(
            BackendError::Connect {
                backend: "a".into(),
                message: "refused".into()
            }
            .status(),
            502
        );
        assert_eq!(BackendError::Timeout("a".into()).status(), 504);
        assert_eq!(PipelineError::RestartLimitExceeded(3).status(), 503);
    }

    #[test]
    fn test_messages() {
        let err = EvalError::UnknownFunction {
            name: "std.nope".into(),
            line: 3,
            col: 7,
        };
        assert_eq!(err.to_string(), "unknown function std.nope at line=3,col=7");
    }
}
