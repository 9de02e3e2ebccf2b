//! Error types for the etcd PKI operator

use thiserror::Error;

/// How the scheduler should treat a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Contention or a flaky collaborator; retried with backoff.
    Transient,
    /// Something this pass depends on does not exist yet.
    MissingDependency,
    /// Aborts the affected resource for this pass; retried on the next one.
    Fatal,
}

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Object does not exist in the store
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    /// Write rejected because the object changed since it was read
    #[error("Conflict writing {0}: object was modified concurrently")]
    Conflict(String),

    /// Private key generation failed
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// Certificate could not be built or signed
    #[error("Certificate generation failed: {0}")]
    CertificateError(String),

    /// Stored certificate, key or bundle could not be parsed
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Node address lookup failed
    #[error("Topology lookup failed: {0}")]
    TopologyError(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// One or more resources failed during a reconcile pass
    #[error("Reconcile pass had {} failure(s): {}", .0.len(), summarize(.0))]
    Reconcile(Vec<Error>),
}

fn summarize(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    pub fn not_found(kind: &'static str, namespace: &str, name: &str) -> Self {
        Error::NotFound {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Error::KubeError(_) | Error::Conflict(_) | Error::TopologyError(_) => {
                ErrorClass::Transient
            }
            Error::NotFound { .. } => ErrorClass::MissingDependency,
            Error::KeyGeneration(_)
            | Error::CertificateError(_)
            | Error::ParseError(_)
            | Error::ConfigError(_) => ErrorClass::Fatal,
            Error::Reconcile(errors) => {
                if errors.iter().any(|e| e.class() == ErrorClass::Fatal) {
                    ErrorClass::Fatal
                } else if errors.iter().any(|e| e.class() == ErrorClass::Transient) {
                    ErrorClass::Transient
                } else {
                    ErrorClass::MissingDependency
                }
            }
        }
    }

    /// Collapse the errors collected during a pass into a single result.
    pub fn from_failures(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Reconcile(errors)),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_missing_dependency() {
        let err = Error::not_found("Secret", "openshift-etcd", "etcd-signer");
        assert!(err.is_not_found());
        assert_eq!(err.class(), ErrorClass::MissingDependency);
        assert_eq!(err.to_string(), "Secret openshift-etcd/etcd-signer not found");
    }

    #[test]
    fn test_aggregate_class_prefers_fatal() {
        let err = Error::Reconcile(vec![
            Error::Conflict("openshift-etcd/etcd-client".to_string()),
            Error::ParseError("bad pem".to_string()),
        ]);
        assert_eq!(err.class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_from_failures() {
        assert!(Error::from_failures(vec![]).is_ok());
        let single = Error::from_failures(vec![Error::TopologyError("x".into())]).unwrap_err();
        assert!(matches!(single, Error::TopologyError(_)));
        let many = Error::from_failures(vec![
            Error::TopologyError("a".into()),
            Error::TopologyError("b".into()),
        ])
        .unwrap_err();
        assert!(matches!(many, Error::Reconcile(ref v) if v.len() == 2));
    }
}
