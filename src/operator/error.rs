/// Errors produced by a reconciliation pass.
///
/// The variants follow how the engine reacts to them:
/// - `NotFound` is converted into "needs create" by the object cache
/// - `AlreadyExists` is absorbed when creating shared resources
/// - `ClusterUnavailable` and `Conflict` are transient and retried by the controller
/// - `StatusUnavailable` leaves the last known counts in place
/// - `ReconcileFailed` names the step that failed and is surfaced on the Frontend
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cluster unavailable: {0}")]
    ClusterUnavailable(String),
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },
    #[error("{kind} {name} was modified concurrently")]
    Conflict { kind: String, name: String },
    #[error("status unavailable: {0}")]
    StatusUnavailable(String),
    #[error("{step}: {source}")]
    ReconcileFailed {
        step: &'static str,
        #[source]
        source: Box<Error>,
    },
    #[error("invalid resource: {0}")]
    InvalidResource(String),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Wrap an error with the name of the reconciliation step that produced it
    pub fn reconcile(step: &'static str, source: Error) -> Self {
        Self::ReconcileFailed {
            step,
            source: Box::new(source),
        }
    }

    /// Map a kube client error for the given object into the operator taxonomy
    pub fn from_kube(err: kube::Error, kind: &str, name: &str) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => Self::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                Self::AlreadyExists {
                    kind: kind.to_string(),
                    name: name.to_string(),
                }
            }
            kube::Error::Api(ae) if ae.code == 409 => Self::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            other => Self::ClusterUnavailable(other.to_string()),
        }
    }

    /// Innermost error, skipping `ReconcileFailed` wrappers
    pub fn root(&self) -> &Error {
        match self {
            Self::ReconcileFailed { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self.root(), Self::AlreadyExists { .. })
    }

    /// Lost a create or replace to another writer
    pub fn is_write_race(&self) -> bool {
        matches!(
            self.root(),
            Self::AlreadyExists { .. } | Self::Conflict { .. }
        )
    }

    /// Short label for metrics
    pub fn metric_label(&self) -> &'static str {
        match self.root() {
            Self::ClusterUnavailable(_) => "cluster_unavailable",
            Self::NotFound { .. } => "not_found",
            Self::AlreadyExists { .. } => "already_exists",
            Self::Conflict { .. } => "conflict",
            Self::StatusUnavailable(_) => "status_unavailable",
            Self::ReconcileFailed { .. } => "reconcile_failed",
            Self::InvalidResource(_) => "invalid_resource",
            Self::Serialization(_) => "serialization",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_from_kube_not_found() {
        let err = Error::from_kube(api_error(404, "NotFound"), "Deployment", "web");
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn test_from_kube_already_exists_vs_conflict() {
        let err = Error::from_kube(api_error(409, "AlreadyExists"), "Service", "web");
        assert!(err.is_already_exists());

        let err = Error::from_kube(api_error(409, "Conflict"), "Service", "web");
        assert!(matches!(err, Error::Conflict { .. }));
        assert!(!err.is_already_exists());
        assert!(Error::reconcile("publish api catalog", err).is_write_race());
    }

    #[test]
    fn test_from_kube_other_is_unavailable() {
        let err = Error::from_kube(api_error(500, "InternalError"), "Service", "web");
        assert!(matches!(err, Error::ClusterUnavailable(_)));
    }

    #[test]
    fn test_reconcile_wraps_step() {
        let err = Error::reconcile(
            "create frontend service",
            Error::ClusterUnavailable("connection refused".to_string()),
        );
        assert_eq!(
            err.to_string(),
            "create frontend service: cluster unavailable: connection refused"
        );
        assert_eq!(err.metric_label(), "cluster_unavailable");
    }
}
