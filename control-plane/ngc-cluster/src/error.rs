use thiserror::Error;

/// Failure of a single call against a cluster API server.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("throttled: {0}")]
    Throttled(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("cluster unreachable: {0}")]
    Unreachable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Conflicts, timeouts and throttling clear up on their own and are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ApiError::Conflict(_) | ApiError::Timeout(_) | ApiError::Throttled(_)
        )
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, ApiError::Unreachable(_))
    }

    /// The request itself was rejected; resending it unchanged cannot succeed.
    pub fn is_invalid(&self) -> bool {
        matches!(self, ApiError::Invalid(_))
    }
}

impl From<kube::Error> for ApiError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => {
                let msg = format!("{} ({})", resp.message, resp.reason);
                match resp.code {
                    404 => ApiError::NotFound(msg),
                    409 => ApiError::Conflict(msg),
                    429 => ApiError::Throttled(msg),
                    400 | 403 | 422 => ApiError::Invalid(msg),
                    408 | 504 => ApiError::Timeout(msg),
                    _ => ApiError::Internal(msg),
                }
            }
            kube::Error::HyperError(e) => ApiError::Unreachable(e.to_string()),
            kube::Error::Service(e) => ApiError::Unreachable(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Invalid(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("unknown cluster: {0}")]
    UnknownCluster(String),
    #[error("no clusters registered")]
    NoClusters,
    #[error("invalid cluster configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to connect to cluster {name}: {reason}")]
    Connect { name: String, reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("api error: {0}")]
    Api(#[from] ApiError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ApiError::Conflict("x".into()).is_transient());
        assert!(ApiError::Timeout("x".into()).is_transient());
        assert!(ApiError::Throttled("x".into()).is_transient());
        assert!(!ApiError::Invalid("x".into()).is_transient());
        assert!(!ApiError::Unreachable("x".into()).is_transient());
        assert!(!ApiError::NotFound("x".into()).is_transient());
    }

    #[test]
    fn maps_api_status_codes() {
        let mk = |code: u16| {
            kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".into(),
                message: "boom".into(),
                reason: "Testing".into(),
                code,
            })
        };
        assert!(matches!(ApiError::from(mk(404)), ApiError::NotFound(_)));
        assert!(matches!(ApiError::from(mk(409)), ApiError::Conflict(_)));
        assert!(matches!(ApiError::from(mk(429)), ApiError::Throttled(_)));
        assert!(matches!(ApiError::from(mk(422)), ApiError::Invalid(_)));
        assert!(matches!(ApiError::from(mk(504)), ApiError::Timeout(_)));
        assert!(matches!(ApiError::from(mk(500)), ApiError::Internal(_)));
    }
}
