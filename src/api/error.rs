//! API error types shared by the control-plane and GitLab clients

use std::fmt;

/// Errors that can occur when interacting with external HTTP services
#[derive(Debug, Clone)]
pub enum ApiError {
    /// 401 Unauthorized - token invalid or expired
    Unauthorized { service: String },
    /// 403 Forbidden - token lacks required permissions
    Forbidden { service: String },
    /// 404 Not Found - on `tasks/next` this means "no work"
    NotFound { service: String, path: String },
    /// 429 Rate Limited
    RateLimited {
        service: String,
        retry_after_secs: Option<u64>,
    },
    /// Network or timeout error
    Network { service: String, message: String },
    /// Other HTTP errors, carrying the parsed error body when available
    Http {
        service: String,
        status: u16,
        message: String,
    },
    /// Service not configured (no token in the session store)
    NotConfigured { service: String },
}

impl ApiError {
    /// Check if this is an authentication error (401 or 403)
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            ApiError::Unauthorized { .. } | ApiError::Forbidden { .. }
        )
    }

    /// Check if this is a 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound { .. })
    }

    /// Get the service name for this error
    pub fn service_name(&self) -> &str {
        match self {
            ApiError::Unauthorized { service }
            | ApiError::Forbidden { service }
            | ApiError::NotFound { service, .. }
            | ApiError::RateLimited { service, .. }
            | ApiError::Network { service, .. }
            | ApiError::Http { service, .. }
            | ApiError::NotConfigured { service } => service,
        }
    }

    /// Get retry-after seconds if rate limited
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ApiError::RateLimited {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }

    pub fn unauthorized(service: impl Into<String>) -> Self {
        ApiError::Unauthorized {
            service: service.into(),
        }
    }

    pub fn forbidden(service: impl Into<String>) -> Self {
        ApiError::Forbidden {
            service: service.into(),
        }
    }

    pub fn not_found(service: impl Into<String>, path: impl Into<String>) -> Self {
        ApiError::NotFound {
            service: service.into(),
            path: path.into(),
        }
    }

    pub fn rate_limited(service: impl Into<String>, retry_after: Option<u64>) -> Self {
        ApiError::RateLimited {
            service: service.into(),
            retry_after_secs: retry_after,
        }
    }

    pub fn network(service: impl Into<String>, message: impl Into<String>) -> Self {
        ApiError::Network {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn http(service: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        ApiError::Http {
            service: service.into(),
            status,
            message: message.into(),
        }
    }

    pub fn not_configured(service: impl Into<String>) -> Self {
        ApiError::NotConfigured {
            service: service.into(),
        }
    }

    /// Classify a non-2xx response by status, attaching the error body.
    pub fn from_status(service: &str, path: &str, status: u16, body: &str) -> Self {
        match status {
            401 => Self::unauthorized(service),
            403 => Self::forbidden(service),
            404 => Self::not_found(service, path),
            429 => Self::rate_limited(service, None),
            _ => Self::http(service, status, body.trim().to_string()),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Unauthorized { service } => {
                write!(f, "{service}: Unauthorized (401)")
            }
            ApiError::Forbidden { service } => {
                write!(f, "{service}: Forbidden (403) - insufficient permissions")
            }
            ApiError::NotFound { service, path } => {
                write!(f, "{service}: Not found - {path}")
            }
            ApiError::RateLimited {
                service,
                retry_after_secs,
            } => {
                if let Some(secs) = retry_after_secs {
                    write!(f, "{service}: Rate limited - retry after {secs}s")
                } else {
                    write!(f, "{service}: Rate limited")
                }
            }
            ApiError::Network { service, message } => {
                write!(f, "{service}: Network error - {message}")
            }
            ApiError::Http {
                service,
                status,
                message,
            } => {
                write!(f, "{service}: HTTP {status} - {message}")
            }
            ApiError::NotConfigured { service } => {
                write!(f, "{service}: Not configured (no token)")
            }
        }
    }
}

impl std::error::Error for ApiError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_error_classification() {
        assert!(ApiError::unauthorized("gbos").is_auth_error());
        assert!(ApiError::forbidden("gbos").is_auth_error());
        assert!(!ApiError::rate_limited("gbos", None).is_auth_error());
        assert!(!ApiError::network("gbos", "timeout").is_auth_error());
    }

    #[test]
    fn from_status_maps_variants() {
        assert!(ApiError::from_status("gbos", "/cli/tasks/next", 404, "").is_not_found());
        assert!(ApiError::from_status("gbos", "/cli/auth/session", 401, "").is_auth_error());

        match ApiError::from_status("gitlab", "/merge_requests", 409, "branch exists") {
            ApiError::Http {
                status, message, ..
            } => {
                assert_eq!(status, 409);
                assert_eq!(message, "branch exists");
            }
            other => panic!("Expected Http variant, got {other:?}"),
        }
    }

    #[test]
    fn service_name_reported() {
        assert_eq!(ApiError::unauthorized("gbos").service_name(), "gbos");
        assert_eq!(ApiError::forbidden("gitlab").service_name(), "gitlab");
    }

    #[test]
    fn display_formats() {
        let err = ApiError::rate_limited("gbos", Some(30));
        assert_eq!(err.to_string(), "gbos: Rate limited - retry after 30s");

        let err = ApiError::not_configured("gitlab");
        assert_eq!(err.to_string(), "gitlab: Not configured (no token)");
    }
}
