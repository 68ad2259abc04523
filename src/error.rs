use http::StatusCode;

/// Client-facing failures of the tunnel protocol.
///
/// Every variant is handled at the point of detection and turned into an HTTP
/// status response with a short human-readable body; none of these propagate
/// as process-level failures.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// Bad credentials at handshake, or a missing session token.
    #[error("Unauthorized")]
    AuthenticationFailed,

    /// Unknown domain name at handshake.
    #[error("Domain not found")]
    DomainNotFound,

    /// Unknown token, expired token, or requestor IP mismatch. All three
    /// collapse into one outcome so token guessing and replay attempts get
    /// no diagnostic signal.
    #[error("Session not found or expired")]
    SessionInvalid,

    /// A required header is missing or unreadable.
    #[error("Bad Request: {0}")]
    BadRequest(&'static str),

    /// Forwarding transport error or timeout. The upstream error is logged
    /// where it is detected and never echoed to the client.
    #[error("Error when proxying the request")]
    Upstream(#[source] reqwest::Error),
}

impl TunnelError {
    pub fn status(&self) -> StatusCode {
        match self {
            TunnelError::AuthenticationFailed | TunnelError::SessionInvalid => {
                StatusCode::UNAUTHORIZED
            }
            TunnelError::DomainNotFound => StatusCode::NOT_FOUND,
            TunnelError::BadRequest(_) => StatusCode::BAD_REQUEST,
            TunnelError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            TunnelError::AuthenticationFailed.status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(TunnelError::SessionInvalid.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(TunnelError::DomainNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            TunnelError::BadRequest("Sub-URL missing").status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn session_rejections_share_status_and_body() {
        // Unknown token, expired token, and IP mismatch are all reported as
        // SessionInvalid; status and body must carry no distinguishing detail.
        assert_eq!(
            TunnelError::SessionInvalid.to_string(),
            "Session not found or expired"
        );
        assert_eq!(
            TunnelError::SessionInvalid.status(),
            TunnelError::AuthenticationFailed.status()
        );
    }
}
