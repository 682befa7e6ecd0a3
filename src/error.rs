use serde_json::Value;

/// Closed tagged union of everything the broker can fail with. Every variant
/// carries enough to build both a log line and an HTTP response without a
/// second lookup.
#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("validation: {message}")]
    Validation { message: String, details: Option<Value> },

    #[error("ssh: {message}")]
    Ssh { message: String, details: Option<Value> },

    #[error("job: {message}")]
    Job { message: String, details: Option<Value> },

    #[error("tunnel: {message}")]
    Tunnel { message: String, details: Option<Value> },

    #[error("lock busy: {operation}")]
    Lock { operation: String },

    #[error("not found: {message}")]
    NotFound { message: String },

    #[error("unexpected: {message}")]
    Unexpected {
        message: String,
        #[source]
        cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl BrokerError {
    pub fn validation(message: impl Into<String>) -> Self {
        BrokerError::Validation { message: message.into(), details: None }
    }

    pub fn ssh(message: impl Into<String>) -> Self {
        BrokerError::Ssh { message: message.into(), details: None }
    }

    pub fn job(message: impl Into<String>) -> Self {
        BrokerError::Job { message: message.into(), details: None }
    }

    pub fn tunnel(message: impl Into<String>) -> Self {
        BrokerError::Tunnel { message: message.into(), details: None }
    }

    pub fn lock(operation: impl Into<String>) -> Self {
        BrokerError::Lock { operation: operation.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        BrokerError::NotFound { message: message.into() }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        BrokerError::Unexpected { message: message.into(), cause: None }
    }

    /// HTTP status code for the §7 error taxonomy. `production` suppresses
    /// the debug `cause` string on `Unexpected` the way the teacher's sentry
    /// wiring only ships traces outside production.
    pub fn to_http(&self, production: bool) -> (u16, Value) {
        let (status, kind) = match self {
            BrokerError::Validation { .. } => (400, "validation"),
            BrokerError::Ssh { .. } => (502, "ssh"),
            BrokerError::Job { .. } => (500, "job"),
            BrokerError::Tunnel { .. } => (502, "tunnel"),
            BrokerError::Lock { .. } => (429, "lock"),
            BrokerError::NotFound { .. } => (404, "not_found"),
            BrokerError::Unexpected { .. } => (500, "unexpected"),
        };

        let mut body = serde_json::json!({
            "error": kind,
            "message": self.to_string(),
        });

        if let Some(details) = self.details() {
            body["details"] = details.clone();
        }
        if !production {
            if let BrokerError::Unexpected { cause: Some(cause), .. } = self {
                body["cause"] = Value::String(cause.to_string());
            }
        }

        (status, body)
    }

    fn details(&self) -> Option<&Value> {
        match self {
            BrokerError::Validation { details, .. }
            | BrokerError::Ssh { details, .. }
            | BrokerError::Job { details, .. }
            | BrokerError::Tunnel { details, .. } => details.as_ref(),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for BrokerError {
    fn from(err: rusqlite::Error) -> Self {
        BrokerError::Unexpected { message: format!("sqlite: {err}"), cause: Some(Box::new(err)) }
    }
}

impl From<std::io::Error> for BrokerError {
    fn from(err: std::io::Error) -> Self {
        BrokerError::Unexpected { message: format!("io: {err}"), cause: Some(Box::new(err)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn error_is_send_and_sync() {
        assert_send_sync::<BrokerError>();
    }

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(BrokerError::validation("x").to_http(true).0, 400);
        assert_eq!(BrokerError::ssh("x").to_http(true).0, 502);
        assert_eq!(BrokerError::job("x").to_http(true).0, 500);
        assert_eq!(BrokerError::tunnel("x").to_http(true).0, 502);
        assert_eq!(BrokerError::lock("launch:k").to_http(true).0, 429);
        assert_eq!(BrokerError::not_found("x").to_http(true).0, 404);
        assert_eq!(BrokerError::unexpected("x").to_http(true).0, 500);
    }

    #[test]
    fn unexpected_cause_hidden_in_production() {
        let io_err = std::io::Error::other("boom");
        let err: BrokerError = io_err.into();
        let (_, body) = err.to_http(true);
        assert!(body.get("cause").is_none());
        let (_, body) = err.to_http(false);
        assert!(body.get("cause").is_some());
    }
}
