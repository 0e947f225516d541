use thiserror::Error;

/// Errors from persistence gateway operations (used by the trait definition
/// in stepwise-core and its implementations in stepwise-infra).
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("storage connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("row decode error: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_error_display() {
        let err = GatewayError::InvalidIdentifier("drop table; --".to_string());
        assert_eq!(err.to_string(), "invalid identifier 'drop table; --'");
    }
}
