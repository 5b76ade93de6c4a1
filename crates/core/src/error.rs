use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid target count: {0}")]
    InvalidTarget(usize),

    #[error("Invalid resource at index {index}: {reason}")]
    InvalidResource { index: usize, reason: String },

    #[error("Validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CoreError::InvalidResource {
            index: 3,
            reason: "missing host".to_string(),
        };
        assert!(error.to_string().contains("index 3"));
        assert!(error.to_string().contains("missing host"));
    }
}
