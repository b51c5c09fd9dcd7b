use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SearchError {
    /// A structural parameter carried a value that cannot be interpreted.
    #[error("Malformed query: invalid value for {param}: {message}")]
    MalformedQuery { param: String, message: String },

    #[error("Missing resource type in {0:?}")]
    MissingResourceType(String),
}

impl SearchError {
    pub fn malformed(param: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedQuery {
            param: param.into(),
            message: message.into(),
        }
    }
}
