use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContentError {
    #[error("message content is empty")]
    Empty,
    #[error("message content is {actual} characters, limit is {limit}")]
    TooLong { limit: usize, actual: usize },
}
