use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid peer id: {0}")]
    InvalidPeerId(String),
}

pub type Result<T> = std::result::Result<T, Error>;
