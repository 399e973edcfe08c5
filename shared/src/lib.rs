// shared/src/lib.rs

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("storage: {0}")]
    Storage(String),
    #[error("serialize: {0}")]
    Serialize(String),
    #[error("deserialize: {0}")]
    Deserialize(String),
    #[error("retry policy: {0}")]
    Retry(String),
    #[error("save abandoned after {attempts} failed attempt(s)")]
    Abandoned { attempts: u32 },
    #[error("no async runtime available: {0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod config;
