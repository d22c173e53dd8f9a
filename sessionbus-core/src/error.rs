use thiserror::Error;

use crate::event::BusError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }
}

pub type InternalResult<T> = Result<T, Error>;
