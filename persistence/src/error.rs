//! FILENAME: persistence/src/error.rs

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing key: {0:?}")]
    MissingKey(&'static str),

    #[error("wrong type: {0}")]
    WrongType(&'static str),

    #[error(transparent)]
    Workbook(#[from] engine::WorkbookError),
}
