//! FILENAME: engine/src/error.rs
//! PURPOSE: The error type raised by the workbook API.
//! CONTEXT: These are caller mistakes (bad names, bad locations, bad
//! indices) and are raised as Results. Evaluation problems never surface
//! here; they are stored in cells as error *values*.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkbookError {
    #[error("sheet not found: {0:?}")]
    SheetNotFound(String),

    #[error("invalid sheet name: {0:?}")]
    InvalidSheetName(String),

    #[error("duplicate sheet name: {0:?}")]
    DuplicateSheetName(String),

    #[error("invalid cell location: {0:?}")]
    InvalidLocation(String),

    #[error("index out of range: {0}")]
    IndexOutOfRange(i64),
}

pub type Result<T> = std::result::Result<T, WorkbookError>;
