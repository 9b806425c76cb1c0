//! FILENAME: engine/src/lib.rs
//! PURPOSE: Main library entry point for the spreadsheet engine.
//! CONTEXT: Re-exports public types and modules for use by other crates.
//! The `Workbook` type is the public surface: sheets, cells, recompute,
//! and observers all hang off it. The parser crate supplies the formula
//! grammar; this crate supplies everything that needs workbook state.

pub mod cell;
pub mod coord;
pub mod dependency_extractor;
pub mod dependency_graph;
pub mod error;
pub mod evaluator;
pub mod functions;
pub mod reference_rewriter;
pub mod sheet;
pub mod workbook;

// Re-export commonly used types at the crate root
pub use cell::{highest_precedence_error, parse_decimal_text, Cell, CellError, CellValue};
pub use coord::{
    col_to_index, index_to_col, loc_from_coords, parse_loc, CellCoord, ParsedLoc, MAX_COL, MAX_ROW,
};
pub use dependency_extractor::extract_dependencies;
pub use dependency_graph::{CellId, DependencyGraph, Direction};
pub use error::{Result, WorkbookError};
pub use evaluator::{Evaluator, SheetContext};
pub use functions::FunctionDef;
pub use reference_rewriter::{rename_sheet_in_contents, shift_contents};
pub use sheet::Sheet;
pub use workbook::{CellChangeObserver, Workbook};

// The error kinds travel with values everywhere, so surface them here too
pub use parser::ast::ErrorKind;
