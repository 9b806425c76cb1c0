//! FILENAME: persistence/src/lib.rs
//! PURPOSE: JSON save/load for workbooks.
//! CONTEXT: The persisted form carries only sheet names and raw cell
//! contents; values are always re-derived on load by replaying the
//! contents through the engine. The document shape is:
//!
//! ```json
//! { "sheets": [
//!     { "name": "Sheet1",
//!       "cell-contents": { "A1": "=B1+5", "B1": "7" } } ] }
//! ```
//!
//! Loading walks the JSON tree by hand so that a missing key and a
//! mistyped field surface as MissingKey / WrongType rather than as an
//! opaque deserialization failure. Malformed JSON and I/O problems pass
//! through as their own variants.

pub mod error;

use std::io::{Read, Write};

use serde_json::{Map, Value};

use engine::{loc_from_coords, Workbook};

pub use error::PersistenceError;

/// Writes the workbook to `writer` in JSON form. Sheets appear in tab
/// order and cells in row-major order.
pub fn save_workbook<W: Write>(workbook: &Workbook, writer: W) -> Result<(), PersistenceError> {
    let mut sheets = Vec::new();
    for name in workbook.list_sheets() {
        let sheet = workbook.sheet(&name)?;

        let mut cell_contents = Map::new();
        for coord in sheet.coords_row_major() {
            let cell = sheet.cell(coord).expect("coordinate from the key set");
            cell_contents.insert(loc_from_coords(coord), Value::String(cell.contents.clone()));
        }

        let mut sheet_obj = Map::new();
        sheet_obj.insert("name".to_string(), Value::String(sheet.name().to_string()));
        sheet_obj.insert("cell-contents".to_string(), Value::Object(cell_contents));
        sheets.push(Value::Object(sheet_obj));
    }

    let mut doc = Map::new();
    doc.insert("sheets".to_string(), Value::Array(sheets));

    log::debug!("saving workbook with {} sheet(s)", workbook.num_sheets());
    serde_json::to_writer(writer, &Value::Object(doc))?;
    Ok(())
}

/// Reads a workbook from `reader`, replaying every cell's contents
/// through the engine so all values (and errors) are freshly derived.
pub fn load_workbook<R: Read>(reader: R) -> Result<Workbook, PersistenceError> {
    let doc: Value = serde_json::from_reader(reader)?;

    let root = doc
        .as_object()
        .ok_or(PersistenceError::WrongType("workbook must be an object"))?;
    let sheets = root
        .get("sheets")
        .ok_or(PersistenceError::MissingKey("sheets"))?
        .as_array()
        .ok_or(PersistenceError::WrongType("'sheets' must be a list"))?;

    let mut workbook = Workbook::new();
    for sheet_value in sheets {
        let sheet_obj = sheet_value
            .as_object()
            .ok_or(PersistenceError::WrongType("sheet entry must be an object"))?;

        let name = sheet_obj
            .get("name")
            .ok_or(PersistenceError::MissingKey("name"))?
            .as_str()
            .ok_or(PersistenceError::WrongType("sheet name must be a string"))?;

        let cell_contents = sheet_obj
            .get("cell-contents")
            .ok_or(PersistenceError::MissingKey("cell-contents"))?
            .as_object()
            .ok_or(PersistenceError::WrongType(
                "'cell-contents' must be an object",
            ))?;

        workbook.new_sheet(Some(name))?;
        for (location, contents_value) in cell_contents {
            let contents = contents_value.as_str().ok_or(PersistenceError::WrongType(
                "cell contents must be a string",
            ))?;
            workbook.set_cell_contents(name, location, Some(contents))?;
        }
    }

    log::debug!("loaded workbook with {} sheet(s)", workbook.num_sheets());
    Ok(workbook)
}
