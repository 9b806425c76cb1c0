//! FILENAME: engine/src/cell.rs
//! PURPOSE: Defines the fundamental data structures for a single spreadsheet cell.
//! CONTEXT: This file contains the `Cell` struct, the `CellValue` enum, and
//! the coercion/comparison rules of the value algebra. It separates the
//! user's raw contents from the calculated value. Numbers are exact
//! decimals; floats never enter the value layer.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use parser::ast::{ErrorKind, Expression};

use crate::dependency_extractor::extract_dependencies;
use crate::dependency_graph::CellId;

/// An error value held by a cell (e.g., #DIV/0!). The detail string is
/// informational only: two errors of the same kind are equal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl CellError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        CellError {
            kind,
            detail: detail.into(),
        }
    }
}

impl PartialEq for CellError {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl std::fmt::Display for CellError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind.display_string())
    }
}

/// Represents the calculated result or raw data within a cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Empty,
    Number(Decimal),
    Text(String),
    Bool(bool),
    Error(CellError),
}

impl CellValue {
    /// Shorthand for building an error value.
    pub fn error(kind: ErrorKind, detail: impl Into<String>) -> CellValue {
        CellValue::Error(CellError::new(kind, detail))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, CellValue::Error(_))
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            CellValue::Error(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Coerces the value to a number for arithmetic: empty counts as zero,
    /// booleans as 0/1, and text is parsed as a decimal.
    pub fn as_number(&self) -> Result<Decimal, CellError> {
        match self {
            CellValue::Empty => Ok(Decimal::ZERO),
            CellValue::Number(n) => Ok(*n),
            CellValue::Bool(b) => Ok(if *b { Decimal::ONE } else { Decimal::ZERO }),
            CellValue::Text(s) => parse_decimal_text(s).ok_or_else(|| {
                CellError::new(
                    ErrorKind::Type,
                    format!("cannot treat {:?} as a number", s),
                )
            }),
            CellValue::Error(e) => Err(e.clone()),
        }
    }

    /// Coerces the value to text for concatenation: empty becomes "",
    /// numbers their canonical decimal form, booleans TRUE/FALSE.
    pub fn as_text(&self) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::Number(n) => n.normalize().to_string(),
            CellValue::Text(s) => s.clone(),
            CellValue::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            CellValue::Error(e) => e.kind.display_string().to_string(),
        }
    }

    /// Coerces the value to a boolean: numbers are true when nonzero, text
    /// must spell "true" or "false" (case-insensitive), empty is false.
    pub fn as_bool(&self) -> Result<bool, CellError> {
        match self {
            CellValue::Empty => Ok(false),
            CellValue::Bool(b) => Ok(*b),
            CellValue::Number(n) => Ok(!n.is_zero()),
            CellValue::Text(s) => match s.to_uppercase().as_str() {
                "TRUE" => Ok(true),
                "FALSE" => Ok(false),
                _ => Err(CellError::new(
                    ErrorKind::Type,
                    format!("cannot treat {:?} as a boolean", s),
                )),
            },
            CellValue::Error(e) => Err(e.clone()),
        }
    }

    /// Total order over all values, used by the comparison operators and by
    /// region sorting. Empty sorts before everything, then errors (by kind
    /// precedence), then numbers, then text (case-insensitive), then
    /// booleans with FALSE before TRUE. Comparison operators never actually
    /// see the error arm, since errors propagate before comparison.
    pub fn total_order(&self, other: &CellValue) -> Ordering {
        fn rank(v: &CellValue) -> u8 {
            match v {
                CellValue::Empty => 0,
                CellValue::Error(_) => 1,
                CellValue::Number(_) => 2,
                CellValue::Text(_) => 3,
                CellValue::Bool(_) => 4,
            }
        }

        match (self, other) {
            (CellValue::Number(a), CellValue::Number(b)) => a.cmp(b),
            (CellValue::Text(a), CellValue::Text(b)) => {
                a.to_lowercase().cmp(&b.to_lowercase())
            }
            (CellValue::Bool(a), CellValue::Bool(b)) => a.cmp(b),
            (CellValue::Error(a), CellValue::Error(b)) => a.kind.cmp(&b.kind),
            _ => rank(self).cmp(&rank(other)),
        }
    }
}

impl std::fmt::Display for CellValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_text())
    }
}

/// Picks the error that must propagate when several operands are errors:
/// the kind declared earliest (Parse > CircRef > BadRef > BadName > Type >
/// DivZero) wins.
pub fn highest_precedence_error(values: &[&CellValue]) -> Option<CellError> {
    values
        .iter()
        .filter_map(|v| match v {
            CellValue::Error(e) => Some(e),
            _ => None,
        })
        .min_by_key(|e| e.kind)
        .cloned()
}

/// Parses free text as an exact decimal. Accepts an optional sign, plain
/// and scientific notation (the latter only arises in raw cell contents,
/// never in formula literals). Infinities and NaN spellings do not parse
/// and therefore fall back to text at the ingestion layer.
pub fn parse_decimal_text(text: &str) -> Option<Decimal> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut candidate = trimmed.strip_prefix('+').unwrap_or(trimmed).to_string();
    // "10." and ".5" are valid decimal spellings
    if candidate.ends_with('.') && candidate.len() > 1 {
        candidate.pop();
    }
    if let Some(fraction) = candidate.strip_prefix('.') {
        candidate = format!("0.{}", fraction);
    } else if let Some(fraction) = candidate.strip_prefix("-.") {
        candidate = format!("-0.{}", fraction);
    }
    Decimal::from_str(&candidate)
        .ok()
        .or_else(|| Decimal::from_scientific(&candidate).ok())
        .map(|d| d.normalize())
}

/// The atomic unit of the spreadsheet: raw contents plus derived state.
/// Contents are always trimmed and non-empty; an empty cell is simply
/// absent from its sheet.
#[derive(Debug, Clone)]
pub struct Cell {
    /// The user's input, whitespace-trimmed, with any leading ' or = intact.
    pub contents: String,
    /// The parsed formula, present only for contents starting with '=' that
    /// passed the grammar. Parse failures leave this None and set a Parse
    /// error value.
    pub ast: Option<Expression>,
    /// The derived value. For formulas this is filled in by recompute.
    pub value: CellValue,
    /// The cells this cell's formula references, keyed by (sheet key, LOC).
    pub out_refs: HashSet<CellId>,
}

impl Cell {
    /// Ingests trimmed, non-empty contents into a cell owned by the sheet
    /// with the given casefolded key. Classification order follows the
    /// leading character: ' marks literal text, = marks a formula; plain
    /// contents are tried as an error literal, a boolean, a number, and
    /// finally fall back to text.
    pub fn new(contents: String, owning_sheet_key: &str) -> Cell {
        debug_assert_eq!(contents, contents.trim());
        debug_assert!(!contents.is_empty());

        if let Some(rest) = contents.strip_prefix('\'') {
            let value = CellValue::Text(rest.to_string());
            return Cell {
                contents,
                ast: None,
                value,
                out_refs: HashSet::new(),
            };
        }

        if contents.starts_with('=') {
            return match parser::parse_formula(&contents) {
                Ok(expr) => {
                    let out_refs = extract_dependencies(&expr, owning_sheet_key);
                    Cell {
                        contents,
                        ast: Some(expr),
                        // Placeholder until the recompute pass evaluates it
                        value: CellValue::Empty,
                        out_refs,
                    }
                }
                Err(e) => Cell {
                    contents,
                    ast: None,
                    value: CellValue::error(ErrorKind::Parse, e.message),
                    out_refs: HashSet::new(),
                },
            };
        }

        let value = if let Some(kind) = ErrorKind::from_display_string(&contents) {
            CellValue::Error(CellError::new(kind, ""))
        } else if contents.eq_ignore_ascii_case("true") {
            CellValue::Bool(true)
        } else if contents.eq_ignore_ascii_case("false") {
            CellValue::Bool(false)
        } else if let Some(n) = parse_decimal_text(&contents) {
            CellValue::Number(n)
        } else {
            CellValue::Text(contents.clone())
        };

        Cell {
            contents,
            ast: None,
            value,
            out_refs: HashSet::new(),
        }
    }

    pub fn is_formula(&self) -> bool {
        self.contents.starts_with('=')
    }
}
