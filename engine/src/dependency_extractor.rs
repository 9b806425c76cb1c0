//! FILENAME: engine/src/dependency_extractor.rs
//! PURPOSE: Walks a parsed formula and collects the cells it references.
//! CONTEXT: The workbook feeds every formula's reference set into the
//! dependency graph so that mutations recompute exactly the affected cells.
//! Extraction is purely syntactic: the target sheet or address does not
//! have to exist (evaluation deals with that), and every reference in the
//! tree is collected, including those inside IF/IFERROR/CHOOSE branches
//! that may not be taken, and those inside the argument of INDIRECT. The
//! address an INDIRECT resolves to dynamically is invisible here, which is
//! why INDIRECT-only dependencies can go stale.

use std::collections::HashSet;

use parser::ast::Expression;

use crate::dependency_graph::CellId;

/// Collects the set of (sheet key, LOC) pairs the expression references.
/// Unqualified references belong to the owning sheet. Sheet keys are
/// casefolded; locations are uppercased with absolute markers dropped.
pub fn extract_dependencies(expr: &Expression, owning_sheet_key: &str) -> HashSet<CellId> {
    let mut refs = HashSet::new();
    collect(expr, owning_sheet_key, &mut refs);
    refs
}

fn collect(expr: &Expression, owning_sheet_key: &str, refs: &mut HashSet<CellId>) {
    match expr {
        Expression::CellRef {
            sheet, col, row, ..
        } => {
            let sheet_key = match sheet {
                Some(name) => name.to_lowercase(),
                None => owning_sheet_key.to_string(),
            };
            refs.insert((sheet_key, format!("{}{}", col.to_uppercase(), row)));
        }
        Expression::BinaryOp { left, right, .. } => {
            collect(left, owning_sheet_key, refs);
            collect(right, owning_sheet_key, refs);
        }
        Expression::UnaryOp { operand, .. } => {
            collect(operand, owning_sheet_key, refs);
        }
        Expression::FunctionCall { args, .. } => {
            for arg in args {
                collect(arg, owning_sheet_key, refs);
            }
        }
        Expression::Literal(_) | Expression::ErrorLiteral(_) => {}
    }
}
