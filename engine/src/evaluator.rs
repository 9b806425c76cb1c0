//! FILENAME: engine/src/evaluator.rs
//! PURPOSE: Evaluates AST expressions to compute cell values.
//! CONTEXT: After a formula is parsed into an AST, this module traverses
//! the tree and computes the final result. It handles cell lookups across
//! sheets, arithmetic, concatenation, comparisons, logical operators, and
//! dispatches built-in functions through the function table.
//!
//! Error discipline: operators evaluate their operands eagerly, and when
//! any operand is an error the highest-precedence error kind propagates.
//! Arithmetic that cannot produce a representable decimal (division by
//! zero, or overflow past the decimal range) yields #DIV/0!.

use std::collections::HashMap;

use rust_decimal::Decimal;

use parser::ast::{BinaryOperator, ErrorKind, Expression, UnaryOperator, Value};

use crate::cell::{highest_precedence_error, CellValue};
use crate::coord::{self, in_bounds};
use crate::functions;
use crate::sheet::Sheet;

/// A borrowed view of the workbook's sheets for one evaluation pass.
/// References without a sheet qualifier resolve against `current_sheet`.
pub struct SheetContext<'a> {
    /// All sheets, keyed by casefolded name.
    pub sheets: &'a HashMap<String, Sheet>,
    /// Casefolded key of the sheet that owns the formula being evaluated.
    pub current_sheet: &'a str,
}

/// The formula evaluator. Holds the sheet view for cell lookups; the
/// evaluation itself is a pure tree walk.
pub struct Evaluator<'a> {
    ctx: SheetContext<'a>,
}

impl<'a> Evaluator<'a> {
    pub fn new(ctx: SheetContext<'a>) -> Self {
        Evaluator { ctx }
    }

    /// Evaluates a formula for storage as a cell value. A whole-formula
    /// result of Empty (a bare reference to an empty cell) is stored as
    /// zero, so a non-empty cell never holds an Empty value.
    pub fn evaluate_cell(&self, expr: &Expression) -> CellValue {
        match self.evaluate(expr) {
            CellValue::Empty => CellValue::Number(Decimal::ZERO),
            value => value,
        }
    }

    /// Evaluates an AST expression and returns the result.
    pub fn evaluate(&self, expr: &Expression) -> CellValue {
        match expr {
            Expression::Literal(value) => self.eval_literal(value),
            Expression::ErrorLiteral(kind) => CellValue::error(*kind, ""),
            Expression::CellRef {
                sheet, col, row, ..
            } => self.get_value(sheet.as_deref(), col, *row),
            Expression::BinaryOp { left, op, right } => self.eval_binary_op(left, *op, right),
            Expression::UnaryOp { op, operand } => self.eval_unary_op(*op, operand),
            Expression::FunctionCall { name, args } => self.eval_function(name, args),
        }
    }

    /// Evaluates a literal value.
    fn eval_literal(&self, value: &Value) -> CellValue {
        match value {
            Value::Number(n) => CellValue::Number(*n),
            Value::String(s) => CellValue::Text(s.clone()),
            Value::Boolean(b) => CellValue::Bool(*b),
        }
    }

    /// Looks up the current value of a cell. Unknown sheets and addresses
    /// beyond the grid produce #REF!; a missing cell in a known sheet is
    /// simply Empty.
    pub(crate) fn get_value(&self, sheet: Option<&str>, col: &str, row: u32) -> CellValue {
        let key = match sheet {
            Some(name) => name.to_lowercase(),
            None => self.ctx.current_sheet.to_string(),
        };

        let sheet_obj = match self.ctx.sheets.get(&key) {
            Some(s) => s,
            None => {
                return CellValue::error(
                    ErrorKind::BadRef,
                    format!("unknown sheet {:?}", key),
                );
            }
        };

        let col_index = coord::col_to_index(col);
        if !in_bounds((col_index, row)) {
            return CellValue::error(ErrorKind::BadRef, "cell location out of bounds");
        }

        match sheet_obj.cell((col_index, row)) {
            Some(cell) => cell.value.clone(),
            None => CellValue::Empty,
        }
    }

    /// Resolves the text form of a reference, as INDIRECT does at runtime.
    /// Anything that does not parse to a single cell reference is #REF!.
    pub(crate) fn resolve_reference_text(&self, text: &str) -> CellValue {
        match parser::parse_formula(text) {
            Ok(Expression::CellRef {
                sheet, col, row, ..
            }) => self.get_value(sheet.as_deref(), &col, row),
            _ => CellValue::error(
                ErrorKind::BadRef,
                format!("cannot resolve {:?} as a cell reference", text),
            ),
        }
    }

    fn eval_binary_op(
        &self,
        left: &Expression,
        op: BinaryOperator,
        right: &Expression,
    ) -> CellValue {
        let lhs = self.evaluate(left);
        let rhs = self.evaluate(right);

        if let Some(err) = highest_precedence_error(&[&lhs, &rhs]) {
            return CellValue::Error(err);
        }

        match op {
            BinaryOperator::Add
            | BinaryOperator::Subtract
            | BinaryOperator::Multiply
            | BinaryOperator::Divide => {
                let x = match lhs.as_number() {
                    Ok(n) => n,
                    Err(e) => return CellValue::Error(e),
                };
                let y = match rhs.as_number() {
                    Ok(n) => n,
                    Err(e) => return CellValue::Error(e),
                };
                numeric_binary_op(op, x, y)
            }

            BinaryOperator::Concat => {
                CellValue::Text(format!("{}{}", lhs.as_text(), rhs.as_text()))
            }

            BinaryOperator::Equal
            | BinaryOperator::NotEqual
            | BinaryOperator::LessThan
            | BinaryOperator::GreaterThan
            | BinaryOperator::LessEqual
            | BinaryOperator::GreaterEqual => {
                let ordering = lhs.total_order(&rhs);
                let result = match op {
                    BinaryOperator::Equal => ordering.is_eq(),
                    BinaryOperator::NotEqual => ordering.is_ne(),
                    BinaryOperator::LessThan => ordering.is_lt(),
                    BinaryOperator::GreaterThan => ordering.is_gt(),
                    BinaryOperator::LessEqual => ordering.is_le(),
                    _ => ordering.is_ge(),
                };
                CellValue::Bool(result)
            }

            BinaryOperator::And | BinaryOperator::Or => {
                let a = match lhs.as_bool() {
                    Ok(b) => b,
                    Err(e) => return CellValue::Error(e),
                };
                let b = match rhs.as_bool() {
                    Ok(b) => b,
                    Err(e) => return CellValue::Error(e),
                };
                CellValue::Bool(match op {
                    BinaryOperator::And => a && b,
                    _ => a || b,
                })
            }
        }
    }

    fn eval_unary_op(&self, op: UnaryOperator, operand: &Expression) -> CellValue {
        let value = self.evaluate(operand);
        if let CellValue::Error(e) = value {
            return CellValue::Error(e);
        }

        match op {
            UnaryOperator::Plus => match value.as_number() {
                Ok(n) => CellValue::Number(n),
                Err(e) => CellValue::Error(e),
            },
            UnaryOperator::Negate => match value.as_number() {
                Ok(n) => CellValue::Number((-n).normalize()),
                Err(e) => CellValue::Error(e),
            },
            UnaryOperator::Not => match value.as_bool() {
                Ok(b) => CellValue::Bool(!b),
                Err(e) => CellValue::Error(e),
            },
        }
    }

    /// Dispatches a function call through the function table. Unknown
    /// names are #NAME?; arity and type checking happen inside the table.
    fn eval_function(&self, name: &str, args: &[Expression]) -> CellValue {
        match functions::lookup(name) {
            Some(def) => def.call(self, args),
            None => CellValue::error(
                ErrorKind::BadName,
                format!("unknown function {:?}", name),
            ),
        }
    }
}

/// Applies an arithmetic operator to coerced decimal operands. Division by
/// zero and results outside the representable decimal range both surface
/// as #DIV/0!, the only route for non-finite arithmetic.
fn numeric_binary_op(op: BinaryOperator, x: Decimal, y: Decimal) -> CellValue {
    let result = match op {
        BinaryOperator::Add => x.checked_add(y),
        BinaryOperator::Subtract => x.checked_sub(y),
        BinaryOperator::Multiply => x.checked_mul(y),
        BinaryOperator::Divide => {
            if y.is_zero() {
                return CellValue::error(ErrorKind::DivZero, "division by zero");
            }
            x.checked_div(y)
        }
        _ => unreachable!("not an arithmetic operator: {:?}", op),
    };

    match result {
        Some(n) => CellValue::Number(n.normalize()),
        None => CellValue::error(ErrorKind::DivZero, "arithmetic result out of range"),
    }
}
