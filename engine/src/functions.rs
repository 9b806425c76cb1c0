//! FILENAME: engine/src/functions.rs
//! PURPOSE: The table of built-in formula functions.
//! CONTEXT: Function dispatch is data-driven: a static map from uppercase
//! name to a `FunctionDef` carrying the arity bounds and the
//! implementation. The evaluator hands implementations the *unevaluated*
//! argument expressions so that IF, IFERROR, and CHOOSE can evaluate only
//! the branch they select. Everything else evaluates its arguments
//! eagerly and propagates the highest-precedence operand error.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use rust_decimal::prelude::ToPrimitive;

use parser::ast::{ErrorKind, Expression};

use crate::cell::{highest_precedence_error, CellValue};
use crate::evaluator::Evaluator;

type FunctionImpl = fn(&Evaluator, &[Expression]) -> CellValue;

/// One entry of the function table: arity bounds plus the implementation.
pub struct FunctionDef {
    pub name: &'static str,
    pub min_args: usize,
    /// None means variadic with no upper bound.
    pub max_args: Option<usize>,
    apply: FunctionImpl,
}

impl FunctionDef {
    /// Checks arity and invokes the implementation. A wrong argument count
    /// is a #VALUE! error, not a parse failure.
    pub fn call(&self, evaluator: &Evaluator, args: &[Expression]) -> CellValue {
        let too_few = args.len() < self.min_args;
        let too_many = self.max_args.is_some_and(|max| args.len() > max);
        if too_few || too_many {
            return CellValue::error(
                ErrorKind::Type,
                format!("{} called with {} arguments", self.name, args.len()),
            );
        }
        (self.apply)(evaluator, args)
    }
}

static FUNCTION_TABLE: Lazy<HashMap<&'static str, FunctionDef>> = Lazy::new(|| {
    let defs = [
        FunctionDef { name: "AND", min_args: 1, max_args: None, apply: fn_and },
        FunctionDef { name: "OR", min_args: 1, max_args: None, apply: fn_or },
        FunctionDef { name: "XOR", min_args: 1, max_args: None, apply: fn_xor },
        FunctionDef { name: "NOT", min_args: 1, max_args: Some(1), apply: fn_not },
        FunctionDef { name: "IF", min_args: 2, max_args: Some(3), apply: fn_if },
        FunctionDef { name: "IFERROR", min_args: 1, max_args: Some(2), apply: fn_iferror },
        FunctionDef { name: "CHOOSE", min_args: 2, max_args: None, apply: fn_choose },
        FunctionDef { name: "ISBLANK", min_args: 1, max_args: Some(1), apply: fn_isblank },
        FunctionDef { name: "ISERROR", min_args: 1, max_args: Some(1), apply: fn_iserror },
        FunctionDef { name: "EXACT", min_args: 2, max_args: Some(2), apply: fn_exact },
        FunctionDef { name: "INDIRECT", min_args: 1, max_args: Some(1), apply: fn_indirect },
        FunctionDef { name: "VERSION", min_args: 0, max_args: Some(0), apply: fn_version },
    ];
    defs.into_iter().map(|def| (def.name, def)).collect()
});

/// Looks up a function by its (uppercase) name.
pub fn lookup(name: &str) -> Option<&'static FunctionDef> {
    FUNCTION_TABLE.get(name)
}

/// Evaluates every argument eagerly. If any is an error, the
/// highest-precedence error kind is returned instead.
fn eval_args(evaluator: &Evaluator, args: &[Expression]) -> Result<Vec<CellValue>, CellValue> {
    let values: Vec<CellValue> = args.iter().map(|arg| evaluator.evaluate(arg)).collect();
    let refs: Vec<&CellValue> = values.iter().collect();
    match highest_precedence_error(&refs) {
        Some(err) => Err(CellValue::Error(err)),
        None => Ok(values),
    }
}

fn fn_and(evaluator: &Evaluator, args: &[Expression]) -> CellValue {
    let values = match eval_args(evaluator, args) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut result = true;
    for value in &values {
        match value.as_bool() {
            Ok(b) => result &= b,
            Err(e) => return CellValue::Error(e),
        }
    }
    CellValue::Bool(result)
}

fn fn_or(evaluator: &Evaluator, args: &[Expression]) -> CellValue {
    let values = match eval_args(evaluator, args) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut result = false;
    for value in &values {
        match value.as_bool() {
            Ok(b) => result |= b,
            Err(e) => return CellValue::Error(e),
        }
    }
    CellValue::Bool(result)
}

fn fn_xor(evaluator: &Evaluator, args: &[Expression]) -> CellValue {
    let values = match eval_args(evaluator, args) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut result = false;
    for value in &values {
        match value.as_bool() {
            Ok(b) => result ^= b,
            Err(e) => return CellValue::Error(e),
        }
    }
    CellValue::Bool(result)
}

fn fn_not(evaluator: &Evaluator, args: &[Expression]) -> CellValue {
    let value = evaluator.evaluate(&args[0]);
    if let CellValue::Error(e) = value {
        return CellValue::Error(e);
    }
    match value.as_bool() {
        Ok(b) => CellValue::Bool(!b),
        Err(e) => CellValue::Error(e),
    }
}

/// IF evaluates only the selected branch; the else branch defaults to
/// FALSE. The dependency graph still carries edges for both branches.
fn fn_if(evaluator: &Evaluator, args: &[Expression]) -> CellValue {
    let condition = evaluator.evaluate(&args[0]);
    if let CellValue::Error(e) = condition {
        return CellValue::Error(e);
    }
    let take_then = match condition.as_bool() {
        Ok(b) => b,
        Err(e) => return CellValue::Error(e),
    };
    if take_then {
        evaluator.evaluate(&args[1])
    } else {
        match args.get(2) {
            Some(otherwise) => evaluator.evaluate(otherwise),
            None => CellValue::Bool(false),
        }
    }
}

/// IFERROR is one of the two functions allowed to observe an error without
/// propagating it. The fallback defaults to empty text.
fn fn_iferror(evaluator: &Evaluator, args: &[Expression]) -> CellValue {
    let value = evaluator.evaluate(&args[0]);
    if !value.is_error() {
        return value;
    }
    match args.get(1) {
        Some(fallback) => evaluator.evaluate(fallback),
        None => CellValue::Text(String::new()),
    }
}

/// CHOOSE(index, v1, ...): 1-based selection; only the chosen value is
/// evaluated. A non-integer or out-of-range index is #VALUE!.
fn fn_choose(evaluator: &Evaluator, args: &[Expression]) -> CellValue {
    let index_value = evaluator.evaluate(&args[0]);
    if let CellValue::Error(e) = index_value {
        return CellValue::Error(e);
    }
    let index = match index_value.as_number() {
        Ok(n) => n,
        Err(e) => return CellValue::Error(e),
    };
    if !index.fract().is_zero() {
        return CellValue::error(ErrorKind::Type, "CHOOSE index must be an integer");
    }
    match index.to_usize() {
        Some(i) if i >= 1 && i < args.len() => evaluator.evaluate(&args[i]),
        _ => CellValue::error(ErrorKind::Type, "CHOOSE index out of range"),
    }
}

fn fn_isblank(evaluator: &Evaluator, args: &[Expression]) -> CellValue {
    let value = evaluator.evaluate(&args[0]);
    if let CellValue::Error(e) = value {
        return CellValue::Error(e);
    }
    CellValue::Bool(matches!(value, CellValue::Empty))
}

/// ISERROR observes errors rather than propagating them.
fn fn_iserror(evaluator: &Evaluator, args: &[Expression]) -> CellValue {
    let value = evaluator.evaluate(&args[0]);
    CellValue::Bool(value.is_error())
}

/// EXACT compares text case-sensitively, unlike the comparison operators.
fn fn_exact(evaluator: &Evaluator, args: &[Expression]) -> CellValue {
    let values = match eval_args(evaluator, args) {
        Ok(v) => v,
        Err(e) => return e,
    };
    CellValue::Bool(values[0].as_text() == values[1].as_text())
}

/// INDIRECT forms a reference from text at evaluation time. Such
/// references are invisible to the dependency graph, so they only pick up
/// changes when something else triggers a recompute of this cell.
fn fn_indirect(evaluator: &Evaluator, args: &[Expression]) -> CellValue {
    let value = evaluator.evaluate(&args[0]);
    if let CellValue::Error(e) = value {
        return CellValue::Error(e);
    }
    evaluator.resolve_reference_text(&value.as_text())
}

fn fn_version(_evaluator: &Evaluator, _args: &[Expression]) -> CellValue {
    CellValue::Text(env!("CARGO_PKG_VERSION").to_string())
}
