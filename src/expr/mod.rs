//   Copyright (c) 2024-2026 Dataverse SQL Engine Contributors
//   All rights reserved.
//
//   Permission is hereby granted, free of charge, to any person obtaining a copy
//   of this software and associated documentation files (the "Software"), to deal
//   in the Software without restriction, including without limitation the rights
//   to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
//   copies of the Software, and to permit persons to whom the Software is
//   furnished to do so, subject to the following conditions:
//
//   The above copyright notice and this permission notice shall be included in all
//   copies or substantial portions of the Software.
//
//   THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
//   IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
//   FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
//   AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
//   LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
//   OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
//   SOFTWARE.
//! Expression compilation: turns a `sqlparser` scalar expression into a
//! reusable callable over a row mapping, applying SQL three-valued logic.

pub mod functions;

use std::collections::HashMap;
use std::sync::Arc;

use sqlparser::ast::{
    BinaryOperator, DataType, Expr as SqlExpr, Function, FunctionArg, FunctionArgExpr,
    FunctionArguments, SelectItem, UnaryOperator, Value as SqlValue,
};

use crate::error::EngineError;
use crate::script::scope::VariableScope;
use crate::value::{compare, eq_tvl, Raw, Row, Tvl, TypeTag, Value};

/// A compiled scalar expression: a boxed closure over a row and the current
/// variable scope (for `@name` references and `ERROR_*()` introspection).
#[derive(Clone)]
pub struct CompiledExpr(Arc<dyn Fn(&Row, &VariableScope) -> Result<Value, EngineError> + Send + Sync>);

impl std::fmt::Debug for CompiledExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CompiledExpr(..)")
    }
}

impl CompiledExpr {
    pub fn eval(&self, row: &Row, scope: &VariableScope) -> Result<Value, EngineError> {
        (self.0)(row, scope)
    }
}

/// A compiled predicate: like `CompiledExpr` but exposes three-valued logic
/// directly, so callers can choose when to collapse Unknown to false.
#[derive(Clone)]
pub struct CompiledPredicate(Arc<dyn Fn(&Row, &VariableScope) -> Result<Tvl, EngineError> + Send + Sync>);

impl std::fmt::Debug for CompiledPredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CompiledPredicate(..)")
    }
}

impl CompiledPredicate {
    pub fn eval(&self, row: &Row, scope: &VariableScope) -> Result<Tvl, EngineError> {
        (self.0)(row, scope)
    }

    /// Collapse Unknown → false, for the WHERE/HAVING/IF/WHILE boundary.
    pub fn eval_bool(&self, row: &Row, scope: &VariableScope) -> Result<bool, EngineError> {
        Ok(self.eval(row, scope)?.collapse())
    }
}

fn value_fn<F>(f: F) -> CompiledExpr
where
    F: Fn(&Row, &VariableScope) -> Result<Value, EngineError> + Send + Sync + 'static,
{
    CompiledExpr(Arc::new(f))
}

fn pred_fn<F>(f: F) -> CompiledPredicate
where
    F: Fn(&Row, &VariableScope) -> Result<Tvl, EngineError> + Send + Sync + 'static,
{
    CompiledPredicate(Arc::new(f))
}

/// Compile a scalar expression tree into a reusable callable.
pub fn compile_expr(expr: &SqlExpr, schema: &HashMap<String, usize>) -> Result<CompiledExpr, EngineError> {
    let _ = schema; // schema is consulted for validation upstream in the planner
    match expr {
        // @variable reference — looked up in the script scope, case-insensitively.
        // Checked ahead of the plain-identifier arm below, since a script
        // variable is itself parsed as `SqlExpr::Identifier`.
        e if is_variable_ref(e) => {
            let name = variable_name(e);
            Ok(value_fn(move |_row, scope| {
                Ok(scope.get(&name).cloned().unwrap_or_else(Value::null))
            }))
        }

        SqlExpr::Identifier(ident) => {
            let name = ident.value.to_lowercase();
            Ok(value_fn(move |row, _scope| {
                Ok(row.get(&name).cloned().unwrap_or_else(Value::null))
            }))
        }

        SqlExpr::CompoundIdentifier(parts) => {
            let name = parts
                .last()
                .map(|p| p.value.to_lowercase())
                .unwrap_or_default();
            Ok(value_fn(move |row, _scope| {
                Ok(row.get(&name).cloned().unwrap_or_else(Value::null))
            }))
        }

        SqlExpr::Value(v) => {
            let value = literal_value(v)?;
            Ok(value_fn(move |_row, _scope| Ok(value.clone())))
        }

        SqlExpr::BinaryOp { left, op, right } => compile_binary_op(left, op, right, schema),

        SqlExpr::UnaryOp { op, expr } => {
            let inner = compile_expr(expr, schema)?;
            match op {
                UnaryOperator::Minus => Ok(value_fn(move |row, scope| {
                    let v = inner.eval(row, scope)?;
                    Ok(negate(&v))
                })),
                UnaryOperator::Plus => Ok(inner),
                UnaryOperator::Not => {
                    let pred = compile_predicate(expr, schema)?;
                    Ok(value_fn(move |row, scope| Ok(pred.eval(row, scope)?.not().to_value())))
                }
                _ => Err(EngineError::OperationNotSupported(format!("unary operator {op}"))),
            }
        }

        SqlExpr::Nested(inner) => compile_expr(inner, schema),

        SqlExpr::IsNull(inner) => {
            let c = compile_expr(inner, schema)?;
            Ok(value_fn(move |row, scope| Ok(Value::boolean(c.eval(row, scope)?.is_null()))))
        }
        SqlExpr::IsNotNull(inner) => {
            let c = compile_expr(inner, schema)?;
            Ok(value_fn(move |row, scope| Ok(Value::boolean(!c.eval(row, scope)?.is_null()))))
        }

        SqlExpr::Between { expr, negated, low, high } => {
            let x = compile_expr(expr, schema)?;
            let lo = compile_expr(low, schema)?;
            let hi = compile_expr(high, schema)?;
            let negated = *negated;
            Ok(value_fn(move |row, scope| {
                let xv = x.eval(row, scope)?;
                let lov = lo.eval(row, scope)?;
                let hiv = hi.eval(row, scope)?;
                if xv.is_null() || lov.is_null() || hiv.is_null() {
                    return Ok(Value::null());
                }
                let ge = compare(&xv, &lov).map(|o| o != std::cmp::Ordering::Less).unwrap_or(false);
                let le = compare(&xv, &hiv).map(|o| o != std::cmp::Ordering::Greater).unwrap_or(false);
                let mut result = ge && le;
                if negated {
                    result = !result;
                }
                Ok(Value::boolean(result))
            }))
        }

        SqlExpr::InList { expr, list, negated } => {
            let x = compile_expr(expr, schema)?;
            let items: Vec<CompiledExpr> = list
                .iter()
                .map(|e| compile_expr(e, schema))
                .collect::<Result<_, _>>()?;
            let negated = *negated;
            Ok(value_fn(move |row, scope| {
                let xv = x.eval(row, scope)?;
                if xv.is_null() {
                    return Ok(Value::null());
                }
                let mut any_null = false;
                let mut found = false;
                for item in &items {
                    let iv = item.eval(row, scope)?;
                    match eq_tvl(&xv, &iv) {
                        Tvl::True => {
                            found = true;
                            break;
                        }
                        Tvl::Unknown => any_null = true,
                        Tvl::False => {}
                    }
                }
                let result = if found {
                    Tvl::True
                } else if any_null {
                    Tvl::Unknown
                } else {
                    Tvl::False
                };
                let result = if negated { result.not() } else { result };
                Ok(result.to_value())
            }))
        }

        SqlExpr::Like { negated, expr, pattern, escape_char, .. } => {
            let x = compile_expr(expr, schema)?;
            let p = compile_expr(pattern, schema)?;
            let negated = *negated;
            let escape = escape_char.as_ref().and_then(|s| s.chars().next());
            Ok(value_fn(move |row, scope| {
                let xv = x.eval(row, scope)?;
                let pv = p.eval(row, scope)?;
                if xv.is_null() || pv.is_null() {
                    return Ok(Value::null());
                }
                let text = xv.display_text();
                let pat = pv.display_text();
                let mut m = functions::sql_like(&text, &pat, escape);
                if negated {
                    m = !m;
                }
                Ok(Value::boolean(m))
            }))
        }

        SqlExpr::Case { operand, conditions, results, else_result } => {
            compile_case(operand.as_deref(), conditions, results, else_result.as_deref(), schema)
        }

        SqlExpr::Cast { expr, data_type, .. } => {
            let inner = compile_expr(expr, schema)?;
            let target = sql_type_to_tag(data_type)?;
            Ok(value_fn(move |row, scope| {
                functions::cast_value(&inner.eval(row, scope)?, target)
            }))
        }

        SqlExpr::Function(func) => compile_function(func, schema),

        _ => Err(EngineError::OperationNotSupported(format!(
            "expression not supported: {expr}"
        ))),
    }
}

fn compile_case(
    operand: Option<&SqlExpr>,
    conditions: &[SqlExpr],
    results: &[SqlExpr],
    else_result: Option<&SqlExpr>,
    schema: &HashMap<String, usize>,
) -> Result<CompiledExpr, EngineError> {
    let operand = operand.map(|e| compile_expr(e, schema)).transpose()?;
    let whens: Vec<(CompiledExpr, CompiledExpr)> = conditions
        .iter()
        .zip(results.iter())
        .map(|(c, r)| Ok((compile_expr(c, schema)?, compile_expr(r, schema)?)))
        .collect::<Result<_, EngineError>>()?;
    let else_branch = else_result.map(|e| compile_expr(e, schema)).transpose()?;
    Ok(value_fn(move |row, scope| {
        if let Some(op) = &operand {
            let opv = op.eval(row, scope)?;
            for (c, r) in &whens {
                let cv = c.eval(row, scope)?;
                if eq_tvl(&opv, &cv) == Tvl::True {
                    return r.eval(row, scope);
                }
            }
        } else {
            for (c, r) in &whens {
                // searched CASE: condition is itself a predicate-shaped value
                let cv = c.eval(row, scope)?;
                if cv.is_truthy() {
                    return r.eval(row, scope);
                }
            }
        }
        match &else_branch {
            Some(e) => e.eval(row, scope),
            None => Ok(Value::null()),
        }
    }))
}

fn compile_binary_op(
    left: &SqlExpr,
    op: &BinaryOperator,
    right: &SqlExpr,
    schema: &HashMap<String, usize>,
) -> Result<CompiledExpr, EngineError> {
    use BinaryOperator::*;
    match op {
        And | Or => {
            let pred = compile_predicate(&SqlExpr::BinaryOp {
                left: Box::new(left.clone()),
                op: op.clone(),
                right: Box::new(right.clone()),
            }, schema)?;
            Ok(value_fn(move |row, scope| Ok(pred.eval(row, scope)?.to_value())))
        }
        Eq | NotEq | Lt | LtEq | Gt | GtEq => {
            let pred = compile_predicate(&SqlExpr::BinaryOp {
                left: Box::new(left.clone()),
                op: op.clone(),
                right: Box::new(right.clone()),
            }, schema)?;
            Ok(value_fn(move |row, scope| Ok(pred.eval(row, scope)?.to_value())))
        }
        Plus | Minus | Multiply | Divide | Modulo => {
            let l = compile_expr(left, schema)?;
            let r = compile_expr(right, schema)?;
            let op = op.clone();
            Ok(value_fn(move |row, scope| {
                functions::arithmetic(&op, &l.eval(row, scope)?, &r.eval(row, scope)?)
            }))
        }
        StringConcat => {
            let l = compile_expr(left, schema)?;
            let r = compile_expr(right, schema)?;
            Ok(value_fn(move |row, scope| {
                let lv = l.eval(row, scope)?;
                let rv = r.eval(row, scope)?;
                if lv.is_null() || rv.is_null() {
                    return Ok(Value::null());
                }
                Ok(Value::string(format!("{}{}", lv.display_text(), rv.display_text())))
            }))
        }
        _ => Err(EngineError::OperationNotSupported(format!("operator {op}"))),
    }
}

/// Compile a boolean-shaped expression into a three-valued predicate,
/// preserving Unknown until the caller collapses it.
pub fn compile_predicate(expr: &SqlExpr, schema: &HashMap<String, usize>) -> Result<CompiledPredicate, EngineError> {
    match expr {
        SqlExpr::BinaryOp { left, op, right } if matches!(op, BinaryOperator::And | BinaryOperator::Or) => {
            let l = compile_predicate(left, schema)?;
            let r = compile_predicate(right, schema)?;
            let is_and = matches!(op, BinaryOperator::And);
            Ok(pred_fn(move |row, scope| {
                let lv = l.eval(row, scope)?;
                let rv = r.eval(row, scope)?;
                Ok(if is_and { lv.and(rv) } else { lv.or(rv) })
            }))
        }
        SqlExpr::BinaryOp { left, op, right }
            if matches!(
                op,
                BinaryOperator::Eq
                    | BinaryOperator::NotEq
                    | BinaryOperator::Lt
                    | BinaryOperator::LtEq
                    | BinaryOperator::Gt
                    | BinaryOperator::GtEq
            ) =>
        {
            let l = compile_expr(left, schema)?;
            let r = compile_expr(right, schema)?;
            let op = op.clone();
            Ok(pred_fn(move |row, scope| {
                let lv = l.eval(row, scope)?;
                let rv = r.eval(row, scope)?;
                if lv.is_null() || rv.is_null() {
                    return Ok(Tvl::Unknown);
                }
                let cmp = compare(&lv, &rv);
                Ok(match (&op, cmp) {
                    (BinaryOperator::Eq, _) => eq_tvl(&lv, &rv),
                    (BinaryOperator::NotEq, _) => eq_tvl(&lv, &rv).not(),
                    (BinaryOperator::Lt, Some(o)) => Tvl::from_bool(o == std::cmp::Ordering::Less),
                    (BinaryOperator::LtEq, Some(o)) => Tvl::from_bool(o != std::cmp::Ordering::Greater),
                    (BinaryOperator::Gt, Some(o)) => Tvl::from_bool(o == std::cmp::Ordering::Greater),
                    (BinaryOperator::GtEq, Some(o)) => Tvl::from_bool(o != std::cmp::Ordering::Less),
                    _ => Tvl::Unknown,
                })
            }))
        }
        SqlExpr::UnaryOp { op: UnaryOperator::Not, expr } => {
            let inner = compile_predicate(expr, schema)?;
            Ok(pred_fn(move |row, scope| Ok(inner.eval(row, scope)?.not())))
        }
        SqlExpr::Nested(inner) => compile_predicate(inner, schema),
        SqlExpr::IsNull(_) | SqlExpr::IsNotNull(_) | SqlExpr::Between { .. } | SqlExpr::InList { .. } | SqlExpr::Like { .. } => {
            let v = compile_expr(expr, schema)?;
            Ok(pred_fn(move |row, scope| {
                let result = v.eval(row, scope)?;
                Ok(if result.is_null() {
                    Tvl::Unknown
                } else {
                    Tvl::from_bool(result.is_truthy())
                })
            }))
        }
        _ => {
            // General expression used in boolean position (e.g. a bare column,
            // CASE, function call): evaluate then collapse null -> Unknown.
            let v = compile_expr(expr, schema)?;
            Ok(pred_fn(move |row, scope| {
                let result = v.eval(row, scope)?;
                Ok(if result.is_null() {
                    Tvl::Unknown
                } else {
                    Tvl::from_bool(result.is_truthy())
                })
            }))
        }
    }
}

fn compile_function(func: &Function, schema: &HashMap<String, usize>) -> Result<CompiledExpr, EngineError> {
    let name = func.name.to_string().to_uppercase();
    let args: Vec<&FunctionArgExpr> = match &func.args {
        FunctionArguments::List(list) => list
            .args
            .iter()
            .map(|a| match a {
                FunctionArg::Named { arg, .. } | FunctionArg::Unnamed(arg) => arg,
                FunctionArg::ExprNamed { arg, .. } => arg,
            })
            .collect(),
        _ => Vec::new(),
    };
    let exprs: Vec<SqlExpr> = args
        .iter()
        .filter_map(|a| match a {
            FunctionArgExpr::Expr(e) => Some(e.clone()),
            _ => None,
        })
        .collect();
    let compiled: Vec<CompiledExpr> = exprs
        .iter()
        .map(|e| compile_expr(e, schema))
        .collect::<Result<_, _>>()?;
    functions::builtin(&name, compiled)
}

fn literal_value(v: &SqlValue) -> Result<Value, EngineError> {
    match v {
        SqlValue::Number(n, _) => {
            if let Ok(i) = n.parse::<i64>() {
                Ok(Value::int(i))
            } else {
                n.parse::<f64>()
                    .map(Value::double)
                    .map_err(|_| EngineError::Parse(format!("invalid numeric literal {n}")))
            }
        }
        SqlValue::SingleQuotedString(s) | SqlValue::DoubleQuotedString(s) => Ok(Value::string(s.clone())),
        SqlValue::Boolean(b) => Ok(Value::boolean(*b)),
        SqlValue::Null => Ok(Value::null()),
        _ => Err(EngineError::OperationNotSupported(format!("literal {v}"))),
    }
}

fn negate(v: &Value) -> Value {
    match &v.raw {
        Raw::Int(i) => Value::int(-i),
        Raw::Double(d) => Value::double(-d),
        Raw::Decimal(d) => Value::from_raw(Raw::Decimal(-*d)),
        _ => Value::null(),
    }
}

fn is_variable_ref(e: &SqlExpr) -> bool {
    matches!(e, SqlExpr::Identifier(i) if i.value.starts_with('@'))
}

fn variable_name(e: &SqlExpr) -> String {
    match e {
        SqlExpr::Identifier(i) => i.value.clone(),
        _ => String::new(),
    }
}

pub fn sql_type_to_tag(dt: &DataType) -> Result<TypeTag, EngineError> {
    use DataType::*;
    Ok(match dt {
        Int(_) | Integer(_) | SmallInt(_) | TinyInt(_) => TypeTag::Integer,
        BigInt(_) => TypeTag::BigInt,
        Decimal(_) | Numeric(_) | Dec(_) => TypeTag::Decimal,
        Float(_) | Real | Double | DoublePrecision => TypeTag::Double,
        Boolean => TypeTag::Boolean,
        Datetime(_) | Timestamp(..) | Date => TypeTag::DateTime,
        Uuid => TypeTag::Guid,
        Varchar(_) | Char(_) | CharVarying(_) | String(_) | Text => TypeTag::String,
        _ => {
            return Err(EngineError::OperationNotSupported(format!(
                "CAST target type {dt}"
            )))
        }
    })
}

/// Default column name for an unaliased SELECT-list expression, per
/// `spec.md`'s GROUP BY-on-alias handling.
pub fn expr_default_name(expr: &SqlExpr) -> String {
    match expr {
        SqlExpr::Identifier(i) => i.value.to_lowercase(),
        SqlExpr::CompoundIdentifier(parts) => parts.last().map(|p| p.value.to_lowercase()).unwrap_or_default(),
        SqlExpr::Function(f) => f.name.to_string().to_lowercase(),
        _ => String::new(),
    }
}

pub fn item_output_name(item: &SelectItem) -> String {
    match item {
        SelectItem::ExprWithAlias { alias, .. } => alias.value.to_lowercase(),
        SelectItem::UnnamedExpr(e) => expr_default_name(e),
        _ => String::new(),
    }
}
