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
//! Scalar function library for the expression compiler, per `spec.md` §4.2.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, FixedOffset, Timelike, Utc};
use sqlparser::ast::BinaryOperator;

use super::CompiledExpr;
use crate::error::EngineError;
use crate::value::{Raw, TypeTag, Value};

pub fn arithmetic(op: &BinaryOperator, l: &Value, r: &Value) -> Result<Value, EngineError> {
    if l.is_null() || r.is_null() {
        return Ok(Value::null());
    }
    let (lf, rf) = (as_f64(l)?, as_f64(r)?);
    let result = match op {
        BinaryOperator::Plus => lf + rf,
        BinaryOperator::Minus => lf - rf,
        BinaryOperator::Multiply => lf * rf,
        BinaryOperator::Divide => {
            if rf == 0.0 {
                return Err(EngineError::Validation("division by zero".into()));
            }
            lf / rf
        }
        BinaryOperator::Modulo => {
            if rf == 0.0 {
                return Err(EngineError::Validation("modulo by zero".into()));
            }
            lf % rf
        }
        _ => return Err(EngineError::OperationNotSupported(format!("arithmetic operator {op}"))),
    };
    if matches!(l.raw, Raw::Int(_)) && matches!(r.raw, Raw::Int(_)) && matches!(op, BinaryOperator::Plus | BinaryOperator::Minus | BinaryOperator::Multiply | BinaryOperator::Modulo) {
        Ok(Value::int(result as i64))
    } else {
        Ok(Value::double(result))
    }
}

fn as_f64(v: &Value) -> Result<f64, EngineError> {
    match &v.raw {
        Raw::Int(i) => Ok(*i as f64),
        Raw::Double(d) => Ok(*d),
        Raw::Decimal(d) => d.to_string().parse().map_err(|_| EngineError::Validation("bad decimal".into())),
        _ => Err(EngineError::Validation("expected numeric operand".into())),
    }
}

/// SQL `LIKE` pattern match: `%` any run, `_` any single char, optional
/// escape character preceding a literal `%`/`_`/escape char.
pub fn sql_like(text: &str, pattern: &str, escape: Option<char>) -> bool {
    let t: Vec<char> = text.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    like_match(&t, &p, escape)
}

fn like_match(t: &[char], p: &[char], escape: Option<char>) -> bool {
    match p.first() {
        None => t.is_empty(),
        Some(&c) if Some(c) == escape && p.len() > 1 => {
            !t.is_empty() && t[0] == p[1] && like_match(&t[1..], &p[2..], escape)
        }
        Some('%') => {
            like_match(t, &p[1..], escape)
                || (!t.is_empty() && like_match(&t[1..], p, escape))
        }
        Some('_') => !t.is_empty() && like_match(&t[1..], &p[1..], escape),
        Some(&c) => !t.is_empty() && t[0].to_ascii_lowercase() == c.to_ascii_lowercase() && like_match(&t[1..], &p[1..], escape),
    }
}

pub fn cast_value(v: &Value, target: TypeTag) -> Result<Value, EngineError> {
    if v.is_null() {
        return Ok(Value::null());
    }
    let text = v.display_text();
    Ok(match target {
        TypeTag::String | TypeTag::Memo => Value::string(text),
        TypeTag::Integer | TypeTag::BigInt => {
            let parsed: i64 = match &v.raw {
                Raw::Int(i) => *i,
                Raw::Double(d) => *d as i64,
                Raw::Bool(b) => *b as i64,
                _ => text.parse().map_err(|_| EngineError::Validation(format!("cannot cast '{text}' to integer")))?,
            };
            Value::int(parsed)
        }
        TypeTag::Double | TypeTag::Decimal | TypeTag::Money => {
            let parsed: f64 = match &v.raw {
                Raw::Int(i) => *i as f64,
                Raw::Double(d) => *d,
                _ => text.parse().map_err(|_| EngineError::Validation(format!("cannot cast '{text}' to numeric")))?,
            };
            Value::double(parsed)
        }
        TypeTag::Boolean => Value::boolean(matches!(text.to_lowercase().as_str(), "true" | "1")),
        TypeTag::DateTime => {
            let dt = DateTime::parse_from_rfc3339(&text)
                .map_err(|_| EngineError::Validation(format!("cannot cast '{text}' to datetime")))?;
            Value::from_raw(Raw::Timestamp(dt))
        }
        TypeTag::Guid => {
            let id = uuid::Uuid::parse_str(&text)
                .map_err(|_| EngineError::Validation(format!("cannot cast '{text}' to uuid")))?;
            Value::from_raw(Raw::Uuid(id))
        }
        _ => return Err(EngineError::OperationNotSupported(format!("cast to {target:?}"))),
    })
}

/// Resolve a built-in scalar function by name against its already-compiled
/// argument expressions.
pub fn builtin(name: &str, args: Vec<CompiledExpr>) -> Result<CompiledExpr, EngineError> {
    macro_rules! wrap {
        ($f:expr) => {
            Ok(super::CompiledExpr(std::sync::Arc::new($f)))
        };
    }

    match name {
        "LEN" | "DATALENGTH" => {
            let a = arg(&args, 0)?;
            wrap!(move |row, scope| {
                let v = a.eval(row, scope)?;
                Ok(if v.is_null() { Value::null() } else { Value::int(v.display_text().chars().count() as i64) })
            })
        }
        "LOWER" => unary_text(args, |s| s.to_lowercase()),
        "UPPER" => unary_text(args, |s| s.to_uppercase()),
        "LTRIM" => unary_text(args, |s| s.trim_start().to_string()),
        "RTRIM" => unary_text(args, |s| s.trim_end().to_string()),
        "SUBSTRING" => {
            let s = arg(&args, 0)?;
            let start = arg(&args, 1)?;
            let len = arg(&args, 2)?;
            wrap!(move |row, scope| {
                let sv = s.eval(row, scope)?;
                let startv = start.eval(row, scope)?;
                let lenv = len.eval(row, scope)?;
                if sv.is_null() || startv.is_null() || lenv.is_null() {
                    return Ok(Value::null());
                }
                let text: Vec<char> = sv.display_text().chars().collect();
                let start_i = (as_f64(&startv)? as i64).max(1) - 1;
                let len_i = (as_f64(&lenv)? as i64).max(0);
                let begin = (start_i as usize).min(text.len());
                let end = ((start_i + len_i) as usize).min(text.len());
                let slice: String = if begin < end { text[begin..end].iter().collect() } else { String::new() };
                Ok(Value::string(slice))
            })
        }
        "REPLACE" => {
            let s = arg(&args, 0)?;
            let from = arg(&args, 1)?;
            let to = arg(&args, 2)?;
            wrap!(move |row, scope| {
                let sv = s.eval(row, scope)?;
                let fromv = from.eval(row, scope)?;
                let tov = to.eval(row, scope)?;
                if sv.is_null() || fromv.is_null() || tov.is_null() {
                    return Ok(Value::null());
                }
                Ok(Value::string(sv.display_text().replace(&fromv.display_text(), &tov.display_text())))
            })
        }
        "CONCAT" => {
            wrap!(move |row, scope| {
                let mut out = String::new();
                for a in &args {
                    let v = a.eval(row, scope)?;
                    if !v.is_null() {
                        out.push_str(&v.display_text());
                    }
                }
                Ok(Value::string(out))
            })
        }
        "LEFT" => {
            let s = arg(&args, 0)?;
            let n = arg(&args, 1)?;
            wrap!(move |row, scope| {
                let sv = s.eval(row, scope)?;
                let nv = n.eval(row, scope)?;
                if sv.is_null() || nv.is_null() {
                    return Ok(Value::null());
                }
                let text: Vec<char> = sv.display_text().chars().collect();
                let take = (as_f64(&nv)? as usize).min(text.len());
                Ok(Value::string(text[..take].iter().collect::<String>()))
            })
        }
        "RIGHT" => {
            let s = arg(&args, 0)?;
            let n = arg(&args, 1)?;
            wrap!(move |row, scope| {
                let sv = s.eval(row, scope)?;
                let nv = n.eval(row, scope)?;
                if sv.is_null() || nv.is_null() {
                    return Ok(Value::null());
                }
                let text: Vec<char> = sv.display_text().chars().collect();
                let take = (as_f64(&nv)? as usize).min(text.len());
                Ok(Value::string(text[text.len() - take..].iter().collect::<String>()))
            })
        }
        "COALESCE" => {
            wrap!(move |row, scope| {
                for a in &args {
                    let v = a.eval(row, scope)?;
                    if !v.is_null() {
                        return Ok(v);
                    }
                }
                Ok(Value::null())
            })
        }
        "ISNULL" => {
            let a = arg(&args, 0)?;
            let b = arg(&args, 1)?;
            wrap!(move |row, scope| {
                let av = a.eval(row, scope)?;
                if av.is_null() { b.eval(row, scope) } else { Ok(av) }
            })
        }
        "NULLIF" => {
            let a = arg(&args, 0)?;
            let b = arg(&args, 1)?;
            wrap!(move |row, scope| {
                let av = a.eval(row, scope)?;
                let bv = b.eval(row, scope)?;
                if crate::value::eq_tvl(&av, &bv) == crate::value::Tvl::True {
                    Ok(Value::null())
                } else {
                    Ok(av)
                }
            })
        }
        "IIF" => {
            let cond = arg(&args, 0)?;
            let then_v = arg(&args, 1)?;
            let else_v = arg(&args, 2)?;
            wrap!(move |row, scope| {
                let cv = cond.eval(row, scope)?;
                if cv.is_truthy() { then_v.eval(row, scope) } else { else_v.eval(row, scope) }
            })
        }
        "ABS" => unary_numeric(args, f64::abs, |i| i.abs()),
        "FLOOR" => unary_numeric(args, f64::floor, |i| i),
        "CEILING" => unary_numeric(args, f64::ceil, |i| i),
        "ROUND" => {
            let s = arg(&args, 0)?;
            let d = args.get(1).cloned();
            wrap!(move |row, scope| {
                let sv = s.eval(row, scope)?;
                if sv.is_null() {
                    return Ok(Value::null());
                }
                let digits = match &d {
                    Some(e) => as_f64(&e.eval(row, scope)?)? as i32,
                    None => 0,
                };
                let factor = 10f64.powi(digits);
                Ok(Value::double((as_f64(&sv)? * factor).round() / factor))
            })
        }
        "GETDATE" | "SYSUTCDATETIME" => {
            wrap!(move |_row, _scope| Ok(Value::from_raw(Raw::Timestamp(Utc::now().with_timezone(&FixedOffset::east_opt(0).unwrap())))))
        }
        "YEAR" => date_part(args, |d| d.year() as i64),
        "MONTH" => date_part(args, |d| d.month() as i64),
        "DAY" => date_part(args, |d| d.day() as i64),
        "DATEPART" => {
            // DATEPART(part, date) — part arrives as an identifier compiled
            // to a string-producing expression by the caller's planner layer.
            let part = arg(&args, 0)?;
            let d = arg(&args, 1)?;
            wrap!(move |row, scope| {
                let partv = part.eval(row, scope)?.display_text().to_lowercase();
                let dv = d.eval(row, scope)?;
                if dv.is_null() {
                    return Ok(Value::null());
                }
                let dt = as_datetime(&dv)?;
                let n = match partv.as_str() {
                    "year" | "yyyy" | "yy" => dt.year() as i64,
                    "month" | "mm" | "m" => dt.month() as i64,
                    "day" | "dd" | "d" => dt.day() as i64,
                    "hour" | "hh" => dt.hour() as i64,
                    "minute" | "mi" | "n" => dt.minute() as i64,
                    "second" | "ss" | "s" => dt.second() as i64,
                    other => return Err(EngineError::OperationNotSupported(format!("DATEPART({other}, ...)"))),
                };
                Ok(Value::int(n))
            })
        }
        "DATEDIFF" => {
            let part = arg(&args, 0)?;
            let start = arg(&args, 1)?;
            let end = arg(&args, 2)?;
            wrap!(move |row, scope| {
                let partv = part.eval(row, scope)?.display_text().to_lowercase();
                let sv = start.eval(row, scope)?;
                let ev = end.eval(row, scope)?;
                if sv.is_null() || ev.is_null() {
                    return Ok(Value::null());
                }
                let sdt = as_datetime(&sv)?;
                let edt = as_datetime(&ev)?;
                let delta = edt - sdt;
                let n = match partv.as_str() {
                    "day" | "dd" | "d" => delta.num_days(),
                    "hour" | "hh" => delta.num_hours(),
                    "minute" | "mi" | "n" => delta.num_minutes(),
                    "second" | "ss" | "s" => delta.num_seconds(),
                    "year" | "yyyy" | "yy" => (edt.year() - sdt.year()) as i64,
                    "month" | "mm" | "m" => ((edt.year() - sdt.year()) * 12 + edt.month() as i32 - sdt.month() as i32) as i64,
                    other => return Err(EngineError::OperationNotSupported(format!("DATEDIFF({other}, ...)"))),
                };
                Ok(Value::int(n))
            })
        }
        "DATEADD" => {
            let part = arg(&args, 0)?;
            let n = arg(&args, 1)?;
            let d = arg(&args, 2)?;
            wrap!(move |row, scope| {
                let partv = part.eval(row, scope)?.display_text().to_lowercase();
                let nv = n.eval(row, scope)?;
                let dv = d.eval(row, scope)?;
                if nv.is_null() || dv.is_null() {
                    return Ok(Value::null());
                }
                let amount = as_f64(&nv)? as i64;
                let dt = as_datetime(&dv)?;
                let new_dt = match partv.as_str() {
                    "day" | "dd" | "d" => dt + ChronoDuration::days(amount),
                    "hour" | "hh" => dt + ChronoDuration::hours(amount),
                    "minute" | "mi" | "n" => dt + ChronoDuration::minutes(amount),
                    "second" | "ss" | "s" => dt + ChronoDuration::seconds(amount),
                    "week" | "wk" | "ww" => dt + ChronoDuration::weeks(amount),
                    "month" | "mm" | "m" => add_months(dt, amount),
                    "year" | "yyyy" | "yy" => add_months(dt, amount * 12),
                    other => return Err(EngineError::OperationNotSupported(format!("DATEADD({other}, ...)"))),
                };
                Ok(Value::from_raw(Raw::Timestamp(new_dt)))
            })
        }
        "ERROR_MESSAGE" => wrap!(move |_row: &crate::value::Row, scope: &crate::script::scope::VariableScope| Ok(scope.get("@@ERROR_MESSAGE").cloned().unwrap_or_else(Value::null))),
        "ERROR_NUMBER" => wrap!(move |_row: &crate::value::Row, scope: &crate::script::scope::VariableScope| Ok(scope.get("@@ERROR_NUMBER").cloned().unwrap_or_else(Value::null))),
        "ERROR_SEVERITY" => wrap!(move |_row: &crate::value::Row, scope: &crate::script::scope::VariableScope| Ok(scope.get("@@ERROR_SEVERITY").cloned().unwrap_or_else(Value::null))),
        "ERROR_STATE" => wrap!(move |_row: &crate::value::Row, scope: &crate::script::scope::VariableScope| Ok(scope.get("@@ERROR_STATE").cloned().unwrap_or_else(Value::null))),
        other => Err(EngineError::OperationNotSupported(format!("function {other}"))),
    }
}

fn arg(args: &[CompiledExpr], i: usize) -> Result<CompiledExpr, EngineError> {
    args.get(i)
        .cloned()
        .ok_or_else(|| EngineError::Validation(format!("missing function argument at position {i}")))
}

fn unary_text(args: Vec<CompiledExpr>, f: impl Fn(&str) -> String + Send + Sync + 'static) -> Result<CompiledExpr, EngineError> {
    let a = arg(&args, 0)?;
    Ok(super::CompiledExpr(std::sync::Arc::new(move |row, scope| {
        let v = a.eval(row, scope)?;
        Ok(if v.is_null() { Value::null() } else { Value::string(f(&v.display_text())) })
    })))
}

fn unary_numeric(
    args: Vec<CompiledExpr>,
    ff: impl Fn(f64) -> f64 + Send + Sync + 'static,
    fi: impl Fn(i64) -> i64 + Send + Sync + 'static,
) -> Result<CompiledExpr, EngineError> {
    let a = arg(&args, 0)?;
    Ok(super::CompiledExpr(std::sync::Arc::new(move |row, scope| {
        let v = a.eval(row, scope)?;
        if v.is_null() {
            return Ok(Value::null());
        }
        Ok(match &v.raw {
            Raw::Int(i) => Value::int(fi(*i)),
            _ => Value::double(ff(as_f64(&v)?)),
        })
    })))
}

fn date_part(args: Vec<CompiledExpr>, f: impl Fn(&DateTime<FixedOffset>) -> i64 + Send + Sync + 'static) -> Result<CompiledExpr, EngineError> {
    let a = arg(&args, 0)?;
    Ok(super::CompiledExpr(std::sync::Arc::new(move |row, scope| {
        let v = a.eval(row, scope)?;
        if v.is_null() {
            return Ok(Value::null());
        }
        Ok(Value::int(f(&as_datetime(&v)?)))
    })))
}

fn as_datetime(v: &Value) -> Result<DateTime<FixedOffset>, EngineError> {
    match &v.raw {
        Raw::Timestamp(t) => Ok(*t),
        _ => DateTime::parse_from_rfc3339(&v.display_text())
            .map_err(|_| EngineError::Validation(format!("'{}' is not a valid datetime", v.display_text()))),
    }
}

fn add_months(dt: DateTime<FixedOffset>, months: i64) -> DateTime<FixedOffset> {
    let total = dt.year() as i64 * 12 + (dt.month() as i64 - 1) + months;
    let year = total.div_euclid(12) as i32;
    let month = (total.rem_euclid(12) + 1) as u32;
    let day = dt.day().min(days_in_month(year, month));
    dt.with_day(1)
        .and_then(|d| d.with_month(month))
        .and_then(|d| d.with_year(year))
        .and_then(|d| d.with_day(day))
        .unwrap_or(dt)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    let first_next = chrono::NaiveDate::from_ymd_opt(ny, nm, 1).unwrap();
    let first_this = chrono::NaiveDate::from_ymd_opt(year, month, 1).unwrap();
    (first_next - first_this).num_days() as u32
}
