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
//! Typed cell values, column descriptors, and rows — the data model that
//! flows between plan operators.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, FixedOffset};
use rust_decimal::Decimal;
use uuid::Uuid;

/// The declared type tag for a column, drawn from the closed set the
/// backend's metadata can describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    String,
    Integer,
    BigInt,
    Decimal,
    Double,
    Boolean,
    DateTime,
    Guid,
    Lookup,
    OptionSet,
    MultiSelectOptionSet,
    Money,
    Memo,
    Image,
    Unknown,
}

/// A single cell's raw value. `Null` collapses comparisons to
/// [`Ordering::Unknown`]-style three-valued logic at the expression layer.
#[derive(Debug, Clone)]
pub enum Raw {
    Null,
    Int(i64),
    Decimal(Decimal),
    Double(f64),
    Bool(bool),
    String(String),
    Timestamp(DateTime<FixedOffset>),
    Uuid(Uuid),
    Bytes(Vec<u8>),
    MultiSelect(Vec<Raw>),
}

/// A cell value: the raw value plus optional formatted/lookup metadata.
#[derive(Debug, Clone)]
pub struct Value {
    pub raw: Raw,
    /// Pre-formatted display text (lookups, option sets, formatted numerics).
    pub formatted: Option<String>,
    /// For lookup values: the target entity logical name.
    pub lookup_entity: Option<String>,
    /// For lookup values: the target entity's primary key.
    pub lookup_id: Option<Uuid>,
}

impl Value {
    pub fn null() -> Self {
        Value {
            raw: Raw::Null,
            formatted: None,
            lookup_entity: None,
            lookup_id: None,
        }
    }

    pub fn from_raw(raw: Raw) -> Self {
        Value {
            raw,
            formatted: None,
            lookup_entity: None,
            lookup_id: None,
        }
    }

    pub fn int(v: i64) -> Self {
        Value::from_raw(Raw::Int(v))
    }

    pub fn double(v: f64) -> Self {
        Value::from_raw(Raw::Double(v))
    }

    pub fn string<S: Into<String>>(v: S) -> Self {
        Value::from_raw(Raw::String(v.into()))
    }

    pub fn boolean(v: bool) -> Self {
        Value::from_raw(Raw::Bool(v))
    }

    pub fn lookup(entity: impl Into<String>, id: Uuid, formatted: Option<String>) -> Self {
        Value {
            raw: Raw::Uuid(id),
            formatted,
            lookup_entity: Some(entity.into()),
            lookup_id: Some(id),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self.raw, Raw::Null)
    }

    /// Truthiness collapse used at WHERE/HAVING/IF/WHILE boundaries: an
    /// Unknown (null) predicate result is treated as false.
    pub fn is_truthy(&self) -> bool {
        matches!(self.raw, Raw::Bool(true))
    }

    pub fn display_text(&self) -> String {
        if let Some(f) = &self.formatted {
            return f.clone();
        }
        match &self.raw {
            Raw::Null => String::new(),
            Raw::Int(i) => i.to_string(),
            Raw::Decimal(d) => d.to_string(),
            Raw::Double(d) => d.to_string(),
            Raw::Bool(b) => b.to_string(),
            Raw::String(s) => s.clone(),
            Raw::Timestamp(t) => t.to_rfc3339(),
            Raw::Uuid(u) => u.to_string(),
            Raw::Bytes(b) => format!("0x{}", hex_encode(b)),
            Raw::MultiSelect(items) => items
                .iter()
                .map(|r| Value::from_raw(r.clone()).display_text())
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// SQL three-valued comparison result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tvl {
    True,
    False,
    Unknown,
}

impl Tvl {
    pub fn from_bool(b: bool) -> Self {
        if b {
            Tvl::True
        } else {
            Tvl::False
        }
    }

    pub fn to_value(self) -> Value {
        match self {
            Tvl::True => Value::boolean(true),
            Tvl::False => Value::boolean(false),
            Tvl::Unknown => Value::null(),
        }
    }

    pub fn not(self) -> Tvl {
        match self {
            Tvl::True => Tvl::False,
            Tvl::False => Tvl::True,
            Tvl::Unknown => Tvl::Unknown,
        }
    }

    pub fn and(self, other: Tvl) -> Tvl {
        match (self, other) {
            (Tvl::False, _) | (_, Tvl::False) => Tvl::False,
            (Tvl::True, Tvl::True) => Tvl::True,
            _ => Tvl::Unknown,
        }
    }

    pub fn or(self, other: Tvl) -> Tvl {
        match (self, other) {
            (Tvl::True, _) | (_, Tvl::True) => Tvl::True,
            (Tvl::False, Tvl::False) => Tvl::False,
            _ => Tvl::Unknown,
        }
    }

    pub fn collapse(self) -> bool {
        matches!(self, Tvl::True)
    }
}

/// Compare two values with null-propagation and numeric/string/uuid/bool
/// promotion rules from `spec.md` §4.1. Returns `None` when either side is
/// null (Unknown) or the types are not comparable.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    if a.is_null() || b.is_null() {
        return None;
    }
    match (&a.raw, &b.raw) {
        (Raw::Bool(x), Raw::Bool(y)) => Some(x.cmp(y)),
        (Raw::Uuid(x), Raw::Uuid(y)) => Some(x.as_bytes().cmp(y.as_bytes())),
        (Raw::Timestamp(x), Raw::Timestamp(y)) => x.partial_cmp(y),
        (Raw::String(x), Raw::String(y)) => Some(x.to_lowercase().cmp(&y.to_lowercase())),
        _ => {
            let (x, y) = (as_f64(&a.raw)?, as_f64(&b.raw)?);
            x.partial_cmp(&y)
        }
    }
}

fn as_f64(raw: &Raw) -> Option<f64> {
    match raw {
        Raw::Int(i) => Some(*i as f64),
        Raw::Double(d) => Some(*d),
        Raw::Decimal(d) => d.to_string().parse::<f64>().ok(),
        _ => None,
    }
}

/// Equality under SQL three-valued logic: null compares as Unknown, not
/// equal-or-not-equal.
pub fn eq_tvl(a: &Value, b: &Value) -> Tvl {
    if a.is_null() || b.is_null() {
        return Tvl::Unknown;
    }
    match compare(a, b) {
        Some(Ordering::Equal) => Tvl::True,
        Some(_) => Tvl::False,
        None => Tvl::Unknown,
    }
}

/// A column descriptor: logical name, output alias, join tag, declared
/// type, and optional metadata display name.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub alias: Option<String>,
    pub linked_entity_alias: Option<String>,
    pub type_tag: TypeTag,
    pub display_name: Option<String>,
}

impl Column {
    pub fn new(name: impl Into<String>, type_tag: TypeTag) -> Self {
        Column {
            name: name.into(),
            alias: None,
            linked_entity_alias: None,
            type_tag,
            display_name: None,
        }
    }

    /// The name by which this column is addressed downstream: the alias if
    /// present, else the logical name.
    pub fn output_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// Ensure output aliases are unique within one result, suffixing
/// second-and-later duplicates deterministically (`name`, `name_2`, `name_3`, ...).
pub fn dedupe_aliases(names: &[String]) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut out = Vec::with_capacity(names.len());
    for n in names {
        let key = n.to_lowercase();
        let count = seen.entry(key).or_insert(0);
        *count += 1;
        if *count == 1 {
            out.push(n.clone());
        } else {
            out.push(format!("{n}_{count}"));
        }
    }
    out
}

/// An ordered, case-insensitively addressable mapping from output column
/// name to value, plus the owning entity name used by DML to know where to
/// write. Immutable once yielded by an operator.
#[derive(Debug, Clone)]
pub struct Row {
    entries: Vec<(String, Value)>,
    index: HashMap<String, usize>,
    pub entity: String,
}

impl Row {
    pub fn new(entity: impl Into<String>) -> Self {
        Row {
            entries: Vec::new(),
            index: HashMap::new(),
            entity: entity.into(),
        }
    }

    /// Insert a column; first insertion wins on name conflict (case-insensitive).
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        let key = name.to_lowercase();
        if self.index.contains_key(&key) {
            return;
        }
        self.index.insert(key, self.entries.len());
        self.entries.push((name, value));
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.index
            .get(&name.to_lowercase())
            .map(|&i| &self.entries[i].1)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build a row from a projection's declared columns, filling missing
    /// source keys with null so the row never has fewer named columns than
    /// the projection declared.
    pub fn project(entity: impl Into<String>, names: &[String], source: &Row) -> Row {
        let mut row = Row::new(entity);
        for name in names {
            let v = source.get(name).cloned().unwrap_or_else(Value::null);
            row.insert(name.clone(), v);
        }
        row
    }

    /// A hash key over the full ordered value tuple, used by Distinct.
    pub fn value_tuple_key(&self) -> String {
        self.entries
            .iter()
            .map(|(_, v)| {
                if v.is_null() {
                    "\u{0}N".to_string()
                } else {
                    format!("\u{0}{}", v.display_text())
                }
            })
            .collect()
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}: {}", value.display_text())?;
        }
        write!(f, "}}")
    }
}
