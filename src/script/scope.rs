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
//! Per-script variable scope and cursor table, per `spec.md` §3/§4.6.
//!
//! Scope is flat within one script execution: IF/WHILE/TRY bodies share the
//! enclosing scope rather than opening nested lexical scopes. Error
//! variables (`@@ERROR_MESSAGE` etc.) are declared on demand by CATCH.

use std::collections::HashMap;

use crate::error::EngineError;
use crate::plan::node::PlanNode;
use crate::value::{TypeTag, Value};

/// Name → (declared type, current value).
#[derive(Default)]
pub struct VariableScope {
    vars: HashMap<String, (TypeTag, Value)>,
    cursors: HashMap<String, CursorState>,
}

fn key(name: &str) -> String {
    name.trim_start_matches('@').to_lowercase()
}

impl VariableScope {
    pub fn new() -> Self {
        VariableScope::default()
    }

    pub fn declare(&mut self, name: &str, type_tag: TypeTag, initial: Option<Value>) {
        let v = initial.unwrap_or_else(Value::null);
        self.vars.insert(key(name), (type_tag, v));
    }

    pub fn set(&mut self, name: &str, value: Value) -> Result<(), EngineError> {
        let k = key(name);
        match self.vars.get_mut(&k) {
            Some(entry) => {
                entry.1 = value;
                Ok(())
            }
            None => {
                // SET on an undeclared error variable implicitly declares it
                // (the catch handler's case); any other undeclared SET is a
                // validation error.
                if k.starts_with("error_") {
                    self.vars.insert(k, (TypeTag::String, value));
                    Ok(())
                } else {
                    Err(EngineError::Validation(format!(
                        "variable @{name} is not declared"
                    )))
                }
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(&key(name)).map(|(_, v)| v)
    }

    pub fn type_of(&self, name: &str) -> Option<TypeTag> {
        self.vars.get(&key(name)).map(|(t, _)| *t)
    }

    /// A read-only copy of just the variable bindings, for handing to a
    /// concurrently-spawned partition — cursors are not snapshotted since
    /// parallel partitions never open their own cursors.
    pub fn snapshot(&self) -> VariableScope {
        VariableScope {
            vars: self.vars.clone(),
            cursors: HashMap::new(),
        }
    }

    /// Populate the four @@ERROR_* variables from a caught error, per
    /// `spec.md` §4.6/§7. These are declared here the first time a TRY/CATCH
    /// fires, and (per the Open Question in `spec.md` §9, resolved in
    /// DESIGN.md) persist as ordinary variables thereafter — they are not
    /// reset outside of a subsequent CATCH.
    pub fn record_error(&mut self, err: &EngineError) {
        self.declare(
            "@@ERROR_MESSAGE",
            TypeTag::String,
            Some(Value::string(err.to_string())),
        );
        self.declare(
            "@@ERROR_NUMBER",
            TypeTag::Integer,
            Some(Value::int(error_number(err))),
        );
        self.declare(
            "@@ERROR_SEVERITY",
            TypeTag::Integer,
            Some(Value::int(16)),
        );
        self.declare(
            "@@ERROR_STATE",
            TypeTag::Integer,
            Some(Value::int(1)),
        );
    }

    pub fn clear_errors(&mut self) {
        self.declare("@@ERROR_MESSAGE", TypeTag::String, Some(Value::null()));
        self.declare("@@ERROR_NUMBER", TypeTag::Integer, Some(Value::int(0)));
        self.declare("@@ERROR_SEVERITY", TypeTag::Integer, Some(Value::int(0)));
        self.declare("@@ERROR_STATE", TypeTag::Integer, Some(Value::int(0)));
    }

    pub fn set_fetch_status(&mut self, status: i64) {
        self.declare("@@FETCH_STATUS", TypeTag::Integer, Some(Value::int(status)));
    }

    // --- cursors --------------------------------------------------------

    pub fn declare_cursor(&mut self, name: &str, plan: PlanNode) -> Result<(), EngineError> {
        let k = key(name);
        if self.cursors.contains_key(&k) {
            return Err(EngineError::SessionAlreadyExists(name.to_string()));
        }
        self.cursors.insert(
            k,
            CursorState {
                plan,
                rows: Vec::new(),
                columns: Vec::new(),
                position: -1,
                open: false,
            },
        );
        Ok(())
    }

    pub fn cursor(&self, name: &str) -> Result<&CursorState, EngineError> {
        self.cursors
            .get(&key(name))
            .ok_or_else(|| EngineError::SessionNotFound(name.to_string()))
    }

    pub fn cursor_mut(&mut self, name: &str) -> Result<&mut CursorState, EngineError> {
        self.cursors
            .get_mut(&key(name))
            .ok_or_else(|| EngineError::SessionNotFound(name.to_string()))
    }

    pub fn deallocate_cursor(&mut self, name: &str) -> Result<(), EngineError> {
        self.cursors
            .remove(&key(name))
            .map(|_| ())
            .ok_or_else(|| EngineError::SessionNotFound(name.to_string()))
    }
}

fn error_number(err: &EngineError) -> i64 {
    // Stable, arbitrary but deterministic per error kind — callers match on
    // `code()` for anything that needs real discrimination.
    let mut n: i64 = 50000;
    for b in err.code().bytes() {
        n = n.wrapping_mul(31).wrapping_add(b as i64);
    }
    n.abs() % 100000
}

/// Per-cursor state: the child plan, materialized rows, current 0-based
/// position (−1 before first fetch), and an open flag.
pub struct CursorState {
    pub plan: PlanNode,
    pub rows: Vec<crate::value::Row>,
    pub columns: Vec<crate::value::Column>,
    pub position: i64,
    pub open: bool,
}

impl CursorState {
    pub fn fetch_next(&mut self) -> Option<&crate::value::Row> {
        if !self.open {
            return None;
        }
        let next = self.position + 1;
        if (next as usize) < self.rows.len() {
            self.position = next;
            Some(&self.rows[next as usize])
        } else {
            self.position = self.rows.len() as i64;
            None
        }
    }
}
