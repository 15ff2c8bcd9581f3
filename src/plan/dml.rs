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
//! DML operators: INSERT/UPDATE/DELETE/MERGE, all driven by a child plan
//! whose rows supply record identity and SET-clause inputs (`spec.md` §4.5).

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::{with_transient_retry, ExecContext};
use crate::error::EngineError;
use crate::expr::CompiledExpr;
use crate::plan::node::PlanNode;
use crate::script::scope::VariableScope;
use crate::value::{Row, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmlAction {
    Insert,
    Update,
    Delete,
}

/// Per-row write dispatch. `Merge` decides the action per driving row based
/// on whether the ON-columns matched an existing target record; `Insert`
/// and `Update`/`Delete` are fixed for every row.
#[derive(Debug)]
pub enum DmlMode {
    Insert {
        /// target column -> compiled value expression (INSERT VALUES), empty
        /// when driven purely by ordinal projection (INSERT … SELECT).
        columns: Vec<(String, CompiledExpr)>,
    },
    Update {
        id_column: String,
        set: Vec<(String, CompiledExpr)>,
    },
    Delete {
        id_column: String,
    },
    Merge {
        id_column: String,
        match_column: String,
        update_set: Vec<(String, CompiledExpr)>,
        insert_columns: Vec<(String, CompiledExpr)>,
        delete_on_no_source: bool,
    },
}

/// Executes one backend write per driving row, enforcing the row cap before
/// any write and tallying per-record failures when continue-on-error is set.
#[derive(Debug)]
pub struct DmlExecuteState {
    pub driving: Box<PlanNode>,
    pub entity: String,
    pub mode: DmlMode,
    pub row_cap: Option<u64>,
    pub continue_on_error: bool,
    done: bool,
}

pub struct DmlSummary {
    pub action: &'static str,
    pub inserted_count: u64,
    pub updated_count: u64,
    pub deleted_count: u64,
    pub source_count: u64,
    pub errors: u64,
}

impl DmlExecuteState {
    pub fn new(driving: PlanNode, entity: String, mode: DmlMode, row_cap: Option<u64>, continue_on_error: bool) -> Self {
        DmlExecuteState {
            driving: Box::new(driving),
            entity,
            mode,
            row_cap,
            continue_on_error,
            done: false,
        }
    }

    pub async fn next_row(&mut self, ctx: &Arc<ExecContext>, scope: &VariableScope) -> Result<Option<Row>, EngineError> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        let summary = self.run(ctx, scope).await?;
        Ok(Some(summary_row(&self.entity, &summary)))
    }

    async fn run(&mut self, ctx: &Arc<ExecContext>, scope: &VariableScope) -> Result<DmlSummary, EngineError> {
        let mut driving_rows = Vec::new();
        while let Some(row) = self.driving.next_row(ctx, scope).await? {
            driving_rows.push(row);
            if let Some(cap) = self.row_cap {
                if driving_rows.len() as u64 > cap {
                    return Err(EngineError::RowCapExceeded { cap });
                }
            }
        }

        let mut summary = DmlSummary {
            action: action_name(&self.mode),
            inserted_count: 0,
            updated_count: 0,
            deleted_count: 0,
            source_count: driving_rows.len() as u64,
            errors: 0,
        };

        for (index, row) in driving_rows.iter().enumerate() {
            let result = self.write_one(ctx, scope, row).await;
            match result {
                Ok(action) => match action {
                    DmlAction::Insert => summary.inserted_count += 1,
                    DmlAction::Update => summary.updated_count += 1,
                    DmlAction::Delete => summary.deleted_count += 1,
                },
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    summary.errors += 1;
                    if !self.continue_on_error {
                        return Err(EngineError::DmlPerRecord {
                            index,
                            code: e.code().to_string(),
                            message: e.to_string(),
                        });
                    }
                }
            }
        }
        Ok(summary)
    }

    async fn write_one(&self, ctx: &Arc<ExecContext>, scope: &VariableScope, row: &Row) -> Result<DmlAction, EngineError> {
        match &self.mode {
            DmlMode::Insert { columns } => {
                let values = eval_columns(columns, row, scope)?;
                with_transient_retry(ctx, || ctx.write_client.create(&self.entity, &values, &ctx.cancel)).await?;
                Ok(DmlAction::Insert)
            }
            DmlMode::Update { id_column, set } => {
                let id = record_id(row, id_column)?;
                let values = eval_columns(set, row, scope)?;
                with_transient_retry(ctx, || ctx.write_client.update(&self.entity, id, &values, &ctx.cancel)).await?;
                Ok(DmlAction::Update)
            }
            DmlMode::Delete { id_column } => {
                let id = record_id(row, id_column)?;
                with_transient_retry(ctx, || ctx.write_client.delete(&self.entity, id, &ctx.cancel)).await?;
                Ok(DmlAction::Delete)
            }
            DmlMode::Merge {
                id_column,
                match_column,
                update_set,
                insert_columns,
                delete_on_no_source,
            } => {
                let matched = row.get(match_column).map(|v| !v.is_null()).unwrap_or(false);
                if matched {
                    let id = record_id(row, id_column)?;
                    if *delete_on_no_source {
                        with_transient_retry(ctx, || ctx.write_client.delete(&self.entity, id, &ctx.cancel)).await?;
                        Ok(DmlAction::Delete)
                    } else {
                        let values = eval_columns(update_set, row, scope)?;
                        with_transient_retry(ctx, || ctx.write_client.update(&self.entity, id, &values, &ctx.cancel)).await?;
                        Ok(DmlAction::Update)
                    }
                } else {
                    let values = eval_columns(insert_columns, row, scope)?;
                    with_transient_retry(ctx, || ctx.write_client.create(&self.entity, &values, &ctx.cancel)).await?;
                    Ok(DmlAction::Insert)
                }
            }
        }
    }
}

fn eval_columns(columns: &[(String, CompiledExpr)], row: &Row, scope: &VariableScope) -> Result<HashMap<String, Value>, EngineError> {
    columns
        .iter()
        .map(|(name, expr)| Ok((name.clone(), expr.eval(row, scope)?)))
        .collect()
}

fn record_id(row: &Row, id_column: &str) -> Result<uuid::Uuid, EngineError> {
    let v = row
        .get(id_column)
        .ok_or_else(|| EngineError::Validation(format!("driving row missing identity column {id_column}")))?;
    match &v.raw {
        crate::value::Raw::Uuid(id) => Ok(*id),
        _ => uuid::Uuid::parse_str(&v.display_text())
            .map_err(|_| EngineError::Validation(format!("{id_column} is not a valid record id"))),
    }
}

fn action_name(mode: &DmlMode) -> &'static str {
    match mode {
        DmlMode::Insert { .. } => "insert",
        DmlMode::Update { .. } => "update",
        DmlMode::Delete { .. } => "delete",
        DmlMode::Merge { .. } => "merge",
    }
}

fn summary_row(entity: &str, summary: &DmlSummary) -> Row {
    let mut row = Row::new(entity.to_string());
    row.insert("$action", Value::string(summary.action));
    row.insert("inserted_count", Value::int(summary.inserted_count as i64));
    row.insert("updated_count", Value::int(summary.updated_count as i64));
    row.insert("deleted_count", Value::int(summary.deleted_count as i64));
    row.insert("source_count", Value::int(summary.source_count as i64));
    row.insert("errors", Value::int(summary.errors as i64));
    row
}
