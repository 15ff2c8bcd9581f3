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
//! Script execution: sequential statement list over a shared variable
//! scope, per `spec.md` §4.6. `sqlparser` has no AST for T-SQL-style
//! control flow, so the planner lowers a parsed script into this crate's
//! own `ScriptStatement` tree before the executor walks it.

pub mod scope;

use std::sync::Arc;

use crate::context::{ExecContext, ScriptRuntime};
use crate::error::EngineError;
use crate::expr::{CompiledExpr, CompiledPredicate};
use crate::options::DEFAULT_WHILE_ITERATION_CAP;
use crate::plan::PlanNode;
use crate::value::{Column, Row, TypeTag, Value};

/// One row-producing result: the last statement to yield rows wins, per
/// the script executor's "last rowset" output rule.
#[derive(Debug)]
pub struct QueryOutput {
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
}

pub enum ScriptStatement {
    Declare {
        name: String,
        type_tag: TypeTag,
        initial: Option<CompiledExpr>,
    },
    Set {
        name: String,
        expr: CompiledExpr,
    },
    Query(PlanNode),
    If {
        condition: CompiledPredicate,
        then_body: Vec<ScriptStatement>,
        else_body: Option<Vec<ScriptStatement>>,
    },
    While {
        condition: CompiledPredicate,
        body: Vec<ScriptStatement>,
    },
    Block(Vec<ScriptStatement>),
    TryCatch {
        try_body: Vec<ScriptStatement>,
        catch_body: Vec<ScriptStatement>,
    },
    DeclareCursor {
        name: String,
        plan: PlanNode,
    },
    OpenCursor(String),
    FetchNext {
        cursor: String,
        targets: Vec<String>,
    },
    CloseCursor(String),
    DeallocateCursor(String),
    ExecuteAs(String),
    Revert,
    Exec {
        message: String,
        params: Vec<(String, CompiledExpr)>,
    },
}

/// Runs a statement list against the runtime's shared scope, returning the
/// rowset of the last row-producing statement (`Query`, `FETCH NEXT`, or
/// `EXEC`), if any.
pub async fn execute_script(
    runtime: &mut ScriptRuntime,
    statements: &mut [ScriptStatement],
) -> Result<Option<QueryOutput>, EngineError> {
    let mut last = None;
    for stmt in statements {
        if let Some(output) = execute_one(runtime, stmt).await? {
            last = Some(output);
        }
    }
    Ok(last)
}

async fn execute_one(
    runtime: &mut ScriptRuntime,
    stmt: &mut ScriptStatement,
) -> Result<Option<QueryOutput>, EngineError> {
    match stmt {
        ScriptStatement::Declare { name, type_tag, initial } => {
            let value = match initial {
                Some(expr) => Some(expr.eval(&Row::new("script"), &runtime.scope)?),
                None => None,
            };
            runtime.scope.declare(name, *type_tag, value);
            Ok(None)
        }
        ScriptStatement::Set { name, expr } => {
            let value = expr.eval(&Row::new("script"), &runtime.scope)?;
            runtime.scope.set(name, value)?;
            Ok(None)
        }
        ScriptStatement::Query(plan) => {
            let output = run_to_completion(&runtime.exec, &runtime.scope, plan).await?;
            Ok(Some(output))
        }
        ScriptStatement::If { condition, then_body, else_body } => {
            let row = Row::new("script");
            if condition.eval_bool(&row, &runtime.scope)? {
                Box::pin(execute_script_last(runtime, then_body)).await
            } else if let Some(body) = else_body {
                Box::pin(execute_script_last(runtime, body)).await
            } else {
                Ok(None)
            }
        }
        ScriptStatement::While { condition, body } => {
            let mut last = None;
            let mut iterations = 0u64;
            loop {
                let row = Row::new("script");
                if !condition.eval_bool(&row, &runtime.scope)? {
                    break;
                }
                iterations += 1;
                if iterations > DEFAULT_WHILE_ITERATION_CAP {
                    return Err(EngineError::InfiniteLoopSuspected);
                }
                if let Some(output) = Box::pin(execute_script_last(runtime, body)).await? {
                    last = Some(output);
                }
                if runtime.exec.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
            }
            Ok(last)
        }
        ScriptStatement::Block(body) => Box::pin(execute_script_last(runtime, body)).await,
        ScriptStatement::TryCatch { try_body, catch_body } => {
            match Box::pin(execute_script_last(runtime, try_body)).await {
                Ok(output) => Ok(output),
                Err(e) if e.is_cancellation() => Err(e),
                Err(e) => {
                    runtime.scope.record_error(&e);
                    Box::pin(execute_script_last(runtime, catch_body)).await
                }
            }
        }
        ScriptStatement::DeclareCursor { name, plan } => {
            let plan = std::mem::replace(plan, empty_plan());
            runtime.scope.declare_cursor(name, plan)?;
            Ok(None)
        }
        ScriptStatement::OpenCursor(name) => {
            let mut plan = {
                let cursor = runtime.scope.cursor_mut(name)?;
                std::mem::replace(&mut cursor.plan, empty_plan())
            };
            let mut rows = Vec::new();
            while let Some(row) = plan.next_row(&runtime.exec, &runtime.scope).await? {
                rows.push(row);
            }
            let cursor = runtime.scope.cursor_mut(name)?;
            cursor.plan = plan;
            cursor.columns = crate::plan::operators::columns_from_rows(&rows);
            cursor.rows = rows;
            cursor.position = -1;
            cursor.open = true;
            Ok(None)
        }
        ScriptStatement::FetchNext { cursor, targets } => {
            let cur = runtime.scope.cursor_mut(cursor)?;
            let fetched = cur.fetch_next().cloned();
            match fetched {
                Some(row) => {
                    for (i, target) in targets.iter().enumerate() {
                        let value = row
                            .columns()
                            .nth(i)
                            .and_then(|c| row.get(c))
                            .cloned()
                            .unwrap_or_else(Value::null);
                        runtime.scope.set(target, value)?;
                    }
                    runtime.scope.set_fetch_status(0);
                }
                None => runtime.scope.set_fetch_status(-1),
            }
            Ok(None)
        }
        ScriptStatement::CloseCursor(name) => {
            let cursor = runtime.scope.cursor_mut(name)?;
            cursor.open = false;
            cursor.position = -1;
            Ok(None)
        }
        ScriptStatement::DeallocateCursor(name) => {
            runtime.scope.deallocate_cursor(name)?;
            Ok(None)
        }
        ScriptStatement::ExecuteAs(principal) => {
            runtime.exec.set_principal(Some(ExecContext::resolve_principal_placeholder(principal)));
            Ok(None)
        }
        ScriptStatement::Revert => {
            runtime.exec.set_principal(None);
            Ok(None)
        }
        ScriptStatement::Exec { message, params } => {
            let mut row = Row::new("message");
            row.insert("message", Value::string(message.clone()));
            for (name, expr) in params.iter() {
                let value = expr.eval(&Row::new("script"), &runtime.scope)?;
                row.insert(name.clone(), value);
            }
            row.insert("status", Value::string("not_wired"));
            let columns = crate::plan::operators::columns_from_rows(std::slice::from_ref(&row));
            Ok(Some(QueryOutput { columns, rows: vec![row] }))
        }
    }
}

fn execute_script_last<'a>(
    runtime: &'a mut ScriptRuntime,
    statements: &'a mut [ScriptStatement],
) -> impl std::future::Future<Output = Result<Option<QueryOutput>, EngineError>> + 'a {
    execute_script(runtime, statements)
}

async fn run_to_completion(
    exec: &Arc<ExecContext>,
    scope: &crate::script::scope::VariableScope,
    plan: &mut PlanNode,
) -> Result<QueryOutput, EngineError> {
    let mut rows = Vec::new();
    while let Some(row) = plan.next_row(exec, scope).await? {
        rows.push(row);
    }
    let columns = crate::plan::operators::columns_from_rows(&rows);
    Ok(QueryOutput { columns, rows })
}

/// A harmless placeholder plan swapped in while a cursor's real plan is
/// temporarily taken out for execution (`mem::replace` needs a value to
/// leave behind).
fn empty_plan() -> PlanNode {
    PlanNode::Concatenate(crate::plan::operators::ConcatenateState::new(Vec::new()))
}
