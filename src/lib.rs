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
//! SQL front end and execution engine for a FetchXML-backed CRM record
//! service. A `sqlparser` parse tree is planned into a `PlanNode` operator
//! tree (`planner`), compiled scalar/predicate expressions are evaluated
//! lazily per row (`expr`), and a pull-based executor drives the tree to
//! completion against a set of backend collaborators (`collaborators`)
//! threaded through an `ExecContext`.
//!
//! T-SQL-style scripts (`DECLARE`/`IF`/`WHILE`/cursors/`TRY CATCH`) are
//! lowered by the host into this crate's own `ScriptStatement` tree and run
//! by `script::execute_script`, since `sqlparser` carries no AST for them.

pub mod collaborators;
pub mod context;
pub mod error;
pub mod expr;
pub mod options;
pub mod plan;
pub mod planner;
pub mod script;
pub mod value;

pub use collaborators::{
    ConnectionHandle, ConnectionPool, FetchPage, FetchXmlClient, MetadataClient,
    NullProgressReporter, ProgressReporter, RecordWriteClient, SqlClient, ThrottleTracker,
    Transpiler, WriteOutcome,
};
pub use context::{ExecContext, PagingStats, ScriptRuntime, Statistics};
pub use error::{EngineError, Result};
pub use options::PlannerOptions;
pub use plan::PlanNode;
pub use planner::plan_statement;
pub use script::scope::VariableScope;
pub use script::{execute_script, QueryOutput, ScriptStatement};
pub use value::{Column, Row, Tvl, TypeTag, Value};
