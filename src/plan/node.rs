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
//! `PlanNode`: the tagged-variant physical operator tree. Each variant boxes
//! a variant-specific state struct from `scan`, `operators`, or `dml`;
//! traversal and execution are implemented once here via `match`.

use std::sync::Arc;

use crate::context::ExecContext;
use crate::error::EngineError;
use crate::plan::{dml, operators, scan};
use crate::script::scope::VariableScope;
use crate::value::Row;

#[derive(Debug)]
pub enum PlanNode {
    FetchXmlScan(scan::FetchXmlScanState),
    AdaptiveAggregateScan(scan::AdaptiveAggregateScanState),
    PrefetchScan(scan::PrefetchScanState),
    BackendSqlScan(scan::BackendSqlScanState),
    MetadataScan(scan::MetadataScanState),
    CountOptimized(scan::CountOptimizedState),

    ClientFilter(operators::ClientFilterState),
    Project(operators::ProjectState),
    ClientWindow(operators::ClientWindowState),
    Distinct(operators::DistinctState),
    Concatenate(operators::ConcatenateState),
    TableSpool(operators::TableSpoolState),
    IndexSpool(operators::IndexSpoolState),
    MergeAggregate(operators::MergeAggregateState),
    ParallelPartition(operators::ParallelPartitionState),
    StringSplit(operators::StringSplitState),
    OpenJson(operators::OpenJsonState),
    Merge(operators::MergeJoinState),
    SingleRow(operators::SingleRowState),

    DmlExecute(dml::DmlExecuteState),
}

impl PlanNode {
    /// Pull the next output row, or `None` at exhaustion. Cancellation is
    /// checked here so every operator in the tree observes it uniformly,
    /// on top of whatever point-specific checks a leaf scan performs.
    pub fn next_row<'a>(
        &'a mut self,
        ctx: &'a Arc<ExecContext>,
        scope: &'a VariableScope,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Option<Row>, EngineError>> + Send + 'a>> {
        Box::pin(async move {
            if ctx.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            match self {
                PlanNode::FetchXmlScan(s) => s.next_row(ctx).await,
                PlanNode::AdaptiveAggregateScan(s) => s.next_row(ctx).await,
                PlanNode::PrefetchScan(s) => s.next_row(ctx, scope).await,
                PlanNode::BackendSqlScan(s) => s.next_row(ctx).await,
                PlanNode::MetadataScan(s) => s.next_row(ctx).await,
                PlanNode::CountOptimized(s) => s.next_row(ctx, scope).await,

                PlanNode::ClientFilter(s) => s.next_row(ctx, scope).await,
                PlanNode::Project(s) => s.next_row(ctx, scope).await,
                PlanNode::ClientWindow(s) => s.next_row(ctx, scope).await,
                PlanNode::Distinct(s) => s.next_row(ctx, scope).await,
                PlanNode::Concatenate(s) => s.next_row(ctx, scope).await,
                PlanNode::TableSpool(s) => s.next_row(ctx, scope).await,
                PlanNode::IndexSpool(s) => s.next_row(ctx, scope).await,
                PlanNode::MergeAggregate(s) => s.next_row(ctx, scope).await,
                PlanNode::ParallelPartition(s) => s.next_row(ctx, scope).await,
                PlanNode::StringSplit(s) => s.next_row(ctx, scope).await,
                PlanNode::OpenJson(s) => s.next_row(ctx, scope).await,
                PlanNode::Merge(s) => s.next_row(ctx, scope).await,
                PlanNode::SingleRow(s) => s.next_row().await,

                PlanNode::DmlExecute(s) => s.next_row(ctx, scope).await,
            }
        })
    }

    /// A one-line description used by `explain_only` plans and debug logs.
    pub fn describe(&self) -> String {
        match self {
            PlanNode::FetchXmlScan(s) => format!("FetchXmlScan(auto_page={})", s.auto_page),
            PlanNode::AdaptiveAggregateScan(s) => format!("AdaptiveAggregateScan(depth={})", s.depth),
            PlanNode::PrefetchScan(_) => "PrefetchScan".to_string(),
            PlanNode::BackendSqlScan(s) => format!("BackendSqlScan({})", s.sql),
            PlanNode::MetadataScan(s) => format!("MetadataScan({})", s.table),
            PlanNode::CountOptimized(s) => format!("CountOptimized({})", s.entity),

            PlanNode::ClientFilter(_) => "ClientFilter".to_string(),
            PlanNode::Project(s) => format!("Project({} cols)", s.columns.len()),
            PlanNode::ClientWindow(s) => format!("ClientWindow({:?})", s.func),
            PlanNode::Distinct(_) => "Distinct".to_string(),
            PlanNode::Concatenate(s) => format!("Concatenate({} children)", s.children.len()),
            PlanNode::TableSpool(_) => "TableSpool".to_string(),
            PlanNode::IndexSpool(s) => format!("IndexSpool(key={})", s.key_column),
            PlanNode::MergeAggregate(s) => format!("MergeAggregate({} children)", s.children.len()),
            PlanNode::ParallelPartition(s) => format!("ParallelPartition(n={})", s.partitions.len()),
            PlanNode::StringSplit(_) => "StringSplit".to_string(),
            PlanNode::OpenJson(_) => "OpenJson".to_string(),
            PlanNode::Merge(s) => format!("Merge({:?} on {}={})", s.join_type, s.left_key, s.right_key),
            PlanNode::SingleRow(_) => "SingleRow".to_string(),

            PlanNode::DmlExecute(s) => format!("DmlExecute({})", s.entity),
        }
    }

    /// The immediate children of this node, for plan traversal and
    /// `explain_only` rendering.
    pub fn children(&self) -> Vec<&PlanNode> {
        match self {
            PlanNode::FetchXmlScan(_)
            | PlanNode::BackendSqlScan(_)
            | PlanNode::MetadataScan(_)
            | PlanNode::SingleRow(_) => Vec::new(),
            // The adaptive scan's binary split is discovered lazily during
            // execution (on AggregateOverflow), not present in the static tree.
            PlanNode::AdaptiveAggregateScan(_) => Vec::new(),
            PlanNode::PrefetchScan(s) => vec![s.child.as_ref()],
            PlanNode::CountOptimized(s) => vec![s.fallback.as_ref()],

            PlanNode::ClientFilter(s) => vec![s.child.as_ref()],
            PlanNode::Project(s) => vec![s.child.as_ref()],
            PlanNode::ClientWindow(s) => vec![s.child.as_ref()],
            PlanNode::Distinct(s) => vec![s.child.as_ref()],
            PlanNode::Concatenate(s) => s.children.iter().map(|c| c.as_ref()).collect(),
            PlanNode::TableSpool(s) => vec![s.child.as_ref()],
            PlanNode::IndexSpool(s) => vec![s.child.as_ref()],
            PlanNode::MergeAggregate(s) => s.children.iter().map(|c| c.as_ref()).collect(),
            PlanNode::ParallelPartition(s) => s.partitions.iter().collect(),
            PlanNode::StringSplit(s) => vec![s.child.as_ref()],
            PlanNode::OpenJson(s) => vec![s.child.as_ref()],
            PlanNode::Merge(s) => vec![s.left.as_ref(), s.right.as_ref()],

            PlanNode::DmlExecute(s) => vec![s.driving.as_ref()],
        }
    }

    /// A coarse row-count estimate for logging/statistics, when the plan
    /// carries one; most operators have no better estimate than "unknown".
    pub fn estimated_rows(&self) -> Option<u64> {
        match self {
            PlanNode::CountOptimized(_) => Some(1),
            PlanNode::DmlExecute(_) => Some(1),
            _ => None,
        }
    }
}
