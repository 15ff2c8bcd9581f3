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
//! Client-side operators: everything that reshapes rows already pulled from
//! a scan, per `spec.md` §3.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::context::ExecContext;
use crate::error::EngineError;
use crate::expr::{CompiledExpr, CompiledPredicate};
use crate::plan::node::PlanNode;
use crate::script::scope::VariableScope;
use crate::value::{compare, Column, Row, Value};

/// Evaluates a predicate over the child's rows, collapsing Unknown to false
/// at this WHERE/HAVING boundary.
pub struct ClientFilterState {
    pub child: Box<PlanNode>,
    pub predicate: CompiledPredicate,
}

impl ClientFilterState {
    pub async fn next_row(&mut self, ctx: &Arc<ExecContext>, scope: &VariableScope) -> Result<Option<Row>, EngineError> {
        loop {
            match self.child.next_row(ctx, scope).await? {
                Some(row) => {
                    if self.predicate.eval_bool(&row, scope)? {
                        return Ok(Some(row));
                    }
                }
                None => return Ok(None),
            }
        }
    }
}

/// Computes the output column list, including computed expressions.
pub struct ProjectState {
    pub child: Box<PlanNode>,
    pub columns: Vec<(String, CompiledExpr)>,
    pub entity: String,
}

impl ProjectState {
    pub async fn next_row(&mut self, ctx: &Arc<ExecContext>, scope: &VariableScope) -> Result<Option<Row>, EngineError> {
        match self.child.next_row(ctx, scope).await? {
            Some(source) => {
                let mut row = Row::new(self.entity.clone());
                for (name, expr) in &self.columns {
                    row.insert(name.clone(), expr.eval(&source, scope)?);
                }
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }
}

/// Spools the full child result before serving rows, as the common base for
/// window functions, distinct, and ordered merges (`spec.md` §3.3).
async fn materialize(
    child: &mut PlanNode,
    ctx: &Arc<ExecContext>,
    scope: &VariableScope,
) -> Result<Vec<Row>, EngineError> {
    let mut rows = Vec::new();
    while let Some(row) = child.next_row(ctx, scope).await? {
        if ctx.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        rows.push(row);
    }
    Ok(rows)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowFunc {
    RowNumber,
    Rank,
    DenseRank,
    CumeDist,
    PercentRank,
    Ntile(i64),
    Lag(i64),
    Lead(i64),
    FirstValue,
    LastValue,
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

#[derive(Clone, Copy)]
pub enum FrameBound {
    UnboundedPreceding,
    Preceding(i64),
    CurrentRow,
    Following(i64),
    UnboundedFollowing,
}

pub struct WindowSpec {
    pub partition_by: Vec<String>,
    pub order_by: Vec<(String, bool)>,
    pub frame: Option<(FrameBound, FrameBound)>,
}

/// Materializes the child, partitions and sorts it, then evaluates one
/// window function per output row in a single spooled pass (`spec.md` §3.3).
pub struct ClientWindowState {
    pub child: Box<PlanNode>,
    pub output_column: String,
    pub func: WindowFunc,
    pub target_column: Option<String>,
    pub spec: WindowSpec,
    spooled: Option<VecDeque<Row>>,
}

impl ClientWindowState {
    pub fn new(child: PlanNode, output_column: String, func: WindowFunc, target_column: Option<String>, spec: WindowSpec) -> Self {
        ClientWindowState {
            child: Box::new(child),
            output_column,
            func,
            target_column,
            spec,
            spooled: None,
        }
    }

    pub async fn next_row(&mut self, ctx: &Arc<ExecContext>, scope: &VariableScope) -> Result<Option<Row>, EngineError> {
        if self.spooled.is_none() {
            let mut rows = materialize(&mut self.child, ctx, scope).await?;
            self.apply_window(&mut rows)?;
            self.spooled = Some(rows.into());
        }
        Ok(self.spooled.as_mut().unwrap().pop_front())
    }

    fn apply_window(&self, rows: &mut [Row]) -> Result<(), EngineError> {
        // Group indices by partition key, preserving arrival order within a group.
        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for (i, row) in rows.iter().enumerate() {
            let key = self.spec.partition_by.iter().map(|c| row.get(c).map(|v| v.display_text()).unwrap_or_default()).collect::<Vec<_>>().join("\u{0}");
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push(i);
        }

        let results: Vec<(usize, Value)> = order
            .into_iter()
            .flat_map(|key| {
                let mut idxs = groups.remove(&key).unwrap();
                idxs.sort_by(|&a, &b| self.order_cmp(rows, a, b));
                self.evaluate_partition(rows, &idxs)
            })
            .collect();

        for (i, v) in results {
            rows[i].insert(self.output_column.clone(), v);
        }
        Ok(())
    }

    fn order_cmp(&self, rows: &[Row], a: usize, b: usize) -> std::cmp::Ordering {
        for (col, desc) in &self.spec.order_by {
            let av = rows[a].get(col);
            let bv = rows[b].get(col);
            let ord = match (av, bv) {
                (Some(x), Some(y)) => compare(x, y).unwrap_or(std::cmp::Ordering::Equal),
                (None, None) => std::cmp::Ordering::Equal,
                (None, Some(_)) => std::cmp::Ordering::Less,
                (Some(_), None) => std::cmp::Ordering::Greater,
            };
            let ord = if *desc { ord.reverse() } else { ord };
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        std::cmp::Ordering::Equal
    }

    fn evaluate_partition(&self, rows: &[Row], idxs: &[usize]) -> Vec<(usize, Value)> {
        let n = idxs.len() as i64;
        match self.func {
            WindowFunc::RowNumber => idxs.iter().enumerate().map(|(pos, &i)| (i, Value::int(pos as i64 + 1))).collect(),
            WindowFunc::Rank | WindowFunc::DenseRank => {
                let mut out = Vec::with_capacity(idxs.len());
                let mut rank = 1i64;
                let mut dense = 1i64;
                for (pos, &i) in idxs.iter().enumerate() {
                    if pos > 0 && self.order_cmp(rows, idxs[pos - 1], i) != std::cmp::Ordering::Equal {
                        rank = pos as i64 + 1;
                        dense += 1;
                    }
                    let v = if self.func == WindowFunc::Rank { rank } else { dense };
                    out.push((i, Value::int(v)));
                }
                out
            }
            WindowFunc::CumeDist => idxs.iter().enumerate().map(|(pos, &i)| (i, Value::double((pos as f64 + 1.0) / n as f64))).collect(),
            WindowFunc::PercentRank => idxs.iter().enumerate().map(|(pos, &i)| {
                let v = if n <= 1 { 0.0 } else { pos as f64 / (n - 1) as f64 };
                (i, Value::double(v))
            }).collect(),
            WindowFunc::Ntile(buckets) => {
                let buckets = buckets.max(1);
                let base = n / buckets;
                let extra = n % buckets;
                let mut out = Vec::with_capacity(idxs.len());
                let mut pos = 0i64;
                for b in 1..=buckets {
                    let size = base + if b <= extra { 1 } else { 0 };
                    for _ in 0..size {
                        if pos as usize >= idxs.len() {
                            break;
                        }
                        out.push((idxs[pos as usize], Value::int(b)));
                        pos += 1;
                    }
                }
                out
            }
            WindowFunc::Lag(offset) | WindowFunc::Lead(offset) => {
                let sign = if matches!(self.func, WindowFunc::Lag(_)) { -1 } else { 1 };
                let col = self.target_column.as_deref().unwrap_or_default();
                idxs.iter().enumerate().map(|(pos, &i)| {
                    let target = pos as i64 + sign * offset;
                    let v = if target >= 0 && (target as usize) < idxs.len() {
                        rows[idxs[target as usize]].get(col).cloned().unwrap_or_else(Value::null)
                    } else {
                        Value::null()
                    };
                    (i, v)
                }).collect()
            }
            WindowFunc::FirstValue => {
                let col = self.target_column.as_deref().unwrap_or_default();
                let first = idxs.first().and_then(|&i| rows[i].get(col).cloned()).unwrap_or_else(Value::null);
                idxs.iter().map(|&i| (i, first.clone())).collect()
            }
            WindowFunc::LastValue => {
                let col = self.target_column.as_deref().unwrap_or_default();
                idxs.iter().enumerate().map(|(pos, &i)| {
                    let bound = self.frame_end(pos, idxs.len());
                    let v = rows[idxs[bound]].get(col).cloned().unwrap_or_else(Value::null);
                    (i, v)
                }).collect()
            }
            WindowFunc::Sum | WindowFunc::Avg | WindowFunc::Min | WindowFunc::Max | WindowFunc::Count => {
                let col = self.target_column.as_deref();
                idxs.iter().enumerate().map(|(pos, &i)| {
                    let (lo, hi) = self.frame_bounds(pos, idxs.len());
                    let window = &idxs[lo..=hi];
                    (i, self.aggregate(rows, window, col))
                }).collect()
            }
        }
    }

    fn frame_end(&self, pos: usize, len: usize) -> usize {
        self.frame_bounds(pos, len).1
    }

    /// Resolve the frame to a clamped `[lo, hi]` index range within the
    /// partition, defaulting to RANGE UNBOUNDED PRECEDING..CURRENT ROW.
    fn frame_bounds(&self, pos: usize, len: usize) -> (usize, usize) {
        let Some((start, end)) = &self.spec.frame else {
            return (0, pos);
        };
        let lo = match start {
            FrameBound::UnboundedPreceding => 0,
            FrameBound::Preceding(n) => pos.saturating_sub(*n as usize),
            FrameBound::CurrentRow => pos,
            FrameBound::Following(n) => (pos + *n as usize).min(len.saturating_sub(1)),
            FrameBound::UnboundedFollowing => len.saturating_sub(1),
        };
        let hi = match end {
            FrameBound::UnboundedPreceding => 0,
            FrameBound::Preceding(n) => pos.saturating_sub(*n as usize),
            FrameBound::CurrentRow => pos,
            FrameBound::Following(n) => (pos + *n as usize).min(len.saturating_sub(1)),
            FrameBound::UnboundedFollowing => len.saturating_sub(1),
        };
        (lo.min(hi), hi.max(lo).min(len.saturating_sub(1)))
    }

    fn aggregate(&self, rows: &[Row], window: &[usize], col: Option<&str>) -> Value {
        if matches!(self.func, WindowFunc::Count) && col.is_none() {
            return Value::int(window.len() as i64);
        }
        let col = col.unwrap_or_default();
        let values: Vec<f64> = window
            .iter()
            .filter_map(|&i| rows[i].get(col))
            .filter(|v| !v.is_null())
            .filter_map(|v| v.display_text().parse::<f64>().ok())
            .collect();
        match self.func {
            WindowFunc::Count => Value::int(values.len() as i64),
            WindowFunc::Sum => Value::double(values.iter().sum()),
            WindowFunc::Avg => {
                if values.is_empty() {
                    Value::null()
                } else {
                    Value::double(values.iter().sum::<f64>() / values.len() as f64)
                }
            }
            WindowFunc::Min => values.into_iter().fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.min(v)))).map(Value::double).unwrap_or_else(Value::null),
            WindowFunc::Max => values.into_iter().fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.max(v)))).map(Value::double).unwrap_or_else(Value::null),
            _ => Value::null(),
        }
    }
}

/// Deduplicates on the full output value tuple (`spec.md` §3.4).
pub struct DistinctState {
    pub child: Box<PlanNode>,
    seen: HashSet<String>,
}

impl DistinctState {
    pub fn new(child: PlanNode) -> Self {
        DistinctState { child: Box::new(child), seen: HashSet::new() }
    }

    pub async fn next_row(&mut self, ctx: &Arc<ExecContext>, scope: &VariableScope) -> Result<Option<Row>, EngineError> {
        loop {
            match self.child.next_row(ctx, scope).await? {
                Some(row) => {
                    let key = row.value_tuple_key();
                    if self.seen.insert(key) {
                        return Ok(Some(row));
                    }
                }
                None => return Ok(None),
            }
        }
    }
}

/// UNION ALL across heterogeneous children with an already-validated common
/// arity (`spec.md` §3.5).
pub struct ConcatenateState {
    pub children: Vec<Box<PlanNode>>,
    active: usize,
}

impl ConcatenateState {
    pub fn new(children: Vec<PlanNode>) -> Self {
        ConcatenateState {
            children: children.into_iter().map(Box::new).collect(),
            active: 0,
        }
    }

    pub async fn next_row(&mut self, ctx: &Arc<ExecContext>, scope: &VariableScope) -> Result<Option<Row>, EngineError> {
        while self.active < self.children.len() {
            match self.children[self.active].next_row(ctx, scope).await? {
                Some(row) => return Ok(Some(row)),
                None => self.active += 1,
            }
        }
        Ok(None)
    }
}

/// Materializes its child once so it can be re-scanned by multiple
/// consumers in the same plan (`spec.md` §3.6) — table spool is the
/// eager/unindexed form.
pub struct TableSpoolState {
    pub child: Box<PlanNode>,
    rows: Option<VecDeque<Row>>,
}

impl TableSpoolState {
    pub fn new(child: PlanNode) -> Self {
        TableSpoolState { child: Box::new(child), rows: None }
    }

    pub async fn next_row(&mut self, ctx: &Arc<ExecContext>, scope: &VariableScope) -> Result<Option<Row>, EngineError> {
        if self.rows.is_none() {
            self.rows = Some(materialize(&mut self.child, ctx, scope).await?.into());
        }
        Ok(self.rows.as_mut().unwrap().pop_front())
    }
}

/// Like `TableSpool` but keyed, so repeated lookups by the same join key
/// avoid re-scanning the spooled set linearly (`spec.md` §3.6).
pub struct IndexSpoolState {
    pub child: Box<PlanNode>,
    pub key_column: String,
    index: Option<HashMap<String, Vec<Row>>>,
    probe_queue: VecDeque<Row>,
    full_drain: Option<VecDeque<Row>>,
}

impl IndexSpoolState {
    pub fn new(child: PlanNode, key_column: String) -> Self {
        IndexSpoolState {
            child: Box::new(child),
            key_column,
            index: None,
            probe_queue: VecDeque::new(),
            full_drain: None,
        }
    }

    async fn ensure_indexed(&mut self, ctx: &Arc<ExecContext>, scope: &VariableScope) -> Result<(), EngineError> {
        if self.index.is_some() {
            return Ok(());
        }
        let rows = materialize(&mut self.child, ctx, scope).await?;
        let mut index: HashMap<String, Vec<Row>> = HashMap::new();
        for row in rows {
            let key = row.get(&self.key_column).map(|v| v.display_text()).unwrap_or_default();
            index.entry(key).or_default().push(row);
        }
        self.index = Some(index);
        Ok(())
    }

    pub async fn probe(&mut self, ctx: &Arc<ExecContext>, scope: &VariableScope, key: &str) -> Result<(), EngineError> {
        self.ensure_indexed(ctx, scope).await?;
        if let Some(rows) = self.index.as_ref().unwrap().get(key) {
            self.probe_queue = rows.clone().into();
        } else {
            self.probe_queue.clear();
        }
        Ok(())
    }

    pub fn next_probed_row(&mut self) -> Option<Row> {
        self.probe_queue.pop_front()
    }

    /// Pulled directly (outside a join probe), an index spool behaves like
    /// a table spool: it yields every spooled row once, in original order.
    pub async fn next_row(&mut self, ctx: &Arc<ExecContext>, scope: &VariableScope) -> Result<Option<Row>, EngineError> {
        self.ensure_indexed(ctx, scope).await?;
        if self.full_drain.is_none() {
            self.full_drain = Some(self.index.as_ref().unwrap().values().flatten().cloned().collect());
        }
        Ok(self.full_drain.as_mut().unwrap().pop_front())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggOp {
    Sum,
    Count,
    CountColumn,
    Min,
    Max,
    Avg,
    Stdev,
    Var,
}

/// Merges per-partition aggregate results into one final row per group,
/// applying the correct combination rule per aggregate kind (`spec.md`
/// §3.7): each child row is itself a partial aggregate the backend computed
/// for its partition, so SUM/COUNT/MIN/MAX simply re-apply the same op
/// across partials (sum-of-sums, count-of-counts, min-of-mins); AVG is
/// recomputed from injected per-partition (sum, count) companion columns;
/// STDEV/VAR combine per-partition (count, mean, M2) triples with the
/// parallel-variance form of Welford's algorithm.
pub struct MergeAggregateState {
    pub children: Vec<Box<PlanNode>>,
    pub group_by: Vec<String>,
    /// output column -> (op, partial-row source column)
    pub aggregates: Vec<(String, AggOp, String)>,
    pub avg_companions: HashMap<String, (String, String)>,
    /// output column -> (count, mean, M2) companion columns for STDEV/VAR
    pub variance_companions: HashMap<String, (String, String, String)>,
    spooled: Option<VecDeque<Row>>,
}

impl MergeAggregateState {
    pub fn new(
        children: Vec<PlanNode>,
        group_by: Vec<String>,
        aggregates: Vec<(String, AggOp, String)>,
        avg_companions: HashMap<String, (String, String)>,
        variance_companions: HashMap<String, (String, String, String)>,
    ) -> Self {
        MergeAggregateState {
            children: children.into_iter().map(Box::new).collect(),
            group_by,
            aggregates,
            avg_companions,
            variance_companions,
            spooled: None,
        }
    }

    pub async fn next_row(&mut self, ctx: &Arc<ExecContext>, scope: &VariableScope) -> Result<Option<Row>, EngineError> {
        if self.spooled.is_none() {
            self.spooled = Some(self.merge(ctx, scope).await?.into());
        }
        Ok(self.spooled.as_mut().unwrap().pop_front())
    }

    async fn merge(&mut self, ctx: &Arc<ExecContext>, scope: &VariableScope) -> Result<Vec<Row>, EngineError> {
        let mut groups: HashMap<String, Vec<Row>> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for child in self.children.iter_mut() {
            while let Some(row) = child.next_row(ctx, scope).await? {
                let key = self.group_by.iter().map(|c| row.get(c).map(|v| v.display_text()).unwrap_or_default()).collect::<Vec<_>>().join("\u{0}");
                if !groups.contains_key(&key) {
                    order.push(key.clone());
                }
                groups.entry(key).or_default().push(row);
            }
        }
        let mut out = Vec::with_capacity(order.len());
        for key in order {
            let rows = &groups[&key];
            let mut merged = Row::new("aggregate");
            for (i, col) in self.group_by.iter().enumerate() {
                let _ = i;
                merged.insert(col.clone(), rows[0].get(col).cloned().unwrap_or_else(Value::null));
            }
            for (out_col, op, src_col) in &self.aggregates {
                let value = match op {
                    AggOp::Sum | AggOp::CountColumn | AggOp::Count => {
                        let total: f64 = rows.iter().filter_map(|r| r.get(src_col)).filter(|v| !v.is_null()).filter_map(|v| v.display_text().parse::<f64>().ok()).sum();
                        if matches!(op, AggOp::Count | AggOp::CountColumn) { Value::int(total as i64) } else { Value::double(total) }
                    }
                    AggOp::Min => rows.iter().filter_map(|r| r.get(src_col)).filter(|v| !v.is_null()).min_by(|a, b| compare(a, b).unwrap_or(std::cmp::Ordering::Equal)).cloned().unwrap_or_else(Value::null),
                    AggOp::Max => rows.iter().filter_map(|r| r.get(src_col)).filter(|v| !v.is_null()).max_by(|a, b| compare(a, b).unwrap_or(std::cmp::Ordering::Equal)).cloned().unwrap_or_else(Value::null),
                    AggOp::Avg => {
                        if let Some((sum_col, count_col)) = self.avg_companions.get(out_col) {
                            let sum: f64 = rows.iter().filter_map(|r| r.get(sum_col)).filter_map(|v| v.display_text().parse::<f64>().ok()).sum();
                            let count: f64 = rows.iter().filter_map(|r| r.get(count_col)).filter_map(|v| v.display_text().parse::<f64>().ok()).sum();
                            if count == 0.0 { Value::null() } else { Value::double(sum / count) }
                        } else {
                            Value::null()
                        }
                    }
                    AggOp::Stdev | AggOp::Var => match self.variance_companions.get(out_col) {
                        Some((count_col, mean_col, m2_col)) => {
                            let combined = rows
                                .iter()
                                .filter_map(|r| partial_stats(r, count_col, mean_col, m2_col))
                                .fold(None, combine_partial_stats);
                            match combined {
                                Some((count, _, m2)) if count > 1.0 => {
                                    let variance = m2 / (count - 1.0);
                                    if matches!(op, AggOp::Stdev) { Value::double(variance.sqrt()) } else { Value::double(variance) }
                                }
                                _ => Value::null(),
                            }
                        }
                        None => Value::null(),
                    },
                };
                merged.insert(out_col.clone(), value);
            }
            out.push(merged);
        }
        Ok(out)
    }
}

fn partial_stats(row: &Row, count_col: &str, mean_col: &str, m2_col: &str) -> Option<(f64, f64, f64)> {
    let count = row.get(count_col)?.display_text().parse::<f64>().ok()?;
    let mean = row.get(mean_col)?.display_text().parse::<f64>().ok()?;
    let m2 = row.get(m2_col)?.display_text().parse::<f64>().ok()?;
    Some((count, mean, m2))
}

/// Chan/Golub/LeVeque's parallel-variance combination of two (count, mean,
/// M2) triples, the form Welford's running-variance update generalizes to
/// when merging independently-computed partials rather than folding in one
/// value at a time.
fn combine_partial_stats(acc: Option<(f64, f64, f64)>, next: (f64, f64, f64)) -> Option<(f64, f64, f64)> {
    match acc {
        None => Some(next),
        Some((count_a, mean_a, m2_a)) => {
            let (count_b, mean_b, m2_b) = next;
            let total = count_a + count_b;
            let delta = mean_b - mean_a;
            let mean = mean_a + delta * count_b / total;
            let m2 = m2_a + m2_b + delta * delta * count_a * count_b / total;
            Some((total, mean, m2))
        }
    }
}

/// Fans a child plan out across up to `max_concurrency` partitions
/// concurrently, bounded by a semaphore, and concatenates results in
/// completion order (`spec.md` §3.8). Grounded in the same
/// semaphore/JoinSet pattern a parallel script executor uses for
/// concurrent statement batches.
#[derive(Debug)]
pub struct ParallelPartitionState {
    pub partitions: Vec<PlanNode>,
    pub max_concurrency: usize,
    results: Option<VecDeque<Row>>,
}

impl ParallelPartitionState {
    pub fn new(partitions: Vec<PlanNode>, max_concurrency: usize) -> Self {
        ParallelPartitionState {
            partitions,
            max_concurrency: max_concurrency.max(1),
            results: None,
        }
    }

    pub async fn next_row(&mut self, ctx: &Arc<ExecContext>, scope: &VariableScope) -> Result<Option<Row>, EngineError> {
        if self.results.is_none() {
            self.results = Some(self.run_all(ctx, scope).await?.into());
        }
        Ok(self.results.as_mut().unwrap().pop_front())
    }

    async fn run_all(&mut self, ctx: &Arc<ExecContext>, scope: &VariableScope) -> Result<Vec<Row>, EngineError> {
        ctx.stats.paging.suppress();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut set: JoinSet<Result<Vec<Row>, EngineError>> = JoinSet::new();
        let partitions = std::mem::take(&mut self.partitions);
        for mut part in partitions {
            let permit = semaphore.clone();
            let cancel = ctx.cancel.clone();
            let scope_snapshot = scope.snapshot();
            let exec = ctx.clone();
            set.spawn(async move {
                let _permit = permit.acquire_owned().await.map_err(|_| EngineError::Cancelled)?;
                if cancel.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                let mut rows = Vec::new();
                while let Some(row) = part.next_row(&exec, &scope_snapshot).await? {
                    rows.push(row);
                }
                Ok(rows)
            });
        }
        let mut out = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(rows)) => out.extend(rows),
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(EngineError::Cancelled),
            }
        }
        Ok(out)
    }
}

/// Splits a delimited string column into one row per token (`spec.md` §3.9).
#[derive(Debug)]
pub struct StringSplitState {
    pub child: Box<PlanNode>,
    pub source_column: String,
    pub delimiter: String,
    pub output_column: String,
    pending: VecDeque<Row>,
}

impl StringSplitState {
    pub fn new(child: PlanNode, source_column: String, delimiter: String, output_column: String) -> Self {
        StringSplitState { child: Box::new(child), source_column, delimiter, output_column, pending: VecDeque::new() }
    }

    pub async fn next_row(&mut self, ctx: &Arc<ExecContext>, scope: &VariableScope) -> Result<Option<Row>, EngineError> {
        loop {
            if let Some(row) = self.pending.pop_front() {
                return Ok(Some(row));
            }
            match self.child.next_row(ctx, scope).await? {
                Some(row) => {
                    let text = row.get(&self.source_column).map(|v| v.display_text()).unwrap_or_default();
                    for part in text.split(self.delimiter.as_str()) {
                        let mut out = Row::new(row.entity.clone());
                        out.insert(self.output_column.clone(), Value::string(part.to_string()));
                        self.pending.push_back(out);
                    }
                    if self.pending.is_empty() {
                        continue;
                    }
                }
                None => return Ok(None),
            }
        }
    }
}

/// Explodes a JSON array/object column into rows (`spec.md` §3.9) — kept
/// intentionally shallow: one level of array-of-scalars expansion.
#[derive(Debug)]
pub struct OpenJsonState {
    pub child: Box<PlanNode>,
    pub source_column: String,
    pub value_column: String,
    pending: VecDeque<Row>,
}

impl OpenJsonState {
    pub fn new(child: PlanNode, source_column: String, value_column: String) -> Self {
        OpenJsonState { child: Box::new(child), source_column, value_column, pending: VecDeque::new() }
    }

    pub async fn next_row(&mut self, ctx: &Arc<ExecContext>, scope: &VariableScope) -> Result<Option<Row>, EngineError> {
        loop {
            if let Some(row) = self.pending.pop_front() {
                return Ok(Some(row));
            }
            match self.child.next_row(ctx, scope).await? {
                Some(row) => {
                    let text = row.get(&self.source_column).map(|v| v.display_text()).unwrap_or_default();
                    for token in parse_json_scalar_array(&text) {
                        let mut out = Row::new(row.entity.clone());
                        out.insert(self.value_column.clone(), Value::string(token));
                        self.pending.push_back(out);
                    }
                    if self.pending.is_empty() {
                        continue;
                    }
                }
                None => return Ok(None),
            }
        }
    }
}

fn parse_json_scalar_array(text: &str) -> Vec<String> {
    let trimmed = text.trim().trim_start_matches('[').trim_end_matches(']');
    if trimmed.trim().is_empty() {
        return Vec::new();
    }
    trimmed
        .split(',')
        .map(|s| s.trim().trim_matches('"').to_string())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
}

/// Hash or nested-loop equi-join between two already-spooled children
/// (`spec.md` §3.10). Uses a hash join whenever the join key is a single
/// equality column; falls back to nested-loop for composite keys.
#[derive(Debug)]
pub struct MergeJoinState {
    pub left: Box<PlanNode>,
    pub right: Box<PlanNode>,
    pub left_key: String,
    pub right_key: String,
    pub join_type: JoinType,
    pub output_entity: String,
    rows: Option<VecDeque<Row>>,
}

impl MergeJoinState {
    pub fn new(left: PlanNode, right: PlanNode, left_key: String, right_key: String, join_type: JoinType, output_entity: String) -> Self {
        MergeJoinState {
            left: Box::new(left),
            right: Box::new(right),
            left_key,
            right_key,
            join_type,
            output_entity,
            rows: None,
        }
    }

    async fn run(&mut self, ctx: &Arc<ExecContext>, scope: &VariableScope) -> Result<Vec<Row>, EngineError> {
        let left_rows = materialize(&mut self.left, ctx, scope).await?;
        let right_rows = materialize(&mut self.right, ctx, scope).await?;
        let mut right_index: HashMap<String, Vec<&Row>> = HashMap::new();
        for r in &right_rows {
            let key = r.get(&self.right_key).map(|v| v.display_text()).unwrap_or_default();
            right_index.entry(key).or_default().push(r);
        }
        let mut out = Vec::new();
        for l in &left_rows {
            let key = l.get(&self.left_key).map(|v| v.display_text()).unwrap_or_default();
            let matches = right_index.get(&key).cloned().unwrap_or_default();
            if matches.is_empty() {
                if self.join_type == JoinType::Left {
                    out.push(merge_rows(l, None, &self.output_entity));
                }
            } else {
                for r in matches {
                    out.push(merge_rows(l, Some(r), &self.output_entity));
                }
            }
        }
        Ok(out)
    }

    pub async fn next_row(&mut self, ctx: &Arc<ExecContext>, scope: &VariableScope) -> Result<Option<Row>, EngineError> {
        if self.rows.is_none() {
            self.rows = Some(self.run(ctx, scope).await?.into());
        }
        Ok(self.rows.as_mut().unwrap().pop_front())
    }
}

fn merge_rows(left: &Row, right: Option<&Row>, entity: &str) -> Row {
    let mut out = Row::new(entity.to_string());
    for name in left.columns() {
        out.insert(name.to_string(), left.get(name).cloned().unwrap_or_else(Value::null));
    }
    if let Some(r) = right {
        for name in r.columns() {
            out.insert(name.to_string(), r.get(name).cloned().unwrap_or_else(Value::null));
        }
    }
    out
}

/// Yields exactly one empty row, then exhausts. Used as the driving plan for
/// statements with no natural source rows of their own, such as INSERT
/// VALUES, where the written values come entirely from literal expressions.
#[derive(Debug)]
pub struct SingleRowState {
    emitted: bool,
}

impl SingleRowState {
    pub fn new() -> Self {
        SingleRowState { emitted: false }
    }

    pub async fn next_row(&mut self) -> Result<Option<Row>, EngineError> {
        if self.emitted {
            return Ok(None);
        }
        self.emitted = true;
        Ok(Some(Row::new("values")))
    }
}

pub fn columns_from_rows(rows: &[Row]) -> Vec<Column> {
    rows.first()
        .map(|r| r.columns().map(|c| Column::new(c, crate::value::TypeTag::Unknown)).collect())
        .unwrap_or_default()
}
