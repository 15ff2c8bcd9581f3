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
//! Statement → plan tree, per `spec.md` §4.7. Dispatches by root statement
//! kind and assembles the operator tree from `plan::scan`/`plan::operators`/
//! `plan::dml` state structs.
//!
//! Building a leaf scan needs the transpiler and, for NOT-IN's two-phase
//! fallback, needs to actually run the inner query — both require the
//! execution context. The planner is therefore an `async fn` over
//! `&Arc<ExecContext>` rather than a pure function of the AST alone; see
//! `DESIGN.md` for why this departs from the "planner has no I/O" framing.

use std::collections::HashMap;
use std::sync::Arc;

use sqlparser::ast::{
    Expr as SqlExpr, FromTable, FunctionArg, FunctionArgExpr, FunctionArguments, Query, Select,
    SelectItem, SetExpr, SetOperator, SetQuantifier, Statement, TableFactor, TableWithJoins,
};

use crate::context::ExecContext;
use crate::error::EngineError;
use crate::expr::{compile_expr, compile_predicate, expr_default_name, item_output_name, CompiledExpr};
use crate::options::PlannerOptions;
use crate::plan::dml::{DmlExecuteState, DmlMode};
use crate::plan::operators::{
    AggOp, ClientFilterState, ClientWindowState, ConcatenateState, DistinctState, FrameBound,
    MergeAggregateState, MergeJoinState, ParallelPartitionState, ProjectState, WindowFunc,
    WindowSpec,
};
use crate::plan::scan::{
    AdaptiveAggregateScanState, BackendSqlScanState, CountOptimizedState, FetchXmlScanState,
    MetadataScanState,
};
use crate::plan::PlanNode;

const EMPTY_SCHEMA: fn() -> HashMap<String, usize> = HashMap::new;

/// Entry point: plan one root statement.
pub async fn plan_statement(
    stmt: &Statement,
    ctx: &Arc<ExecContext>,
    options: &PlannerOptions,
) -> Result<PlanNode, EngineError> {
    match stmt {
        Statement::Query(query) => plan_query(query, ctx, options).await,
        Statement::Insert(insert) => plan_insert(insert, ctx, options).await,
        Statement::Update { table, assignments, selection, .. } => {
            plan_update(table, assignments, selection.as_ref(), ctx, options).await
        }
        Statement::Delete(delete) => plan_delete(delete, ctx, options).await,
        Statement::Merge { table, source, on, clauses, .. } => {
            plan_merge(table, source, on, clauses, ctx, options).await
        }
        other => Err(EngineError::OperationNotSupported(format!(
            "statement kind not supported by the planner: {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// SELECT / UNION
// ---------------------------------------------------------------------------

async fn plan_query(
    query: &Query,
    ctx: &Arc<ExecContext>,
    options: &PlannerOptions,
) -> Result<PlanNode, EngineError> {
    plan_set_expr(query.body.as_ref(), ctx, options).await
}

/// Plans a query body directly, without needing a full `Query` wrapper —
/// UNION branches are bare `SetExpr`s and never carry their own `Query`.
async fn plan_set_expr(
    body: &SetExpr,
    ctx: &Arc<ExecContext>,
    options: &PlannerOptions,
) -> Result<PlanNode, EngineError> {
    match body {
        SetExpr::Select(select) => plan_select(select, ctx, options).await,
        SetExpr::SetOperation { op, set_quantifier, left, right } => {
            if !matches!(op, SetOperator::Union) {
                return Err(EngineError::OperationNotSupported(format!("set operator {op}")));
            }
            let left_plan = Box::pin(plan_set_expr(left, ctx, options)).await?;
            let right_plan = Box::pin(plan_set_expr(right, ctx, options)).await?;

            if let (Some(l), Some(r)) = (set_expr_arity(left), set_expr_arity(right)) {
                if l != r {
                    return Err(EngineError::Validation(format!(
                        "UNION arity mismatch: {l} columns vs {r} columns"
                    )));
                }
            }

            let union = PlanNode::Concatenate(ConcatenateState::new(vec![left_plan, right_plan]));
            Ok(if matches!(set_quantifier, SetQuantifier::All) {
                union
            } else {
                PlanNode::Distinct(DistinctState::new(union))
            })
        }
        SetExpr::Query(inner) => Box::pin(plan_query(inner, ctx, options)).await,
        other => Err(EngineError::OperationNotSupported(format!(
            "query body not supported: {other}"
        ))),
    }
}

fn set_expr_arity(expr: &SetExpr) -> Option<usize> {
    match expr {
        SetExpr::Select(s) => Some(s.projection.len()),
        _ => None,
    }
}

async fn plan_select(
    select: &Select,
    ctx: &Arc<ExecContext>,
    options: &PlannerOptions,
) -> Result<PlanNode, EngineError> {
    let from = select
        .from
        .first()
        .ok_or_else(|| EngineError::Validation("SELECT requires a FROM clause".into()))?;
    let table_name = table_with_joins_name(from)?;

    // 1. metadata.<table> routing.
    if let Some(meta_table) = table_name.strip_prefix("metadata.") {
        let scan = PlanNode::MetadataScan(MetadataScanState::new(meta_table.to_string()));
        return Ok(wrap_client_filter(scan, select.selection.as_ref())?);
    }

    // 2. backend-SQL passthrough routing.
    if options.use_backend_sql_passthrough && has_no_virtual_columns(select) {
        if let Some(sql) = &options.original_sql {
            return Ok(PlanNode::BackendSqlScan(BackendSqlScanState::new(
                sql.clone(),
                options.max_rows,
            )));
        }
    }

    // 3. COUNT(*) fast path.
    if is_bare_count_star(select) {
        let output_column = select
            .projection
            .first()
            .map(item_output_name)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "n".to_string());
        let fallback = build_aggregate_scan(select, &table_name, ctx, options).await?;
        return Ok(PlanNode::CountOptimized(CountOptimizedState::new(
            table_name,
            fallback,
            output_column,
        )));
    }

    // NOT IN two-phase fallback and IN → JOIN rewrite run before transpilation,
    // since they change what WHERE predicate (if any) the transpiler sees.
    let (selection, join_rewrite) = rewrite_subquery_predicate(select.selection.as_ref(), ctx, options).await?;

    let is_aggregate = is_aggregate_select(select);
    let base_plan = if is_aggregate && should_partition(select, options) {
        build_partitioned_aggregate(select, &table_name, ctx, options).await?
    } else {
        build_single_scan(select, &table_name, selection.as_ref(), ctx, options).await?
    };

    let mut plan = if let Some((join_plan, _)) = join_rewrite {
        join_plan_over(base_plan, join_plan)
    } else {
        base_plan
    };

    if !is_aggregate || should_partition(select, options) {
        plan = wrap_client_filter(plan, selection.as_ref())?;
    }
    if let Some(having) = &select.having {
        plan = wrap_client_filter(plan, Some(having))?;
    }

    plan = wrap_window(plan, select)?;
    plan = wrap_project(plan, select, &table_name)?;
    Ok(plan)
}

fn join_plan_over(outer: PlanNode, inner_join: InnerJoinPlan) -> PlanNode {
    PlanNode::Merge(MergeJoinState::new(
        outer,
        inner_join.plan,
        inner_join.outer_key,
        inner_join.inner_key,
        crate::plan::operators::JoinType::Inner,
        inner_join.output_entity,
    ))
}

struct InnerJoinPlan {
    plan: PlanNode,
    outer_key: String,
    inner_key: String,
    output_entity: String,
}

/// Handles the IN (subquery) → JOIN and NOT IN → two-phase-literal rewrites
/// (`spec.md` §4.7 item 3). Returns the residual selection to push normally
/// plus, for the JOIN case, the inner plan to join against.
async fn rewrite_subquery_predicate(
    selection: Option<&SqlExpr>,
    ctx: &Arc<ExecContext>,
    options: &PlannerOptions,
) -> Result<(Option<SqlExpr>, Option<(InnerJoinPlan, ())>), EngineError> {
    let Some(expr) = selection else { return Ok((None, None)) };
    match expr {
        SqlExpr::InSubquery { expr: key_expr, subquery, negated: false } => {
            let outer_key = expr_default_name(key_expr);
            let inner_plan = Box::pin(plan_query(subquery, ctx, options)).await?;
            let inner_key = subquery_projection_name(subquery);
            Ok((
                None,
                Some((
                    InnerJoinPlan {
                        plan: inner_plan,
                        outer_key,
                        inner_key,
                        output_entity: "joined".to_string(),
                    },
                    (),
                )),
            ))
        }
        SqlExpr::InSubquery { expr: key_expr, subquery, negated: true } => {
            // Two-phase: materialize the subquery now and rewrite as a
            // literal NOT IN list, since the backend has no correlated
            // anti-join shape we can express here.
            let mut inner_plan = Box::pin(plan_query(subquery, ctx, options)).await?;
            let inner_key = subquery_projection_name(subquery);
            let mut literals = Vec::new();
            let empty_scope = crate::script::scope::VariableScope::new();
            while let Some(row) = inner_plan.next_row(ctx, &empty_scope).await? {
                if let Some(v) = row.get(&inner_key) {
                    if !v.is_null() {
                        literals.push(SqlExpr::Value(sqlparser::ast::Value::SingleQuotedString(
                            v.display_text(),
                        )));
                    }
                }
            }
            const BACKEND_CONDITION_VALUE_LIMIT: usize = 5000;
            if literals.len() > BACKEND_CONDITION_VALUE_LIMIT {
                return Err(EngineError::OperationNotSupported(
                    "NOT IN fallback exceeds the backend's condition-value limit".into(),
                ));
            }
            let rewritten = SqlExpr::InList {
                expr: key_expr.clone(),
                list: literals,
                negated: true,
            };
            Ok((Some(rewritten), None))
        }
        SqlExpr::BinaryOp { left, op, right } if matches!(op, sqlparser::ast::BinaryOperator::And) => {
            // Rewrite only the top-level AND's direct subquery operand, if any;
            // everything else is left for the ordinary client-filter path.
            let (l_rewritten, l_join) = Box::pin(rewrite_subquery_predicate(Some(left), ctx, options)).await?;
            if l_join.is_some() || l_rewritten.is_some() {
                let residual = combine_and(l_rewritten, Some((**right).clone()));
                return Ok((residual, l_join));
            }
            let (r_rewritten, r_join) = Box::pin(rewrite_subquery_predicate(Some(right), ctx, options)).await?;
            if r_join.is_some() || r_rewritten.is_some() {
                let residual = combine_and(Some((**left).clone()), r_rewritten);
                return Ok((residual, r_join));
            }
            Ok((Some(expr.clone()), None))
        }
        _ => Ok((Some(expr.clone()), None)),
    }
}

fn combine_and(left: Option<SqlExpr>, right: Option<SqlExpr>) -> Option<SqlExpr> {
    match (left, right) {
        (Some(l), Some(r)) => Some(SqlExpr::BinaryOp {
            left: Box::new(l),
            op: sqlparser::ast::BinaryOperator::And,
            right: Box::new(r),
        }),
        (Some(l), None) => Some(l),
        (None, Some(r)) => Some(r),
        (None, None) => None,
    }
}

fn subquery_projection_name(query: &Query) -> String {
    match query.body.as_ref() {
        SetExpr::Select(s) => s.projection.first().map(item_output_name).unwrap_or_default(),
        _ => String::new(),
    }
}

async fn build_single_scan(
    select: &Select,
    table_name: &str,
    selection: Option<&SqlExpr>,
    ctx: &Arc<ExecContext>,
    options: &PlannerOptions,
) -> Result<PlanNode, EngineError> {
    // selection may have been rewritten (NOT IN -> literal list) ahead of
    // planning this scan; render the transpiler's input with that rewrite
    // applied rather than the statement's original WHERE text.
    let mut rendered = select.clone();
    rendered.selection = selection.cloned();
    let select_sql = rendered.to_string();
    let (fetchxml, _virtual_columns) = ctx.transpiler.transpile(&select_sql).await?;
    let scan = FetchXmlScanState::new(
        fetchxml,
        options.page_number.is_none(),
        options.page_number,
        options.paging_cookie.clone(),
        options.max_rows,
        options.include_count,
    );
    let mut plan = PlanNode::FetchXmlScan(scan);
    if options.enable_prefetch {
        plan = PlanNode::PrefetchScan(crate::plan::scan::PrefetchScanState::new(
            plan,
            options.prefetch_buffer_size(),
        ));
    }
    let _ = table_name;
    Ok(plan)
}

async fn build_aggregate_scan(
    select: &Select,
    table_name: &str,
    ctx: &Arc<ExecContext>,
    options: &PlannerOptions,
) -> Result<PlanNode, EngineError> {
    build_single_scan(select, table_name, select.selection.as_ref(), ctx, options).await
}

fn should_partition(select: &Select, options: &PlannerOptions) -> bool {
    is_aggregate_select(select)
        && options.pool_capacity() > 1
        && options
            .estimated_record_count
            .map(|n| n > options.aggregate_record_limit())
            .unwrap_or(false)
        && options.min_date.is_some()
        && options.max_date.is_some()
        && !has_count_distinct(select)
}

/// `spec.md` §4.7's aggregate partitioning: slice the known date range into
/// `ceil(estimatedRows / maxPerPartition)` equal-tick intervals, one
/// `AdaptiveAggregateScan` per slice, fanned out via `ParallelPartition` and
/// recombined with `MergeAggregate`.
async fn build_partitioned_aggregate(
    select: &Select,
    table_name: &str,
    ctx: &Arc<ExecContext>,
    options: &PlannerOptions,
) -> Result<PlanNode, EngineError> {
    let estimated = options.estimated_record_count.unwrap_or(0);
    let per_partition = options.max_records_per_partition().max(1);
    let partition_count = ((estimated as f64) / (per_partition as f64)).ceil().max(1.0) as u32;
    let min_date = options.min_date.unwrap();
    let max_date = options.max_date.unwrap();
    let span = max_date - min_date;
    let tick = span / (partition_count as i32);

    let date_filter_attribute = aggregate_date_attribute(select).unwrap_or_else(|| "createdon".to_string());
    let template = aggregate_template(select, ctx).await?;
    let mut partitions = Vec::with_capacity(partition_count as usize);
    for i in 0..partition_count {
        let start = min_date + tick * (i as i32);
        let end = if i + 1 == partition_count {
            max_date + chrono::Duration::seconds(1)
        } else {
            min_date + tick * ((i + 1) as i32)
        };
        partitions.push(PlanNode::AdaptiveAggregateScan(AdaptiveAggregateScanState::new(
            template.clone(),
            date_filter_attribute.clone(),
            start,
            end,
            crate::options::ADAPTIVE_SPLIT_DEPTH_CAP,
        )));
    }

    let group_by = select
        .group_by
        .clone();
    let group_by_columns = group_by_names(&group_by);
    let (aggregates, avg_companions, variance_companions) = aggregate_merge_plan(select);

    let _ = table_name;
    let fanout = PlanNode::ParallelPartition(ParallelPartitionState::new(partitions, options.pool_capacity()));
    Ok(PlanNode::MergeAggregate(MergeAggregateState::new(
        vec![fanout],
        group_by_columns,
        aggregates,
        avg_companions,
        variance_companions,
    )))
}

fn group_by_names(group_by: &sqlparser::ast::GroupByExpr) -> Vec<String> {
    match group_by {
        sqlparser::ast::GroupByExpr::Expressions(exprs, _) => exprs.iter().map(expr_default_name).collect(),
        sqlparser::ast::GroupByExpr::All(_) => Vec::new(),
    }
}

/// FetchXML template carrying a `{date_filter}` placeholder the
/// `AdaptiveAggregateScan` fills at execution time per partition. The
/// aggregate clauses themselves come from the transpiler, same as any other
/// scan; we only splice in the placeholder the date range needs.
async fn aggregate_template(select: &Select, ctx: &Arc<ExecContext>) -> Result<String, EngineError> {
    let select_sql = select.to_string();
    let (fetchxml, _virtual_columns) = ctx.transpiler.transpile(&select_sql).await?;
    Ok(splice_date_filter_placeholder(&fetchxml))
}

fn splice_date_filter_placeholder(fetchxml: &str) -> String {
    if let Some(pos) = fetchxml.find("</filter>") {
        let mut out = fetchxml.to_string();
        out.insert_str(pos, "{date_filter}");
        return out;
    }
    if let Some(pos) = fetchxml.find("</entity>") {
        let mut out = fetchxml.to_string();
        out.insert_str(pos, "<filter>{date_filter}</filter>");
        return out;
    }
    fetchxml.to_string()
}

fn aggregate_date_attribute(select: &Select) -> Option<String> {
    let exprs = match &select.group_by {
        sqlparser::ast::GroupByExpr::Expressions(exprs, _) => exprs.as_slice(),
        sqlparser::ast::GroupByExpr::All(_) => &[],
    };
    exprs.iter().find_map(|e| {
        if let SqlExpr::Function(f) = e {
            if f.name.to_string().eq_ignore_ascii_case("year") {
                return function_first_arg_name(f);
            }
        }
        None
    })
}

fn function_first_arg_name(f: &sqlparser::ast::Function) -> Option<String> {
    if let FunctionArguments::List(list) = &f.args {
        for a in &list.args {
            if let FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) = a {
                return Some(expr_default_name(e));
            }
        }
    }
    None
}

fn has_count_distinct(select: &Select) -> bool {
    select.projection.iter().any(|item| {
        let expr = match item {
            SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } => e,
            _ => return false,
        };
        matches!(expr, SqlExpr::Function(f) if f.name.to_string().eq_ignore_ascii_case("count") && matches!(&f.args, FunctionArguments::List(l) if l.duplicate_treatment == Some(sqlparser::ast::DuplicateTreatment::Distinct)))
    })
}

type AvgCompanions = HashMap<String, (String, String)>;
type VarianceCompanions = HashMap<String, (String, String, String)>;

/// Maps each aggregate projection to the partition-output column its merge
/// step reads from. For SUM/COUNT/MIN/MAX that column is the aggregate's own
/// output alias: the transpiler renders the real aggregate into every
/// partition, so combining partials (sum-of-sums, count-of-counts, ...) only
/// needs the alias the partition already produced. AVG and STDEV/VAR instead
/// request companion attributes (avg-of-avgs and naive variance-of-variances
/// are both wrong) and carry their own merge formula.
fn aggregate_merge_plan(select: &Select) -> (Vec<(String, AggOp, String)>, AvgCompanions, VarianceCompanions) {
    let mut aggregates = Vec::new();
    let mut avg_companions = HashMap::new();
    let mut variance_companions = HashMap::new();
    for item in &select.projection {
        let (expr, out_name) = match item {
            SelectItem::UnnamedExpr(e) => (e, expr_default_name(e)),
            SelectItem::ExprWithAlias { expr, alias } => (expr, alias.value.to_lowercase()),
            _ => continue,
        };
        let SqlExpr::Function(f) = expr else { continue };
        let name = f.name.to_string().to_uppercase();
        let op = match name.as_str() {
            "SUM" => AggOp::Sum,
            "COUNT" => AggOp::CountColumn,
            "MIN" => AggOp::Min,
            "MAX" => AggOp::Max,
            "AVG" => AggOp::Avg,
            "STDEV" | "STDDEV" => AggOp::Stdev,
            "VAR" | "VARIANCE" => AggOp::Var,
            _ => continue,
        };
        let src = match op {
            AggOp::Avg | AggOp::Stdev | AggOp::Var => function_first_arg_name(f).unwrap_or_default(),
            _ => out_name.clone(),
        };
        match op {
            AggOp::Avg => {
                let sum_col = format!("{out_name}__sum");
                let count_col = format!("{out_name}__count");
                avg_companions.insert(out_name.clone(), (sum_col, count_col));
            }
            AggOp::Stdev | AggOp::Var => {
                let count_col = format!("{out_name}__count");
                let mean_col = format!("{out_name}__mean");
                let m2_col = format!("{out_name}__m2");
                variance_companions.insert(out_name.clone(), (count_col, mean_col, m2_col));
            }
            _ => {}
        }
        aggregates.push((out_name, op, src));
    }
    (aggregates, avg_companions, variance_companions)
}

fn is_aggregate_select(select: &Select) -> bool {
    select.projection.iter().any(|item| {
        let expr = match item {
            SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } => e,
            _ => return false,
        };
        matches!(expr, SqlExpr::Function(f) if is_aggregate_function_name(&f.name.to_string()))
    }) || !matches!(select.group_by, sqlparser::ast::GroupByExpr::Expressions(ref v, _) if v.is_empty())
}

fn is_aggregate_function_name(name: &str) -> bool {
    matches!(
        name.to_uppercase().as_str(),
        "SUM" | "COUNT" | "AVG" | "MIN" | "MAX" | "STDEV" | "STDDEV" | "VAR" | "VARIANCE"
    )
}

fn is_bare_count_star(select: &Select) -> bool {
    if select.projection.len() != 1 || select.selection.is_some() || select.having.is_some() {
        return false;
    }
    if !matches!(select.group_by, sqlparser::ast::GroupByExpr::Expressions(ref v, _) if v.is_empty()) {
        return false;
    }
    if select.from.len() != 1 || !select.from[0].joins.is_empty() {
        return false;
    }
    let expr = match &select.projection[0] {
        SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } => e,
        _ => return false,
    };
    matches!(expr, SqlExpr::Function(f) if f.name.to_string().eq_ignore_ascii_case("count") && is_count_star(f))
}

fn is_count_star(f: &sqlparser::ast::Function) -> bool {
    matches!(&f.args, FunctionArguments::List(l) if l.args.len() == 1 && matches!(l.args[0], FunctionArg::Unnamed(FunctionArgExpr::Wildcard)))
}

fn has_no_virtual_columns(select: &Select) -> bool {
    !select.projection.iter().any(|item| {
        matches!(item, SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } if expr_default_name(e).starts_with('*'))
    })
}

fn wrap_client_filter(plan: PlanNode, predicate: Option<&SqlExpr>) -> Result<PlanNode, EngineError> {
    match predicate {
        None => Ok(plan),
        Some(expr) => {
            let compiled = compile_predicate(expr, &EMPTY_SCHEMA())?;
            Ok(PlanNode::ClientFilter(ClientFilterState {
                child: Box::new(plan),
                predicate: compiled,
            }))
        }
    }
}

/// Window functions in the SELECT list each contribute one `ClientWindow`
/// layer, chained so each sees the previous layer's added column.
fn wrap_window(mut plan: PlanNode, select: &Select) -> Result<PlanNode, EngineError> {
    for item in &select.projection {
        let (expr, alias) = match item {
            SelectItem::ExprWithAlias { expr, alias } => (expr, Some(alias.value.to_lowercase())),
            SelectItem::UnnamedExpr(e) => (e, None),
            _ => continue,
        };
        let SqlExpr::Function(f) = expr else { continue };
        let Some(over) = &f.over else { continue };
        let spec = window_spec(over)?;
        let func_name = f.name.to_string().to_uppercase();
        let target_column = function_first_arg_name(f);
        let output_column = alias.unwrap_or_else(|| func_name.to_lowercase());
        let func = window_func(&func_name, f)?;
        plan = PlanNode::ClientWindow(ClientWindowState::new(plan, output_column, func, target_column, spec));
    }
    Ok(plan)
}

fn window_func(name: &str, f: &sqlparser::ast::Function) -> Result<WindowFunc, EngineError> {
    Ok(match name {
        "ROW_NUMBER" => WindowFunc::RowNumber,
        "RANK" => WindowFunc::Rank,
        "DENSE_RANK" => WindowFunc::DenseRank,
        "CUME_DIST" => WindowFunc::CumeDist,
        "PERCENT_RANK" => WindowFunc::PercentRank,
        "NTILE" => WindowFunc::Ntile(function_first_int_arg(f).unwrap_or(1)),
        "LAG" => WindowFunc::Lag(function_second_int_arg(f).unwrap_or(1)),
        "LEAD" => WindowFunc::Lead(function_second_int_arg(f).unwrap_or(1)),
        "FIRST_VALUE" => WindowFunc::FirstValue,
        "LAST_VALUE" => WindowFunc::LastValue,
        "SUM" => WindowFunc::Sum,
        "AVG" => WindowFunc::Avg,
        "MIN" => WindowFunc::Min,
        "MAX" => WindowFunc::Max,
        "COUNT" => WindowFunc::Count,
        other => return Err(EngineError::OperationNotSupported(format!("window function {other}"))),
    })
}

fn function_first_int_arg(f: &sqlparser::ast::Function) -> Option<i64> {
    if let FunctionArguments::List(list) = &f.args {
        if let Some(FunctionArg::Unnamed(FunctionArgExpr::Expr(SqlExpr::Value(sqlparser::ast::Value::Number(n, _))))) = list.args.first() {
            return n.parse().ok();
        }
    }
    None
}

fn function_second_int_arg(f: &sqlparser::ast::Function) -> Option<i64> {
    if let FunctionArguments::List(list) = &f.args {
        if let Some(FunctionArg::Unnamed(FunctionArgExpr::Expr(SqlExpr::Value(sqlparser::ast::Value::Number(n, _))))) = list.args.get(1) {
            return n.parse().ok();
        }
    }
    None
}

fn window_spec(over: &sqlparser::ast::WindowType) -> Result<WindowSpec, EngineError> {
    let sqlparser::ast::WindowType::WindowSpec(spec) = over else {
        return Err(EngineError::OperationNotSupported("named window references".into()));
    };
    let partition_by = spec.partition_by.iter().map(expr_default_name).collect();
    let order_by = spec
        .order_by
        .iter()
        .map(|o| (expr_default_name(&o.expr), o.asc == Some(false)))
        .collect();
    let frame = spec.window_frame.as_ref().map(frame_bounds).transpose()?;
    Ok(WindowSpec { partition_by, order_by, frame })
}

fn frame_bounds(frame: &sqlparser::ast::WindowFrame) -> Result<(FrameBound, FrameBound), EngineError> {
    let start = frame_bound(&frame.start_bound);
    let end = frame
        .end_bound
        .as_ref()
        .map(frame_bound)
        .unwrap_or(FrameBound::CurrentRow);
    Ok((start, end))
}

fn frame_bound(bound: &sqlparser::ast::WindowFrameBound) -> FrameBound {
    use sqlparser::ast::WindowFrameBound::*;
    match bound {
        CurrentRow => FrameBound::CurrentRow,
        Preceding(None) => FrameBound::UnboundedPreceding,
        Preceding(Some(n)) => FrameBound::Preceding(parse_i64(n)),
        Following(None) => FrameBound::UnboundedFollowing,
        Following(Some(n)) => FrameBound::Following(parse_i64(n)),
    }
}

fn parse_i64(e: &SqlExpr) -> i64 {
    match e {
        SqlExpr::Value(sqlparser::ast::Value::Number(n, _)) => n.parse().unwrap_or(0),
        _ => 0,
    }
}

/// Computed-column projection (`spec.md` §4.7 item 8). Pass-through columns
/// keep their source name; aliased or expression items get a compiled slot.
fn wrap_project(plan: PlanNode, select: &Select, table_name: &str) -> Result<PlanNode, EngineError> {
    if select.projection.iter().any(|i| matches!(i, SelectItem::Wildcard(_))) {
        return Ok(plan);
    }
    let aggregate = is_aggregate_select(select);
    let mut columns = Vec::with_capacity(select.projection.len());
    for item in &select.projection {
        let (expr, name) = match item {
            SelectItem::UnnamedExpr(e) => (e.clone(), expr_default_name(e)),
            SelectItem::ExprWithAlias { expr, alias } => (expr.clone(), alias.value.to_lowercase()),
            _ => continue,
        };
        // MergeAggregate/CountOptimized already reduced their child to one row
        // per group, with the aggregate/group-by values sitting under their
        // own source names; read those back instead of recompiling the
        // aggregate function or group-by expression here.
        let compiled = if aggregate {
            let source = match &expr {
                SqlExpr::Function(f) if is_aggregate_function_name(&f.name.to_string()) => name.clone(),
                _ => expr_default_name(&expr),
            };
            compile_expr(&SqlExpr::Identifier(sqlparser::ast::Ident::new(source)), &EMPTY_SCHEMA())?
        } else {
            compile_expr(&expr, &EMPTY_SCHEMA())?
        };
        columns.push((name, compiled));
    }
    if columns.is_empty() {
        return Ok(plan);
    }
    Ok(PlanNode::Project(ProjectState {
        child: Box::new(plan),
        columns,
        entity: table_name.to_string(),
    }))
}

fn table_with_joins_name(from: &TableWithJoins) -> Result<String, EngineError> {
    object_name_from_factor(&from.relation)
}

fn object_name_from_factor(factor: &TableFactor) -> Result<String, EngineError> {
    match factor {
        TableFactor::Table { name, .. } => Ok(name.to_string().to_lowercase()),
        _ => Err(EngineError::OperationNotSupported("non-table FROM target".into())),
    }
}

// ---------------------------------------------------------------------------
// DML
// ---------------------------------------------------------------------------

async fn plan_insert(
    insert: &sqlparser::ast::Insert,
    ctx: &Arc<ExecContext>,
    options: &PlannerOptions,
) -> Result<PlanNode, EngineError> {
    let entity = insert.table_name.to_string().to_lowercase();
    if insert.columns.is_empty() {
        return Err(EngineError::Validation(
            "INSERT requires an explicit column list (no target schema is available to infer one)".into(),
        ));
    }
    let target_columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();

    let Some(source) = &insert.source else {
        return Err(EngineError::Validation("INSERT requires VALUES or SELECT".into()));
    };

    match source.body.as_ref() {
        SetExpr::Values(values) => {
            // INSERT VALUES: single row only here; multi-row VALUES would
            // drive one DmlExecute row per tuple, each evaluated against an
            // empty row (no source columns to read from).
            let row = values
                .rows
                .first()
                .ok_or_else(|| EngineError::Validation("INSERT VALUES requires at least one row".into()))?;
            if row.len() != target_columns.len() {
                return Err(EngineError::Validation(
                    "INSERT VALUES: value count does not match column list".into(),
                ));
            }
            let columns = target_columns
                .iter()
                .zip(row.iter())
                .map(|(name, expr)| Ok((name.clone(), compile_expr(expr, &EMPTY_SCHEMA())?)))
                .collect::<Result<Vec<_>, EngineError>>()?;
            let driving = single_empty_row_plan(&entity);
            Ok(PlanNode::DmlExecute(DmlExecuteState::new(
                driving,
                entity,
                DmlMode::Insert { columns },
                options.dml_row_cap,
                options.continue_on_error,
            )))
        }
        _ => {
            // INSERT … SELECT: ordinal mapping target-column ← source-column.
            let inner_plan = Box::pin(plan_query(source, ctx, options)).await?;
            let source_select = match source.body.as_ref() {
                SetExpr::Select(s) => Some(s.as_ref()),
                _ => None,
            };
            let source_names: Vec<String> = source_select
                .map(|s| s.projection.iter().map(item_output_name).collect())
                .unwrap_or_default();
            let columns: Vec<(String, CompiledExpr)> = target_columns
                .iter()
                .zip(source_names.iter().chain(std::iter::repeat(&String::new())))
                .map(|(target, source_col)| {
                    let ident_expr = SqlExpr::Identifier(sqlparser::ast::Ident::new(source_col.clone()));
                    Ok((target.clone(), compile_expr(&ident_expr, &EMPTY_SCHEMA())?))
                })
                .collect::<Result<Vec<_>, EngineError>>()?;
            Ok(PlanNode::DmlExecute(DmlExecuteState::new(
                inner_plan,
                entity,
                DmlMode::Insert { columns },
                options.dml_row_cap,
                options.continue_on_error,
            )))
        }
    }
}

fn single_empty_row_plan(_entity: &str) -> PlanNode {
    PlanNode::SingleRow(crate::plan::operators::SingleRowState::new())
}

async fn plan_update(
    table: &TableWithJoins,
    assignments: &[sqlparser::ast::Assignment],
    selection: Option<&SqlExpr>,
    ctx: &Arc<ExecContext>,
    options: &PlannerOptions,
) -> Result<PlanNode, EngineError> {
    let entity = table_with_joins_name(table)?;
    let id_column = primary_key_name(&entity);
    let set: Vec<(String, CompiledExpr)> = assignments
        .iter()
        .map(|a| {
            let name = assignment_target_name(&a.target);
            Ok((name, compile_expr(&a.value, &EMPTY_SCHEMA())?))
        })
        .collect::<Result<_, EngineError>>()?;

    let driving = build_driving_select(&entity, &id_column, &set.iter().map(|(n, _)| n.clone()).collect::<Vec<_>>(), selection, ctx, options).await?;

    Ok(PlanNode::DmlExecute(DmlExecuteState::new(
        driving,
        entity,
        DmlMode::Update { id_column, set },
        options.dml_row_cap,
        options.continue_on_error,
    )))
}

async fn plan_delete(
    delete: &sqlparser::ast::Delete,
    ctx: &Arc<ExecContext>,
    options: &PlannerOptions,
) -> Result<PlanNode, EngineError> {
    let tables = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    let table = tables
        .first()
        .ok_or_else(|| EngineError::Validation("DELETE requires a target table".into()))?;
    let entity = table_with_joins_name(table)?;
    let id_column = primary_key_name(&entity);
    let driving = build_driving_select(&entity, &id_column, &[], delete.selection.as_ref(), ctx, options).await?;
    Ok(PlanNode::DmlExecute(DmlExecuteState::new(
        driving,
        entity.clone(),
        DmlMode::Delete { id_column },
        options.dml_row_cap,
        options.continue_on_error,
    )))
}

/// MERGE is plan-only for now: the per-clause `UPDATE SET` / `INSERT` /
/// `DELETE` actions drive a summary row but no clause body is inspected
/// (`spec.md` §9 sanctions this as a starting mode). `on` and `clauses` are
/// accepted for API completeness and to validate statement shape, not parsed.
async fn plan_merge(
    table: &TableFactor,
    source: &TableFactor,
    on: &SqlExpr,
    clauses: &[sqlparser::ast::MergeClause],
    ctx: &Arc<ExecContext>,
    options: &PlannerOptions,
) -> Result<PlanNode, EngineError> {
    let entity = object_name_from_factor(table)?;
    let source_entity = object_name_from_factor(source)?;
    let id_column = primary_key_name(&entity);
    let match_column = id_column.clone();
    let _ = on; // ON-column equality is expressed through the driving SELECT's id_column below.
    let _ = clauses; // plan-only mode: clause bodies are not executed, only counted in the summary.

    let driving = build_driving_select(&source_entity, &id_column, &[match_column.clone()], None, ctx, options).await?;
    Ok(PlanNode::DmlExecute(DmlExecuteState::new(
        driving,
        entity,
        DmlMode::Merge {
            id_column,
            match_column,
            update_set: Vec::new(),
            insert_columns: Vec::new(),
            delete_on_no_source: false,
        },
        options.dml_row_cap,
        options.continue_on_error,
    )))
}

fn primary_key_name(entity: &str) -> String {
    format!("{entity}id")
}

fn assignment_target_name(target: &sqlparser::ast::AssignmentTarget) -> String {
    match target {
        sqlparser::ast::AssignmentTarget::ColumnName(name) => name.to_string().to_lowercase(),
        sqlparser::ast::AssignmentTarget::Tuple(names) => names
            .first()
            .map(|n| n.to_string().to_lowercase())
            .unwrap_or_default(),
    }
}

/// The (primary key + referenced columns) driving SELECT every UPDATE,
/// DELETE, and MERGE plans against (`spec.md` §4.5). Built and re-parsed as
/// SQL text rather than assembled as an AST literal, matching how this
/// engine always gets its `Select` nodes from `sqlparser` in the first
/// place.
async fn build_driving_select(
    entity: &str,
    id_column: &str,
    extra_columns: &[String],
    selection: Option<&SqlExpr>,
    ctx: &Arc<ExecContext>,
    options: &PlannerOptions,
) -> Result<PlanNode, EngineError> {
    let mut columns = vec![id_column.to_string()];
    for col in extra_columns {
        if col != id_column {
            columns.push(col.clone());
        }
    }
    let mut sql = format!("SELECT {} FROM {}", columns.join(", "), entity);
    if let Some(expr) = selection {
        sql.push_str(" WHERE ");
        sql.push_str(&expr.to_string());
    }

    let dialect = sqlparser::dialect::DuckDbDialect {};
    let stmts = sqlparser::parser::Parser::parse_sql(&dialect, &sql)
        .map_err(|e| EngineError::Validation(format!("internal driving SELECT failed to parse: {e}")))?;
    let Some(Statement::Query(query)) = stmts.into_iter().next() else {
        return Err(EngineError::Validation("internal driving SELECT did not parse to a query".into()));
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Err(EngineError::Validation("internal driving SELECT did not parse to a SELECT".into()));
    };
    build_single_scan(select, entity, select.selection.as_ref(), ctx, options).await
}
