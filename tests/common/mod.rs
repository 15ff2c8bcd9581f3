//! Shared fakes for the collaborator traits, driving the planner/executor
//! against in-memory tables instead of a real Dataverse/FetchXML backend.
//!
//! The FetchXML "backend" here does the minimum needed to behave like one:
//! `EchoTranspiler` hands plain SELECTs through as their own rendered text,
//! which `FakeFetchXmlClient` re-parses with `sqlparser` and filters
//! in-memory rows against with the crate's own predicate compiler.
//! Aggregate-shaped SELECTs instead render into a small `<fetch
//! aggregate="true">` dialect carrying one `<attribute>` per group/aggregate
//! column, which `FakeFetchXmlClient::execute_aggregate` reduces into true
//! pre-aggregated partial rows per group — the same contract a real
//! partitioned aggregate scan depends on.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Datelike;
use sqlparser::ast::{
    Expr as SqlExpr, Function, FunctionArg, FunctionArgExpr, FunctionArguments, GroupByExpr, Select,
    SelectItem, SetExpr, Statement, TableFactor,
};
use sqlparser::dialect::DuckDbDialect;
use sqlparser::parser::Parser;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use dataverse_sql_engine::collaborators::{
    ConnectionHandle, ConnectionPool, FetchPage, FetchXmlClient, MetadataClient,
    RecordWriteClient, SqlClient, ThrottleTracker, Transpiler, WriteOutcome,
};
use dataverse_sql_engine::error::EngineError;
use dataverse_sql_engine::expr::{compile_predicate, expr_default_name};
use dataverse_sql_engine::plan::operators::columns_from_rows;
use dataverse_sql_engine::script::scope::VariableScope;
use dataverse_sql_engine::value::{Column, Raw, Row, Value};

pub fn row(entity: &str, fields: &[(&str, Value)]) -> Row {
    let mut r = Row::new(entity);
    for (name, value) in fields {
        r.insert(*name, value.clone());
    }
    r
}

fn extract_between(s: &str, start: &str, end: &str) -> Option<String> {
    let i = s.find(start)? + start.len();
    let j = s[i..].find(end)?;
    Some(s[i..i + j].to_string())
}

fn extract_all_between(s: &str, start: &str, end: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut offset = 0;
    while let Some(i) = s[offset..].find(start) {
        let value_start = offset + i + start.len();
        let Some(j) = s[value_start..].find(end) else { break };
        out.push(s[value_start..value_start + j].to_string());
        offset = value_start + j + end.len();
    }
    out
}

fn table_name_from_select(select: &sqlparser::ast::Select) -> String {
    select
        .from
        .first()
        .and_then(|t| match &t.relation {
            TableFactor::Table { name, .. } => Some(name.to_string().to_lowercase()),
            _ => None,
        })
        .unwrap_or_default()
}

/// Plain SELECTs pass through as their own rendered text, which
/// `FakeFetchXmlClient::execute_select` re-parses with `sqlparser`.
/// Aggregate-shaped SELECTs render into a `<fetch aggregate="true">` shell
/// carrying one `<attribute>` per group/aggregate column, the same shape a
/// real SQL->FetchXML transpiler would emit, so `execute_aggregate` can
/// return true pre-aggregated partial rows instead of raw records.
pub struct EchoTranspiler;

#[async_trait]
impl Transpiler for EchoTranspiler {
    async fn transpile(&self, select_sql: &str) -> Result<(String, Vec<String>), EngineError> {
        let dialect = DuckDbDialect {};
        let stmts = Parser::parse_sql(&dialect, select_sql)
            .map_err(|e| EngineError::Validation(format!("echo transpiler failed to parse: {e}")))?;
        let Some(Statement::Query(query)) = stmts.into_iter().next() else {
            return Ok((select_sql.to_string(), Vec::new()));
        };
        let SetExpr::Select(select) = query.body.as_ref() else {
            return Ok((select_sql.to_string(), Vec::new()));
        };
        if !is_aggregate_shaped(select) {
            return Ok((select_sql.to_string(), Vec::new()));
        }
        Ok((render_aggregate_fetchxml(select), Vec::new()))
    }
}

fn is_aggregate_shaped(select: &Select) -> bool {
    select.projection.iter().any(|item| {
        let expr = match item {
            SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } => e,
            _ => return false,
        };
        matches!(expr, SqlExpr::Function(f) if is_aggregate_fn(&f.name.to_string()))
    })
}

fn is_aggregate_fn(name: &str) -> bool {
    matches!(
        name.to_uppercase().as_str(),
        "SUM" | "COUNT" | "AVG" | "MIN" | "MAX" | "STDEV" | "STDDEV" | "VAR" | "VARIANCE"
    )
}

fn function_first_arg_name(f: &Function) -> Option<String> {
    if let FunctionArguments::List(list) = &f.args {
        for a in &list.args {
            if let FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) = a {
                return Some(expr_default_name(e));
            }
        }
    }
    None
}

/// Renders the group/aggregate columns of an aggregate-shaped SELECT into
/// `<attribute>` elements. AVG and STDEV/VAR never request their op
/// directly — they request the companion sum/count, or count/mean/m2,
/// columns their merge step needs, same as a real backend that has no
/// distributed-safe avg/variance aggregate of its own.
fn render_aggregate_fetchxml(select: &Select) -> String {
    let table = table_name_from_select(select);
    let mut attrs = String::new();

    let group_exprs: Vec<&SqlExpr> = match &select.group_by {
        GroupByExpr::Expressions(exprs, _) => exprs.iter().collect(),
        GroupByExpr::All(_) => Vec::new(),
    };
    for e in &group_exprs {
        let alias = expr_default_name(e);
        match e {
            SqlExpr::Function(f) if f.name.to_string().eq_ignore_ascii_case("year") => {
                if let Some(col) = function_first_arg_name(f) {
                    attrs.push_str(&format!(
                        "<attribute name=\"{col}\" groupby=\"true\" dategrouping=\"year\" alias=\"{alias}\" />"
                    ));
                }
            }
            _ => {
                let col = expr_default_name(e);
                attrs.push_str(&format!("<attribute name=\"{col}\" groupby=\"true\" alias=\"{alias}\" />"));
            }
        }
    }

    for item in &select.projection {
        let (expr, out_name) = match item {
            SelectItem::UnnamedExpr(e) => (e, expr_default_name(e)),
            SelectItem::ExprWithAlias { expr, alias } => (expr, alias.value.to_lowercase()),
            _ => continue,
        };
        let SqlExpr::Function(f) = expr else { continue };
        let name = f.name.to_string().to_uppercase();
        let src = function_first_arg_name(f).unwrap_or_default();
        match name.as_str() {
            "SUM" => attrs.push_str(&format!("<attribute name=\"{src}\" aggregate=\"sum\" alias=\"{out_name}\" />")),
            "COUNT" => attrs.push_str(&format!("<attribute name=\"{src}\" aggregate=\"count\" alias=\"{out_name}\" />")),
            "MIN" => attrs.push_str(&format!("<attribute name=\"{src}\" aggregate=\"min\" alias=\"{out_name}\" />")),
            "MAX" => attrs.push_str(&format!("<attribute name=\"{src}\" aggregate=\"max\" alias=\"{out_name}\" />")),
            "AVG" => {
                attrs.push_str(&format!(
                    "<attribute name=\"{src}\" aggregate=\"sum\" alias=\"{out_name}__sum\" />"
                ));
                attrs.push_str(&format!(
                    "<attribute name=\"{src}\" aggregate=\"count\" alias=\"{out_name}__count\" />"
                ));
            }
            "STDEV" | "STDDEV" | "VAR" | "VARIANCE" => {
                attrs.push_str(&format!(
                    "<attribute name=\"{src}\" aggregate=\"count\" alias=\"{out_name}__count\" />"
                ));
                attrs.push_str(&format!(
                    "<attribute name=\"{src}\" aggregate=\"avg\" alias=\"{out_name}__mean\" />"
                ));
                attrs.push_str(&format!(
                    "<attribute name=\"{src}\" aggregate=\"var_m2\" alias=\"{out_name}__m2\" />"
                ));
            }
            _ => {}
        }
    }

    format!("<fetch aggregate=\"true\"><entity name=\"{table}\">{attrs}<filter></filter></entity></fetch>")
}

/// In-memory FetchXML backend. Understands two "dialects" of fetchxml
/// string: a plain re-parseable SELECT (from `EchoTranspiler`) and the
/// planner's fixed `<fetch aggregate="true">` partition-scan template.
pub struct FakeFetchXmlClient {
    pub tables: Mutex<HashMap<String, Vec<Row>>>,
    pub page_size: usize,
    pub overflow_threshold: Option<usize>,
    pub calls: AtomicU32,
}

impl FakeFetchXmlClient {
    pub fn new() -> Self {
        FakeFetchXmlClient {
            tables: Mutex::new(HashMap::new()),
            page_size: 10_000,
            overflow_threshold: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_table(mut self, name: &str, rows: Vec<Row>) -> Self {
        self.tables.get_mut().unwrap().insert(name.to_lowercase(), rows);
        self
    }

    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    pub fn with_overflow_threshold(mut self, n: usize) -> Self {
        self.overflow_threshold = Some(n);
        self
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }

    fn execute_select(&self, sql: &str, page: Option<u32>, include_count: bool) -> Result<FetchPage, EngineError> {
        let dialect = DuckDbDialect {};
        let stmts = Parser::parse_sql(&dialect, sql)
            .map_err(|e| EngineError::Validation(format!("fake backend failed to parse fetchxml: {e}")))?;
        let Some(Statement::Query(query)) = stmts.into_iter().next() else {
            return Err(EngineError::Validation("fake backend: expected a query".into()));
        };
        let SetExpr::Select(select) = query.body.as_ref() else {
            return Err(EngineError::Validation("fake backend: expected a SELECT".into()));
        };
        let table = table_name_from_select(select);
        let source = self.tables.lock().unwrap().get(&table).cloned().unwrap_or_default();
        let predicate = select
            .selection
            .as_ref()
            .map(|e| compile_predicate(e, &HashMap::new()))
            .transpose()?;
        let scope = VariableScope::new();
        let mut matched = Vec::with_capacity(source.len());
        for r in source {
            let keep = match &predicate {
                Some(p) => p.eval_bool(&r, &scope)?,
                None => true,
            };
            if keep {
                matched.push(r);
            }
        }
        Ok(self.paginate(matched, page, include_count))
    }

    fn paginate(&self, rows: Vec<Row>, page: Option<u32>, include_count: bool) -> FetchPage {
        let page_number = page.unwrap_or(1).max(1);
        let start = ((page_number - 1) as usize) * self.page_size;
        let end = (start + self.page_size).min(rows.len());
        let columns = columns_from_rows(&rows);
        let page_rows = if start < rows.len() { rows[start..end].to_vec() } else { Vec::new() };
        let more_records = end < rows.len();
        FetchPage {
            total_count: if include_count { Some(rows.len() as u64) } else { None },
            rows: page_rows,
            columns,
            more_records,
            paging_cookie: if more_records { Some(format!("cookie-{page_number}")) } else { None },
            page_number,
        }
    }

    fn execute_aggregate(&self, fetchxml: &str) -> Result<FetchPage, EngineError> {
        let entity = extract_between(fetchxml, "<entity name=\"", "\"")
            .ok_or_else(|| EngineError::Validation("fake backend: aggregate fetchxml missing entity name".into()))?;
        let date_attr = extract_between(fetchxml, "condition attribute=\"", "\"").unwrap_or_else(|| "createdon".to_string());
        let values = extract_all_between(fetchxml, "value=\"", "\"");
        let date_window = if values.len() >= 2 {
            let min_date = chrono::DateTime::parse_from_rfc3339(&values[0])
                .map_err(|e| EngineError::Validation(format!("fake backend: bad min date: {e}")))?;
            let max_date = chrono::DateTime::parse_from_rfc3339(&values[1])
                .map_err(|e| EngineError::Validation(format!("fake backend: bad max date: {e}")))?;
            Some((min_date, max_date))
        } else {
            None
        };

        let source = self.tables.lock().unwrap().get(&entity).cloned().unwrap_or_default();
        let mut matched = Vec::new();
        for r in source {
            let in_window = match date_window {
                None => true,
                // Half-open to match the real `on-or-after`/`lt` condition pair the
                // planner emits: a boundary timestamp belongs to exactly one partition.
                Some((min_date, max_date)) => match r.get(&date_attr).map(|v| &v.raw) {
                    Some(Raw::Timestamp(ts)) => *ts >= min_date && *ts < max_date,
                    _ => false,
                },
            };
            if in_window {
                matched.push(r);
            }
        }
        if let Some(limit) = self.overflow_threshold {
            if matched.len() > limit {
                return Err(EngineError::AggregateOverflow);
            }
        }

        let attrs = parse_attribute_defs(fetchxml);
        let group_attrs: Vec<&AttributeDef> = attrs.iter().filter(|a| a.groupby).collect();
        let agg_attrs: Vec<&AttributeDef> = attrs.iter().filter(|a| a.aggregate.is_some()).collect();

        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<Row>> = HashMap::new();
        for r in matched {
            let key = group_attrs
                .iter()
                .map(|a| group_value_text(&r, a))
                .collect::<Vec<_>>()
                .join("\u{0}");
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push(r);
        }
        if group_attrs.is_empty() && groups.is_empty() {
            // No rows matched, but a bare aggregate (no GROUP BY) still
            // needs to emit a single all-null/zero row, same as SQL.
            order.push(String::new());
            groups.insert(String::new(), Vec::new());
        }

        let rows: Vec<Row> = order
            .iter()
            .map(|key| {
                let group_rows = &groups[key];
                let mut out = Row::new(entity.clone());
                if let Some(first) = group_rows.first() {
                    for a in &group_attrs {
                        out.insert(a.alias.clone(), group_value(first, a));
                    }
                }
                for a in &agg_attrs {
                    out.insert(a.alias.clone(), aggregate_value(group_rows, a));
                }
                out
            })
            .collect();
        let columns = columns_from_rows(&rows);
        Ok(FetchPage {
            rows,
            columns,
            more_records: false,
            paging_cookie: None,
            page_number: 1,
            total_count: None,
        })
    }
}

struct AttributeDef {
    name: String,
    aggregate: Option<String>,
    alias: String,
    groupby: bool,
    dategrouping: Option<String>,
}

fn parse_attribute_defs(fetchxml: &str) -> Vec<AttributeDef> {
    let mut out = Vec::new();
    let mut offset = 0;
    while let Some(i) = fetchxml[offset..].find("<attribute ") {
        let start = offset + i;
        let Some(end_rel) = fetchxml[start..].find("/>") else { break };
        let tag = &fetchxml[start..start + end_rel];
        let name = extract_between(tag, "name=\"", "\"").unwrap_or_default();
        let alias = extract_between(tag, "alias=\"", "\"").unwrap_or_else(|| name.clone());
        out.push(AttributeDef {
            name,
            aggregate: extract_between(tag, "aggregate=\"", "\""),
            alias,
            groupby: extract_between(tag, "groupby=\"", "\"").as_deref() == Some("true"),
            dategrouping: extract_between(tag, "dategrouping=\"", "\""),
        });
        offset = start + end_rel + 2;
    }
    out
}

fn group_value(row: &Row, attr: &AttributeDef) -> Value {
    match attr.dategrouping.as_deref() {
        Some("year") => match row.get(&attr.name).map(|v| &v.raw) {
            Some(Raw::Timestamp(ts)) => Value::int(ts.year() as i64),
            _ => Value::null(),
        },
        _ => row.get(&attr.name).cloned().unwrap_or_else(Value::null),
    }
}

fn group_value_text(row: &Row, attr: &AttributeDef) -> String {
    group_value(row, attr).display_text()
}

fn numeric_values(rows: &[Row], column: &str) -> Vec<f64> {
    rows.iter()
        .filter_map(|r| r.get(column))
        .filter(|v| !v.is_null())
        .filter_map(|v| v.display_text().parse::<f64>().ok())
        .collect()
}

/// Computes one partition's partial value for a single aggregate attribute.
/// `var_m2` is a fake-backend-only aggregate kind (no real FetchXML
/// equivalent): the sum of squared deviations from this partition's own
/// mean, which is exactly what `combine_partial_stats` expects to fold
/// across partitions.
fn aggregate_value(rows: &[Row], attr: &AttributeDef) -> Value {
    let values = numeric_values(rows, &attr.name);
    match attr.aggregate.as_deref() {
        Some("sum") => Value::double(values.iter().sum()),
        Some("count") => Value::int(values.len() as i64),
        Some("min") => values.iter().cloned().min_by(|a, b| a.partial_cmp(b).unwrap()).map(Value::double).unwrap_or_else(Value::null),
        Some("max") => values.iter().cloned().max_by(|a, b| a.partial_cmp(b).unwrap()).map(Value::double).unwrap_or_else(Value::null),
        Some("avg") => {
            if values.is_empty() {
                Value::null()
            } else {
                Value::double(values.iter().sum::<f64>() / values.len() as f64)
            }
        }
        Some("var_m2") => {
            if values.is_empty() {
                Value::double(0.0)
            } else {
                let mean = values.iter().sum::<f64>() / values.len() as f64;
                Value::double(values.iter().map(|v| (v - mean) * (v - mean)).sum())
            }
        }
        _ => Value::null(),
    }
}

#[async_trait]
impl FetchXmlClient for FakeFetchXmlClient {
    async fn execute(
        &self,
        fetchxml: &str,
        page: Option<u32>,
        _cookie: Option<&str>,
        include_count: bool,
        _cancel: &CancellationToken,
    ) -> Result<FetchPage, EngineError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if fetchxml.trim_start().starts_with("<fetch aggregate=\"true\">") {
            self.execute_aggregate(fetchxml)
        } else {
            self.execute_select(fetchxml, page, include_count)
        }
    }
}

/// A backend-SQL passthrough client; unused by most tests but required to
/// satisfy `ExecContext::new`'s signature.
pub struct FakeSqlClient;

#[async_trait]
impl SqlClient for FakeSqlClient {
    async fn execute(
        &self,
        _sql: &str,
        _max_rows: Option<u64>,
        _cancel: &CancellationToken,
    ) -> Result<(Vec<Column>, Vec<Row>), EngineError> {
        Ok((Vec::new(), Vec::new()))
    }
}

pub struct FakeMetadataClient {
    pub counts: HashMap<String, u64>,
}

impl FakeMetadataClient {
    pub fn new() -> Self {
        FakeMetadataClient { counts: HashMap::new() }
    }

    pub fn with_count(mut self, entity: &str, count: u64) -> Self {
        self.counts.insert(entity.to_lowercase(), count);
        self
    }
}

#[async_trait]
impl MetadataClient for FakeMetadataClient {
    async fn query_entities(&self, _table: &str) -> Result<(Vec<Column>, Vec<Row>), EngineError> {
        Ok((Vec::new(), Vec::new()))
    }

    async fn entity_record_count(&self, entity: &str) -> Result<Option<u64>, EngineError> {
        Ok(self.counts.get(&entity.to_lowercase()).copied())
    }
}

pub struct FakeConnectionPool {
    pub capacity: usize,
}

#[async_trait]
impl ConnectionPool for FakeConnectionPool {
    async fn borrow(&self, _cancel: &CancellationToken) -> Result<ConnectionHandle, EngineError> {
        Ok(ConnectionHandle { profile_name: "test-profile".to_string() })
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn invalidate(&self, _profile_name: &str) {}
}

pub struct FakeThrottleTracker;

impl ThrottleTracker for FakeThrottleTracker {
    fn observe(&self, _retry_after: Option<std::time::Duration>) {}

    fn advise(&self) -> Option<std::time::Duration> {
        None
    }
}

/// Records every write so DML tests can assert on what was sent, and can be
/// told to fail writes for specific entities to exercise `continue_on_error`.
pub struct FakeRecordWriteClient {
    pub created: Mutex<Vec<(String, HashMap<String, Value>)>>,
    pub updated: Mutex<Vec<(String, Uuid, HashMap<String, Value>)>>,
    pub deleted: Mutex<Vec<(String, Uuid)>>,
    pub fail_entities: Mutex<HashSet<String>>,
}

impl FakeRecordWriteClient {
    pub fn new() -> Self {
        FakeRecordWriteClient {
            created: Mutex::new(Vec::new()),
            updated: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            fail_entities: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_on(&self, entity: &str) {
        self.fail_entities.lock().unwrap().insert(entity.to_lowercase());
    }
}

#[async_trait]
impl RecordWriteClient for FakeRecordWriteClient {
    async fn create(
        &self,
        entity: &str,
        values: &HashMap<String, Value>,
        _cancel: &CancellationToken,
    ) -> Result<WriteOutcome, EngineError> {
        if self.fail_entities.lock().unwrap().contains(&entity.to_lowercase()) {
            return Err(EngineError::Validation(format!("fake backend: forced create failure for {entity}")));
        }
        self.created.lock().unwrap().push((entity.to_string(), values.clone()));
        Ok(WriteOutcome { id: Some(Uuid::new_v4()) })
    }

    async fn update(
        &self,
        entity: &str,
        id: Uuid,
        values: &HashMap<String, Value>,
        _cancel: &CancellationToken,
    ) -> Result<WriteOutcome, EngineError> {
        if self.fail_entities.lock().unwrap().contains(&entity.to_lowercase()) {
            return Err(EngineError::Validation(format!("fake backend: forced update failure for {entity}")));
        }
        self.updated.lock().unwrap().push((entity.to_string(), id, values.clone()));
        Ok(WriteOutcome { id: Some(id) })
    }

    async fn delete(&self, entity: &str, id: Uuid, _cancel: &CancellationToken) -> Result<(), EngineError> {
        if self.fail_entities.lock().unwrap().contains(&entity.to_lowercase()) {
            return Err(EngineError::Validation(format!("fake backend: forced delete failure for {entity}")));
        }
        self.deleted.lock().unwrap().push((entity.to_string(), id));
        Ok(())
    }
}

/// Builds an `ExecContext` wired to fresh fakes. Callers who need to inspect
/// call counts or recorded writes after execution should keep their own
/// `Arc` clones of the fakes rather than reaching back through the context.
pub fn test_context(
    fetchxml: Arc<FakeFetchXmlClient>,
    metadata: Arc<FakeMetadataClient>,
    write: Arc<FakeRecordWriteClient>,
    pool_capacity: usize,
) -> Arc<dataverse_sql_engine::context::ExecContext> {
    Arc::new(dataverse_sql_engine::context::ExecContext::new(
        fetchxml,
        Some(Arc::new(FakeSqlClient)),
        metadata,
        write,
        Arc::new(FakeConnectionPool { capacity: pool_capacity }),
        Arc::new(FakeThrottleTracker),
        Arc::new(EchoTranspiler),
        dataverse_sql_engine::options::PlannerOptions::default(),
    ))
}

pub fn parse_statement(sql: &str) -> Statement {
    let dialect = DuckDbDialect {};
    Parser::parse_sql(&dialect, sql)
        .expect("test SQL should parse")
        .remove(0)
}

pub fn uuid_value(id: Uuid) -> Value {
    Value::string(id.to_string())
}
