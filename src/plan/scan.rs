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
//! Leaf operators that pull rows from a backend collaborator, per
//! `spec.md` §2's scan family.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::context::{with_transient_retry, ExecContext};
use crate::error::EngineError;
use crate::plan::node::PlanNode;
use crate::script::scope::VariableScope;
use crate::value::{Column, Row};

/// Streams rows from a single FetchXML query, paging automatically unless
/// a fixed page/cookie was pinned by the caller (`spec.md` §2.1).
pub struct FetchXmlScanState {
    pub fetchxml: String,
    pub auto_page: bool,
    pub row_cap: Option<u64>,
    pub include_total_count: bool,
    buffer: VecDeque<Row>,
    columns: Vec<Column>,
    current_page: Option<u32>,
    current_cookie: Option<String>,
    more_records: bool,
    started: bool,
    rows_yielded: u64,
}

impl FetchXmlScanState {
    pub fn new(
        fetchxml: String,
        auto_page: bool,
        starting_page: Option<u32>,
        starting_cookie: Option<String>,
        row_cap: Option<u64>,
        include_total_count: bool,
    ) -> Self {
        FetchXmlScanState {
            fetchxml,
            auto_page,
            row_cap,
            include_total_count,
            buffer: VecDeque::new(),
            columns: Vec::new(),
            current_page: starting_page,
            current_cookie: starting_cookie,
            more_records: true,
            started: false,
            rows_yielded: 0,
        }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    async fn fetch_next_page(&mut self, ctx: &Arc<ExecContext>) -> Result<(), EngineError> {
        if ctx.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let page = self.current_page;
        let cookie = self.current_cookie.clone();
        let result = with_transient_retry(ctx, || {
            ctx.fetchxml_client.execute(
                &self.fetchxml,
                page,
                cookie.as_deref(),
                self.include_total_count,
                &ctx.cancel,
            )
        })
        .await?;
        ctx.stats
            .backend_round_trips
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        ctx.stats
            .rows_scanned
            .fetch_add(result.rows.len() as u64, std::sync::atomic::Ordering::Relaxed);
        ctx.stats.paging.record(
            result.paging_cookie.clone(),
            result.page_number,
            result.total_count,
        );
        self.columns = result.columns;
        self.more_records = result.more_records && self.auto_page;
        self.current_page = Some(result.page_number + 1);
        self.current_cookie = result.paging_cookie;
        self.buffer.extend(result.rows);
        Ok(())
    }

    pub async fn next_row(&mut self, ctx: &Arc<ExecContext>) -> Result<Option<Row>, EngineError> {
        loop {
            if let Some(cap) = self.row_cap {
                if self.rows_yielded >= cap {
                    return Ok(None);
                }
            }
            if let Some(row) = self.buffer.pop_front() {
                self.rows_yielded += 1;
                ctx.stats
                    .rows_returned
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return Ok(Some(row));
            }
            if self.started && !self.more_records {
                return Ok(None);
            }
            self.started = true;
            self.fetch_next_page(ctx).await?;
            if self.buffer.is_empty() && !self.more_records {
                return Ok(None);
            }
        }
    }
}

/// Wraps a `FetchXmlScan` carrying an aggregate FetchXML; on
/// `AggregateOverflow` from the backend, binary-splits the originating date
/// window and recurses rather than surfacing the error (`spec.md` §2.2).
pub struct AdaptiveAggregateScanState {
    pub base_fetchxml_template: String,
    pub date_filter_attribute: String,
    pub min_date: chrono::DateTime<chrono::FixedOffset>,
    pub max_date: chrono::DateTime<chrono::FixedOffset>,
    pub depth: u32,
    pub depth_cap: u32,
    active_scan: Option<Box<FetchXmlScanState>>,
    split: Option<(Box<AdaptiveAggregateScanState>, Box<AdaptiveAggregateScanState>)>,
    split_side: u8,
}

impl AdaptiveAggregateScanState {
    pub fn new(
        base_fetchxml_template: String,
        date_filter_attribute: String,
        min_date: chrono::DateTime<chrono::FixedOffset>,
        max_date: chrono::DateTime<chrono::FixedOffset>,
        depth_cap: u32,
    ) -> Self {
        AdaptiveAggregateScanState {
            base_fetchxml_template,
            date_filter_attribute,
            min_date,
            max_date,
            depth: 0,
            depth_cap,
            active_scan: None,
            split: None,
            split_side: 0,
        }
    }

    fn render_fetchxml(&self) -> String {
        // The template carries a `{date_filter}` placeholder the planner
        // fills with the window's range predicate before this scan runs.
        // Half-open `[min_date, max_date)`: `on-or-after` is inclusive, `lt`
        // is strict, so a record landing exactly on a tick boundary belongs
        // to exactly one partition.
        let filter = format!(
            "<condition attribute=\"{}\" operator=\"on-or-after\" value=\"{}\" /><condition attribute=\"{}\" operator=\"lt\" value=\"{}\" />",
            self.date_filter_attribute,
            self.min_date.to_rfc3339(),
            self.date_filter_attribute,
            self.max_date.to_rfc3339(),
        );
        self.base_fetchxml_template.replace("{date_filter}", &filter)
    }

    fn split_children(&self) -> (AdaptiveAggregateScanState, AdaptiveAggregateScanState) {
        let mid = self.min_date + (self.max_date - self.min_date) / 2;
        let left = AdaptiveAggregateScanState::new(
            self.base_fetchxml_template.clone(),
            self.date_filter_attribute.clone(),
            self.min_date,
            mid,
            self.depth_cap,
        );
        let mut right = AdaptiveAggregateScanState::new(
            self.base_fetchxml_template.clone(),
            self.date_filter_attribute.clone(),
            mid,
            self.max_date,
            self.depth_cap,
        );
        right.depth = self.depth + 1;
        let mut left = left;
        left.depth = self.depth + 1;
        (left, right)
    }

    pub fn next_row<'a>(
        &'a mut self,
        ctx: &'a Arc<ExecContext>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Option<Row>, EngineError>> + Send + 'a>> {
        Box::pin(async move {
            if let Some((left, right)) = &mut self.split {
                if self.split_side == 0 {
                    match left.next_row(ctx).await? {
                        Some(r) => return Ok(Some(r)),
                        None => self.split_side = 1,
                    }
                }
                return right.next_row(ctx).await;
            }

            if self.active_scan.is_none() {
                self.active_scan = Some(Box::new(FetchXmlScanState::new(
                    self.render_fetchxml(),
                    true,
                    None,
                    None,
                    None,
                    false,
                )));
            }
            let scan = self.active_scan.as_mut().unwrap();
            match scan.next_row(ctx).await {
                Ok(row) => Ok(row),
                Err(EngineError::AggregateOverflow) if self.depth < self.depth_cap => {
                    let (left, right) = self.split_children();
                    self.split = Some((Box::new(left), Box::new(right)));
                    self.split_side = 0;
                    self.active_scan = None;
                    self.next_row(ctx).await
                }
                Err(EngineError::AggregateOverflow) => Err(EngineError::AggregateOverflow),
                Err(e) => Err(e),
            }
        })
    }
}

/// Runs a child scan on a background task, keeping a bounded buffer of
/// already-fetched rows ready for the consumer (`spec.md` §2.3).
pub struct PrefetchScanState {
    pub child: Box<PlanNode>,
    buffer: VecDeque<Row>,
    capacity: usize,
    exhausted: bool,
}

impl PrefetchScanState {
    pub fn new(child: PlanNode, capacity: usize) -> Self {
        PrefetchScanState {
            child: Box::new(child),
            buffer: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            exhausted: false,
        }
    }

    pub async fn next_row(
        &mut self,
        ctx: &Arc<ExecContext>,
        scope: &VariableScope,
    ) -> Result<Option<Row>, EngineError> {
        while self.buffer.len() < self.capacity && !self.exhausted {
            match self.child.next_row(ctx, scope).await? {
                Some(row) => self.buffer.push_back(row),
                None => {
                    self.exhausted = true;
                    break;
                }
            }
        }
        Ok(self.buffer.pop_front())
    }
}

/// Forwards a statement to the secondary SQL wire protocol unchanged
/// (`spec.md` §2.4): used for backend-SQL passthrough routing.
pub struct BackendSqlScanState {
    pub sql: String,
    pub max_rows: Option<u64>,
    rows: Option<VecDeque<Row>>,
    pub columns: Vec<Column>,
}

impl BackendSqlScanState {
    pub fn new(sql: String, max_rows: Option<u64>) -> Self {
        BackendSqlScanState {
            sql,
            max_rows,
            rows: None,
            columns: Vec::new(),
        }
    }

    pub async fn next_row(&mut self, ctx: &Arc<ExecContext>) -> Result<Option<Row>, EngineError> {
        if self.rows.is_none() {
            let client = ctx
                .sql_client
                .as_ref()
                .ok_or_else(|| EngineError::OperationNotSupported("no secondary SQL client configured".into()))?;
            let (columns, rows) = client.execute(&self.sql, self.max_rows, &ctx.cancel).await?;
            self.columns = columns;
            ctx.stats
                .backend_round_trips
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.rows = Some(rows.into());
        }
        Ok(self.rows.as_mut().unwrap().pop_front())
    }
}

/// Resolves the virtual `metadata.*` namespace (`spec.md` §2.5).
pub struct MetadataScanState {
    pub table: String,
    rows: Option<VecDeque<Row>>,
    pub columns: Vec<Column>,
}

impl MetadataScanState {
    pub fn new(table: String) -> Self {
        MetadataScanState {
            table,
            rows: None,
            columns: Vec::new(),
        }
    }

    pub async fn next_row(&mut self, ctx: &Arc<ExecContext>) -> Result<Option<Row>, EngineError> {
        if self.rows.is_none() {
            let (columns, rows) = ctx.metadata_client.query_entities(&self.table).await?;
            self.columns = columns;
            self.rows = Some(rows.into());
        }
        Ok(self.rows.as_mut().unwrap().pop_front())
    }
}

/// `COUNT(*)` fast path: consults the metadata client's cheap count before
/// falling back to a full aggregate scan (`spec.md` §4.7 item 3).
pub struct CountOptimizedState {
    pub entity: String,
    pub fallback: Box<PlanNode>,
    pub output_column: String,
    resolved: bool,
    emitted: bool,
}

impl CountOptimizedState {
    pub fn new(entity: String, fallback: PlanNode, output_column: String) -> Self {
        CountOptimizedState {
            entity,
            fallback: Box::new(fallback),
            output_column,
            resolved: false,
            emitted: false,
        }
    }

    pub async fn next_row(
        &mut self,
        ctx: &Arc<ExecContext>,
        scope: &VariableScope,
    ) -> Result<Option<Row>, EngineError> {
        if self.emitted {
            return Ok(None);
        }
        if !self.resolved {
            self.resolved = true;
            if let Some(count) = ctx.metadata_client.entity_record_count(&self.entity).await? {
                self.emitted = true;
                let mut row = Row::new(self.entity.clone());
                row.insert(self.output_column.clone(), crate::value::Value::int(count as i64));
                return Ok(Some(row));
            }
        }
        let row = self.fallback.next_row(ctx, scope).await?;
        if row.is_none() {
            self.emitted = true;
        }
        Ok(row)
    }
}
