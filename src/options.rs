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
//! Planner configuration, per `spec.md` §6.

/// All fields optional; the planner falls back to documented defaults.
#[derive(Debug, Clone, Default)]
pub struct PlannerOptions {
    pub pool_capacity: Option<usize>,
    pub use_backend_sql_passthrough: bool,
    pub explain_only: bool,
    pub max_rows: Option<u64>,
    pub page_number: Option<u32>,
    pub paging_cookie: Option<String>,
    pub include_count: bool,
    /// Required for passthrough routing — the original SQL text to forward.
    pub original_sql: Option<String>,
    pub estimated_record_count: Option<u64>,
    pub min_date: Option<chrono::DateTime<chrono::FixedOffset>>,
    pub max_date: Option<chrono::DateTime<chrono::FixedOffset>>,
    pub aggregate_record_limit: Option<u64>,
    pub max_records_per_partition: Option<u64>,
    pub dml_row_cap: Option<u64>,
    pub enable_prefetch: bool,
    pub prefetch_buffer_size: Option<usize>,
    /// DML continues past per-record write failures, tallying them into the
    /// summary row's `errors` count instead of aborting the statement.
    pub continue_on_error: bool,
}

pub const DEFAULT_AGGREGATE_RECORD_LIMIT: u64 = 50_000;
pub const DEFAULT_MAX_RECORDS_PER_PARTITION: u64 = 40_000;
pub const DEFAULT_PREFETCH_BUFFER_SIZE: usize = 2;
pub const DEFAULT_WHILE_ITERATION_CAP: u64 = 10_000;
pub const ADAPTIVE_SPLIT_DEPTH_CAP: u32 = 16;

impl PlannerOptions {
    pub fn aggregate_record_limit(&self) -> u64 {
        self.aggregate_record_limit.unwrap_or(DEFAULT_AGGREGATE_RECORD_LIMIT)
    }

    pub fn max_records_per_partition(&self) -> u64 {
        self.max_records_per_partition.unwrap_or(DEFAULT_MAX_RECORDS_PER_PARTITION)
    }

    pub fn prefetch_buffer_size(&self) -> usize {
        self.prefetch_buffer_size.unwrap_or(DEFAULT_PREFETCH_BUFFER_SIZE)
    }

    pub fn pool_capacity(&self) -> usize {
        self.pool_capacity.unwrap_or(1)
    }
}
