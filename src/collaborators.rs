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
//! Contracts for the external collaborators this core drives but does not
//! implement: the backend FetchXML/SQL clients, the metadata API, the
//! connection pool, the throttle tracker, the SQL→FetchXML transpiler, and
//! an optional progress reporter. `spec.md` §6 specifies these interfaces;
//! their internals belong to the host process.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::value::{Column, Row};

/// One page of FetchXML results.
#[derive(Debug, Clone)]
pub struct FetchPage {
    pub rows: Vec<Row>,
    pub columns: Vec<Column>,
    pub more_records: bool,
    pub paging_cookie: Option<String>,
    pub page_number: u32,
    pub total_count: Option<u64>,
}

/// A borrowed connection handle from the external pool. Opaque to the core;
/// collaborators interpret the profile tag as they see fit.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub profile_name: String,
}

/// `execute(fetchxml, page?, cookie?, include_count?, cancel) -> page` plus
/// classified errors (transient / throttled / auth / aggregate-overflow /
/// permanent), per `spec.md` §6.
#[async_trait]
pub trait FetchXmlClient: Send + Sync {
    async fn execute(
        &self,
        fetchxml: &str,
        page: Option<u32>,
        cookie: Option<&str>,
        include_count: bool,
        cancel: &CancellationToken,
    ) -> Result<FetchPage, EngineError>;
}

/// `execute(sql, max_rows?, cancel) -> rows` over the secondary wire
/// protocol. Never receives aggregate-overflow or paging cookies.
#[async_trait]
pub trait SqlClient: Send + Sync {
    async fn execute(
        &self,
        sql: &str,
        max_rows: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Column>, Vec<Row>), EngineError>;
}

/// Attribute/entity/relationship descriptors for the virtual `metadata.*`
/// namespace.
#[async_trait]
pub trait MetadataClient: Send + Sync {
    async fn query_entities(&self, table: &str) -> Result<(Vec<Column>, Vec<Row>), EngineError>;

    /// Fast count for `CountOptimized` (`spec.md` §4.7 item 3): a metadata
    /// read that avoids a full aggregate FetchXML round trip when available.
    async fn entity_record_count(&self, entity: &str) -> Result<Option<u64>, EngineError>;
}

#[async_trait]
pub trait ConnectionPool: Send + Sync {
    async fn borrow(&self, cancel: &CancellationToken) -> Result<ConnectionHandle, EngineError>;
    fn capacity(&self) -> usize;
    fn invalidate(&self, profile_name: &str);
}

/// Process-wide throttle advisory tracker. Implementations observe
/// rate-limit headers and advise a backoff duration.
pub trait ThrottleTracker: Send + Sync {
    fn observe(&self, retry_after: Option<Duration>);
    fn advise(&self) -> Option<Duration>;
}

/// The SQL→FetchXML transpiler. Returns the FetchXML text plus the set of
/// "virtual" columns (computed client-side lookup columns like `*name`)
/// that the transpiler could not express.
#[async_trait]
pub trait Transpiler: Send + Sync {
    async fn transpile(
        &self,
        select_sql: &str,
    ) -> Result<(String, Vec<String>), EngineError>;
}

/// One classified outcome of a single-record write.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub id: Option<uuid::Uuid>,
}

/// The backend's record-mutation surface. `spec.md` §4.5 describes DML
/// operators driving "one backend write" per row but, unlike the read-side
/// clients, never names this contract directly in §6's collaborator list —
/// it is added here because `DmlExecute` cannot exist without it, shaped
/// the same way as the other collaborator traits.
#[async_trait]
pub trait RecordWriteClient: Send + Sync {
    async fn create(
        &self,
        entity: &str,
        values: &std::collections::HashMap<String, crate::value::Value>,
        cancel: &CancellationToken,
    ) -> Result<WriteOutcome, EngineError>;

    async fn update(
        &self,
        entity: &str,
        id: uuid::Uuid,
        values: &std::collections::HashMap<String, crate::value::Value>,
        cancel: &CancellationToken,
    ) -> Result<WriteOutcome, EngineError>;

    async fn delete(&self, entity: &str, id: uuid::Uuid, cancel: &CancellationToken) -> Result<(), EngineError>;
}

/// Optional phase/info callbacks for long-running DML and cursors.
pub trait ProgressReporter: Send + Sync {
    fn phase(&self, phase: &str);
    fn info(&self, message: &str);
}

/// A no-op reporter used when the caller supplies none.
pub struct NullProgressReporter;

impl ProgressReporter for NullProgressReporter {
    fn phase(&self, _phase: &str) {}
    fn info(&self, _message: &str) {}
}
