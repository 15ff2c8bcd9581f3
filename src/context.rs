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
//! Execution-time context: collaborator handles, shared statistics, and
//! cancellation. Constructed once per top-level execution and threaded
//! through every operator via shared reference.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::collaborators::{
    ConnectionPool, FetchXmlClient, MetadataClient, NullProgressReporter, ProgressReporter,
    RecordWriteClient, SqlClient, ThrottleTracker, Transpiler,
};
use crate::options::PlannerOptions;
use crate::script::scope::VariableScope;

/// Paging metadata for the outermost scan of a non-partitioned plan.
#[derive(Debug, Default)]
pub struct PagingStats {
    pub paging_cookie: Mutex<Option<String>>,
    pub page_number: AtomicU32,
    pub total_count: Mutex<Option<u64>>,
    /// Set by `ParallelPartition` to suppress paging-metadata writes from
    /// its partitioned children.
    pub suppressed: AtomicBool,
}

impl PagingStats {
    pub fn record(&self, cookie: Option<String>, page_number: u32, total_count: Option<u64>) {
        if self.suppressed.load(Ordering::Relaxed) {
            return;
        }
        *self.paging_cookie.lock().unwrap() = cookie;
        self.page_number.store(page_number, Ordering::Relaxed);
        if let Some(t) = total_count {
            *self.total_count.lock().unwrap() = Some(t);
        }
    }

    pub fn suppress(&self) {
        self.suppressed.store(true, Ordering::Relaxed);
    }
}

/// Thread-safe counters shared across operators in one execution.
#[derive(Debug, Default)]
pub struct Statistics {
    pub rows_scanned: AtomicU64,
    pub rows_returned: AtomicU64,
    pub backend_round_trips: AtomicU64,
    pub retries: AtomicU64,
    pub paging: PagingStats,
}

/// Collaborator handles the planner/executor borrows for a single
/// execution. Operators hold an `Arc<ExecContext>` and share it with any
/// sibling tasks `ParallelPartition` spawns.
pub struct ExecContext {
    pub fetchxml_client: Arc<dyn FetchXmlClient>,
    pub sql_client: Option<Arc<dyn SqlClient>>,
    pub metadata_client: Arc<dyn MetadataClient>,
    pub write_client: Arc<dyn RecordWriteClient>,
    pub pool: Arc<dyn ConnectionPool>,
    pub throttle: Arc<dyn ThrottleTracker>,
    pub transpiler: Arc<dyn Transpiler>,
    pub progress: Arc<dyn ProgressReporter>,
    pub options: PlannerOptions,
    pub stats: Statistics,
    pub cancel: CancellationToken,
    /// The session's impersonation principal — unset, or a single uuid.
    /// `EXECUTE AS` replaces rather than stacks.
    pub principal: Mutex<Option<Uuid>>,
}

impl ExecContext {
    pub fn new(
        fetchxml_client: Arc<dyn FetchXmlClient>,
        sql_client: Option<Arc<dyn SqlClient>>,
        metadata_client: Arc<dyn MetadataClient>,
        write_client: Arc<dyn RecordWriteClient>,
        pool: Arc<dyn ConnectionPool>,
        throttle: Arc<dyn ThrottleTracker>,
        transpiler: Arc<dyn Transpiler>,
        options: PlannerOptions,
    ) -> Self {
        ExecContext {
            fetchxml_client,
            sql_client,
            metadata_client,
            write_client,
            pool,
            throttle,
            transpiler,
            progress: Arc::new(NullProgressReporter),
            options,
            stats: Statistics::default(),
            cancel: CancellationToken::new(),
            principal: Mutex::new(None),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Deterministic-hash placeholder used to resolve an `EXECUTE AS`
    /// principal name to a backend uuid when no resolution hook is wired —
    /// `spec.md` §4.6/§9 leaves production resolution unspecified; this is
    /// intentionally only good enough for tests.
    pub fn resolve_principal_placeholder(name: &str) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.to_lowercase().as_bytes())
    }

    pub fn set_principal(&self, principal: Option<Uuid>) {
        *self.principal.lock().unwrap() = principal;
    }

    pub fn current_principal(&self) -> Option<Uuid> {
        *self.principal.lock().unwrap()
    }
}

/// A scoped fork of an `ExecContext` used only to carry the per-script
/// variable scope alongside the shared execution context. The scope is not
/// part of `ExecContext` itself because it must not be shared across
/// concurrent executions (`spec.md` §5).
pub struct ScriptRuntime {
    pub exec: Arc<ExecContext>,
    pub scope: VariableScope,
}

impl ScriptRuntime {
    pub fn new(exec: Arc<ExecContext>) -> Self {
        ScriptRuntime {
            exec,
            scope: VariableScope::new(),
        }
    }
}

/// Bound on retry attempts for a single transient-error call site. `spec.md`
/// requires retrying transient/throttled backend errors "up to a bounded
/// attempt count"; three tries (one original plus two retries) is that bound.
const MAX_TRANSIENT_RETRIES: u32 = 3;

/// Runs `op` against `ctx`'s collaborators, retrying on
/// `EngineError::ConnectionTransient` per the throttle tracker's advice.
///
/// Each attempt reports the error to `ctx.throttle` so it can track backoff
/// state across the whole execution, then sleeps for whatever the tracker
/// advises (falling back to the error's own `retry_after` hint) before
/// trying again. Exhausting the attempt budget surfaces the last error.
pub async fn with_transient_retry<T, F, Fut>(ctx: &Arc<ExecContext>, op: F) -> Result<T, crate::error::EngineError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, crate::error::EngineError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let retry_after = err.retry_after();
                let transient = matches!(err, crate::error::EngineError::ConnectionTransient { .. });
                attempt += 1;
                if !transient || attempt >= MAX_TRANSIENT_RETRIES {
                    return Err(err);
                }
                ctx.throttle.observe(retry_after);
                let delay = ctx.throttle.advise().or(retry_after).unwrap_or(std::time::Duration::from_millis(200));
                log::warn!("retrying after transient backend error (attempt {attempt}/{MAX_TRANSIENT_RETRIES}): {err}");
                ctx.stats.retries.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(delay).await;
            }
        }
    }
}
