use super::QueryResult;
use crate::connection::pool::{PoolGuard, ReleaseOutcome};
use crate::core::Row;
use crate::executor::ExecutedCall;
use log::debug;
use std::collections::VecDeque;
use uuid::Uuid;

/// Merged output of one proxied call.
///
/// Rows come partition by partition in selection order, each partition's
/// rows in the order the partition returned them. The set is consumed once;
/// pooled connections go back to the pool as soon as the last row is taken
/// or the set is dropped.
pub struct ResultSet {
    call_id: Uuid,
    function: String,
    columns: Vec<String>,
    pending: VecDeque<(usize, std::vec::IntoIter<Row>)>,
    total: usize,
    remaining: usize,
    guards: Vec<PoolGuard>,
}

impl ResultSet {
    pub fn new(call_id: Uuid, function: impl Into<String>, executed: ExecutedCall) -> Self {
        let ExecutedCall { results, guards } = executed;
        let columns = results
            .iter()
            .map(|(_, result)| &result.columns)
            .find(|columns| !columns.is_empty())
            .cloned()
            .unwrap_or_default();
        let total = results.iter().map(|(_, result)| result.row_count()).sum();
        let pending = results
            .into_iter()
            .map(|(partition, result)| (partition, result.rows.into_iter()))
            .collect();

        let mut set = Self {
            call_id,
            function: function.into(),
            columns,
            pending,
            total,
            remaining: total,
            guards,
        };
        if total == 0 {
            set.release();
        }
        set
    }

    pub fn call_id(&self) -> Uuid {
        self.call_id
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn total_rows(&self) -> usize {
        self.total
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    /// True while the call still owns pooled connections.
    pub fn holds_connections(&self) -> bool {
        !self.guards.is_empty()
    }

    /// Next row together with the partition it came from.
    pub fn next_tagged(&mut self) -> Option<(usize, Row)> {
        while let Some((partition, rows)) = self.pending.front_mut() {
            if let Some(row) = rows.next() {
                let partition = *partition;
                self.remaining = self.remaining.saturating_sub(1);
                if self.remaining == 0 {
                    self.release();
                }
                return Some((partition, row));
            }
            self.pending.pop_front();
        }
        self.release();
        None
    }

    pub fn next_row(&mut self) -> Option<Row> {
        self.next_tagged().map(|(_, row)| row)
    }

    /// Drains whatever is left into one `QueryResult`.
    pub fn into_query_result(mut self) -> QueryResult {
        let mut rows = Vec::with_capacity(self.remaining);
        while let Some(row) = self.next_row() {
            rows.push(row);
        }
        QueryResult::new(std::mem::take(&mut self.columns), rows)
    }

    fn release(&mut self) {
        self.pending.clear();
        for guard in self.guards.drain(..) {
            guard.release(ReleaseOutcome::Healthy);
        }
    }
}

impl Iterator for ResultSet {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        self.next_row()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl std::fmt::Debug for ResultSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSet")
            .field("call_id", &self.call_id)
            .field("function", &self.function)
            .field("total", &self.total)
            .field("remaining", &self.remaining)
            .finish()
    }
}

impl Drop for ResultSet {
    fn drop(&mut self) {
        if self.remaining > 0 {
            debug!(
                "Call {} of {} abandoned with {} of {} row(s) undelivered",
                self.call_id, self.function, self.remaining, self.total
            );
        }
        self.release();
    }
}
