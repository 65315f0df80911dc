use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::LaneId;

/// A query handed off by a `Query` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryRequest {
    pub query: u16,
    pub lane: LaneId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Pending,
    /// Number of results found.
    Complete(u32),
}

/// The external subsystem resolving queries.
///
/// The interpreter submits at most one request per agent at a time and
/// polls it once per tick until it completes.
pub trait QuerySystem {
    fn submit(&mut self, request: QueryRequest);

    fn poll(&mut self, request: QueryRequest) -> QueryStatus;

    /// The submitting lane went away before the query completed.
    fn cancel(&mut self, _request: QueryRequest) {}
}

#[derive(Debug, Default)]
struct BoardState {
    pending: Vec<QueryRequest>,
    done: HashMap<QueryRequest, u32>,
}

/// Mailbox between agents and a query worker.
///
/// Clones share the same board so a worker thread can complete requests
/// while the owning agent keeps ticking.
#[derive(Debug, Clone, Default)]
pub struct QueryBoard {
    state: Arc<Mutex<BoardState>>,
}

impl QueryBoard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests submitted and not yet completed.
    #[must_use]
    pub fn pending(&self) -> Vec<QueryRequest> {
        self.state.lock().pending.clone()
    }

    /// Resolves `request` with `count` results. Unknown requests are
    /// ignored.
    pub fn complete(&self, request: QueryRequest, count: u32) {
        let mut state = self.state.lock();
        if let Some(index) = state.pending.iter().position(|r| *r == request) {
            state.pending.swap_remove(index);
            state.done.insert(request, count);
        }
    }
}

impl QuerySystem for QueryBoard {
    fn submit(&mut self, request: QueryRequest) {
        log::debug!("query {} submitted by {}", request.query, request.lane);
        self.state.lock().pending.push(request);
    }

    fn poll(&mut self, request: QueryRequest) -> QueryStatus {
        match self.state.lock().done.remove(&request) {
            Some(count) => QueryStatus::Complete(count),
            None => QueryStatus::Pending,
        }
    }

    fn cancel(&mut self, request: QueryRequest) {
        let mut state = self.state.lock();
        state.pending.retain(|r| *r != request);
        state.done.remove(&request);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_board_completes_from_another_thread() {
        let mut board = QueryBoard::new();
        let request = QueryRequest {
            query: 2,
            lane: LaneId(0),
        };
        board.submit(request);
        assert_eq!(board.poll(request), QueryStatus::Pending);

        let worker = board.clone();
        std::thread::spawn(move || {
            for pending in worker.pending() {
                worker.complete(pending, 7);
            }
        })
        .join()
        .expect("worker");

        assert!(board.pending().is_empty());
        assert_eq!(board.poll(request), QueryStatus::Complete(7));
        assert_eq!(board.poll(request), QueryStatus::Pending);
    }

    #[test]
    fn test_cancel_forgets_request() {
        let mut board = QueryBoard::new();
        let request = QueryRequest {
            query: 0,
            lane: LaneId(3),
        };
        board.submit(request);
        board.cancel(request);
        assert!(board.pending().is_empty());
        board.complete(request, 1);
        assert_eq!(board.poll(request), QueryStatus::Pending);
    }
}
