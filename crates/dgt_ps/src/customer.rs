//! Per-app registry of outstanding requests and their response counters.
//!
//! Every push/pull allocates a timestamp here; responses (and pre-credits
//! for servers that had nothing to do) bump the counter until the expected
//! count is reached. `wait` parks the caller on a condvar until then.

use std::sync::{Condvar, Mutex};

use dgt_core::types::Timestamp;

#[derive(Clone, Copy, Debug, Default)]
struct TrackerEntry {
    expected: usize,
    received: usize,
    /// Optional fine-grained response target (key count), carried on the
    /// wire for transports that track per-key completion.
    tracker_num: usize,
}

/// Request registry shared by one worker or server instance.
#[derive(Debug)]
pub struct Customer {
    app_id: i32,
    customer_id: i32,
    tracker: Mutex<Vec<TrackerEntry>>,
    satisfied: Condvar,
}

impl Customer {
    pub fn new(app_id: i32, customer_id: i32) -> Self {
        Self {
            app_id,
            customer_id,
            tracker: Mutex::new(Vec::new()),
            satisfied: Condvar::new(),
        }
    }

    pub fn app_id(&self) -> i32 {
        self.app_id
    }

    pub fn customer_id(&self) -> i32 {
        self.customer_id
    }

    /// Allocate the next timestamp, expecting `expected` responses.
    pub fn new_request(&self, expected: usize, tracker_num: Option<usize>) -> Timestamp {
        let mut tracker = self.tracker.lock().unwrap();
        tracker.push(TrackerEntry {
            expected,
            received: 0,
            tracker_num: tracker_num.unwrap_or(0),
        });
        (tracker.len() - 1) as Timestamp
    }

    /// Whether `ts` names a request this customer issued.
    pub fn has_request(&self, ts: Timestamp) -> bool {
        ts >= 0 && (ts as usize) < self.tracker.lock().unwrap().len()
    }

    /// Credit `n` responses toward `ts` and return the new count.
    pub fn add_response(&self, ts: Timestamp, n: usize) -> usize {
        let mut tracker = self.tracker.lock().unwrap();
        let entry = &mut tracker[ts as usize];
        entry.received += n;
        let received = entry.received;
        drop(tracker);
        self.satisfied.notify_all();
        received
    }

    /// Responses received so far for `ts`.
    pub fn num_response(&self, ts: Timestamp) -> usize {
        self.tracker.lock().unwrap()[ts as usize].received
    }

    /// The fine-grained tracker hint recorded at request creation.
    pub fn tracker_num(&self, ts: Timestamp) -> usize {
        self.tracker.lock().unwrap()[ts as usize].tracker_num
    }

    /// Block until the response count for `ts` reaches its expected count.
    ///
    /// Returns immediately once a request has completed, however often it is
    /// called. There is no timeout; retries are the transport's business.
    pub fn wait(&self, ts: Timestamp) {
        let mut tracker = self.tracker.lock().unwrap();
        while tracker[ts as usize].received < tracker[ts as usize].expected {
            tracker = self.satisfied.wait(tracker).unwrap();
        }
    }
}
