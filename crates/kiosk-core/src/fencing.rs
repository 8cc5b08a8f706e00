//! Request fencing for collection fetches.
//!
//! Every fetch takes a ticket carrying a strictly increasing id. Only the
//! newest ticket may touch state on completion; anything older is discarded
//! whole.

/// Identity of one dispatched fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FetchTicket(u64);

impl FetchTicket {
    pub fn id(self) -> u64 {
        self.0
    }
}

/// Per-collection fence state.
#[derive(Debug, Default, Clone)]
pub struct RequestFence {
    latest: u64,
    in_flight: Option<FetchTicket>,
}

impl RequestFence {
    /// Issue the next request id. Strictly increasing.
    pub fn next_request_id(&mut self) -> u64 {
        self.latest += 1;
        self.latest
    }

    /// Whether a fetch is outstanding.
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Ticket of the outstanding fetch, if any.
    pub fn in_flight(&self) -> Option<FetchTicket> {
        self.in_flight
    }

    /// Start a fetch.
    ///
    /// Returns `None` when one is already outstanding and `force` is false.
    /// A forced start supersedes the outstanding fetch; the caller is
    /// responsible for cancelling its transport.
    pub fn begin(&mut self, force: bool) -> Option<FetchTicket> {
        if self.is_busy() && !force {
            return None;
        }
        let ticket = FetchTicket(self.next_request_id());
        self.in_flight = Some(ticket);
        Some(ticket)
    }

    /// Whether `ticket` is still the newest issued request.
    pub fn is_latest(&self, ticket: FetchTicket) -> bool {
        ticket.0 == self.latest
    }

    /// Record completion of `ticket`. Returns `true` when its result may be
    /// applied.
    pub fn complete(&mut self, ticket: FetchTicket) -> bool {
        if !self.is_latest(ticket) {
            return false;
        }
        if self.in_flight == Some(ticket) {
            self.in_flight = None;
        }
        true
    }

    /// Forget any outstanding fetch and invalidate its ticket.
    pub fn reset(&mut self) {
        self.in_flight = None;
        self.next_request_id();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_strictly_increase() {
        let mut fence = RequestFence::default();
        let a = fence.next_request_id();
        let b = fence.next_request_id();
        let c = fence.next_request_id();
        assert!(a < b && b < c);
    }

    #[test]
    fn single_flight_rejects_unforced_second_fetch() {
        let mut fence = RequestFence::default();
        let first = fence.begin(false).expect("first fetch starts");
        assert!(fence.begin(false).is_none());
        assert_eq!(fence.in_flight(), Some(first));
    }

    #[test]
    fn superseded_fetch_resolving_last_is_discarded() {
        let mut fence = RequestFence::default();
        let first = fence.begin(false).expect("first fetch");
        let second = fence.begin(true).expect("forced fetch");

        assert!(fence.complete(second));
        assert!(!fence.complete(first));
        assert!(!fence.is_busy());
    }

    #[test]
    fn superseded_fetch_resolving_first_is_discarded_and_keeps_busy() {
        let mut fence = RequestFence::default();
        let first = fence.begin(false).expect("first fetch");
        let second = fence.begin(true).expect("forced fetch");

        assert!(!fence.complete(first));
        assert!(fence.is_busy());
        assert!(fence.complete(second));
    }

    #[test]
    fn reset_invalidates_outstanding_ticket() {
        let mut fence = RequestFence::default();
        let ticket = fence.begin(false).expect("fetch");
        fence.reset();
        assert!(!fence.is_busy());
        assert!(!fence.complete(ticket));
    }
}
