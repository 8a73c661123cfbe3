use drp_common::RemoteStatus;
use std::time::Duration;
use tokio::time::Instant;

/// What the caller should do with a status request.
#[derive(Debug, Clone, PartialEq)]
pub enum ThrottleDecision {
    /// Identical to the applied status; nothing to do.
    Skip,
    /// Send this status now. A window has been opened.
    Dispatch(RemoteStatus),
    /// A window is open; the status replaced whatever was queued.
    Queued,
}

/// Allows one dispatch per window and keeps only the latest request made
/// while the window is open.
#[derive(Debug, Clone)]
pub struct PresenceThrottle {
    window: Duration,
    open_until: Option<Instant>,
    pending: Option<RemoteStatus>,
}

impl PresenceThrottle {
    /// Creates an idle throttle.
    #[must_use]
    pub const fn new(window: Duration) -> Self {
        Self {
            window,
            open_until: None,
            pending: None,
        }
    }

    /// Handles one update request.
    ///
    /// `applied` is the status last dispatched. A request equal to it is
    /// skipped and also discards any queued status, so reverting to the
    /// applied status inside a window leaves it in place.
    pub fn request(&mut self, status: RemoteStatus, applied: &RemoteStatus, now: Instant) -> ThrottleDecision {
        if status == *applied {
            self.pending = None;
            return ThrottleDecision::Skip;
        }
        if self.open_until.is_some() {
            self.pending = Some(status);
            return ThrottleDecision::Queued;
        }
        self.open_until = Some(now + self.window);
        ThrottleDecision::Dispatch(status)
    }

    /// Closes the window. Returns the queued status, which the caller feeds
    /// back through [`PresenceThrottle::request`].
    pub fn on_window_closed(&mut self) -> Option<RemoteStatus> {
        self.open_until = None;
        self.pending.take()
    }

    /// When the open window closes.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.open_until
    }

    /// Whether a status is waiting for the window to close.
    #[must_use]
    pub const fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Closes the window and forgets the queued status.
    pub fn reset(&mut self) {
        self.open_until = None;
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drp_common::Presence;

    fn shown(details: &str) -> RemoteStatus {
        RemoteStatus::Shown(Presence::with_details(details))
    }

    fn throttle() -> PresenceThrottle {
        PresenceThrottle::new(Duration::from_secs(5))
    }

    #[test]
    fn first_request_dispatches_and_opens_window() {
        let mut t = throttle();
        let now = Instant::now();

        assert_eq!(t.request(shown("A"), &RemoteStatus::Empty, now), ThrottleDecision::Dispatch(shown("A")));
        assert_eq!(t.deadline(), Some(now + Duration::from_secs(5)));
    }

    #[test]
    fn burst_keeps_only_the_last_request() {
        let mut t = throttle();
        let now = Instant::now();
        let mut applied = RemoteStatus::Empty;

        let ThrottleDecision::Dispatch(first) = t.request(shown("A"), &applied, now) else {
            panic!("A should dispatch");
        };
        applied = first;
        assert_eq!(t.request(shown("B"), &applied, now), ThrottleDecision::Queued);
        assert_eq!(t.request(shown("C"), &applied, now), ThrottleDecision::Queued);

        let next = t.on_window_closed().unwrap();
        assert_eq!(next, shown("C"));
        assert_eq!(t.request(next, &applied, now), ThrottleDecision::Dispatch(shown("C")));
    }

    #[test]
    fn quiet_window_closes_idle() {
        let mut t = throttle();
        t.request(shown("A"), &RemoteStatus::Empty, Instant::now());

        assert_eq!(t.on_window_closed(), None);
        assert_eq!(t.deadline(), None);
    }

    #[test]
    fn unchanged_status_is_skipped() {
        let mut t = throttle();
        assert_eq!(t.request(shown("A"), &shown("A"), Instant::now()), ThrottleDecision::Skip);
        assert_eq!(t.deadline(), None);
    }

    #[test]
    fn revert_to_applied_discards_queued_status() {
        let mut t = throttle();
        let now = Instant::now();
        t.request(shown("A"), &RemoteStatus::Empty, now);
        let applied = shown("A");

        assert_eq!(t.request(shown("B"), &applied, now), ThrottleDecision::Queued);
        assert_eq!(t.request(shown("A"), &applied, now), ThrottleDecision::Skip);

        assert!(!t.has_pending());
        assert_eq!(t.on_window_closed(), None);
    }

    #[test]
    fn clear_is_coalesced_like_any_status() {
        let mut t = throttle();
        let now = Instant::now();
        t.request(shown("A"), &RemoteStatus::Empty, now);
        let applied = shown("A");

        assert_eq!(t.request(RemoteStatus::Empty, &applied, now), ThrottleDecision::Queued);
        assert_eq!(t.on_window_closed(), Some(RemoteStatus::Empty));
    }

    #[test]
    fn reset_forgets_everything() {
        let mut t = throttle();
        let now = Instant::now();
        t.request(shown("A"), &RemoteStatus::Empty, now);
        t.request(shown("B"), &shown("A"), now);

        t.reset();

        assert_eq!(t.deadline(), None);
        assert!(!t.has_pending());
    }
}
