use std::time::Duration;

/// Additive backoff: each failure lengthens the next delay by a fixed step,
/// up to a cap.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    initial: Duration,
    step: Duration,
    max: Duration,
    current: Duration,
}

impl LinearBackoff {
    /// Creates a new `LinearBackoff`.
    ///
    /// # Examples
    ///
    /// ```
    /// use drpc::backoff::LinearBackoff;
    /// use std::time::Duration;
    /// let mut backoff = LinearBackoff::new(
    ///     Duration::from_secs(10),
    ///     Duration::from_secs(10),
    ///     Duration::from_secs(120),
    /// );
    /// assert_eq!(backoff.next_delay(), Duration::from_secs(10));
    /// assert_eq!(backoff.next_delay(), Duration::from_secs(20));
    /// ```
    #[must_use]
    pub fn new(initial: Duration, step: Duration, max: Duration) -> Self {
        Self {
            initial,
            step,
            max,
            current: initial.min(max),
        }
    }

    /// Returns the delay for this attempt and advances the internal state.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_add(self.step).min(self.max);
        delay
    }

    /// Delay the next call to [`next_delay`](Self::next_delay) will return.
    #[must_use]
    pub const fn peek(&self) -> Duration {
        self.current
    }

    /// Reset the backoff to its initial delay.
    pub fn reset(&mut self) {
        self.current = self.initial.min(self.max);
    }
}
