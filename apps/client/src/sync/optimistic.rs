/// Two-phase optimistic value.
///
/// `apply` changes what the user sees. `begin_flush` snapshots the value
/// being persisted. `confirm` promotes that snapshot to the baseline;
/// `compensate` drops every tentative change and restores the baseline.
#[derive(Debug, Clone)]
pub struct Optimistic<T> {
    confirmed: T,
    current: T,
    in_flight: Option<T>,
}

impl<T: Clone + PartialEq> Optimistic<T> {
    pub fn new(value: T) -> Self {
        Self {
            confirmed: value.clone(),
            current: value,
            in_flight: None,
        }
    }

    pub fn current(&self) -> &T {
        &self.current
    }

    pub fn confirmed(&self) -> &T {
        &self.confirmed
    }

    pub fn apply(&mut self, value: T) {
        self.current = value;
    }

    pub fn is_dirty(&self) -> bool {
        self.current != self.confirmed
    }

    pub fn is_flushing(&self) -> bool {
        self.in_flight.is_some()
    }

    /// The value to persist, or `None` when it already matches the baseline.
    pub fn begin_flush(&mut self) -> Option<T> {
        if !self.is_dirty() {
            return None;
        }
        self.in_flight = Some(self.current.clone());
        self.in_flight.clone()
    }

    pub fn confirm(&mut self) {
        if let Some(value) = self.in_flight.take() {
            self.confirmed = value;
        }
    }

    /// Restores the baseline and returns the value that was showing.
    pub fn compensate(&mut self) -> T {
        self.in_flight = None;
        std::mem::replace(&mut self.current, self.confirmed.clone())
    }

    /// Nothing tentative and nothing in flight.
    pub fn is_settled(&self) -> bool {
        !self.is_dirty() && self.in_flight.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_is_skipped_when_value_returns_to_baseline() {
        let mut liked = Optimistic::new(false);
        liked.apply(true);
        liked.apply(false);
        assert_eq!(liked.begin_flush(), None);
        assert!(liked.is_settled());
    }

    #[test]
    fn confirm_moves_baseline() {
        let mut liked = Optimistic::new(false);
        liked.apply(true);
        assert_eq!(liked.begin_flush(), Some(true));
        liked.confirm();
        assert_eq!(*liked.confirmed(), true);
        assert!(liked.is_settled());
    }

    #[test]
    fn compensate_discards_changes_made_during_flush() {
        let mut liked = Optimistic::new(false);
        liked.apply(true);
        liked.begin_flush();
        liked.apply(false);
        liked.apply(true);

        assert_eq!(liked.compensate(), true);
        assert_eq!(*liked.current(), false);
        assert!(!liked.is_flushing());
    }
}
