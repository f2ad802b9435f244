/// Recognizes a phase that is spinning on the same failure.
///
/// Keeps a rolling window of recent error signatures; the phase is
/// declared stuck when the same non-empty signature shows up in
/// `window` consecutive iterations. Successful iterations (no
/// signature) reset the window. State never crosses phase runs: the
/// loop constructs a fresh detector per run.
#[derive(Debug)]
pub struct StuckDetector {
    window: usize,
    streak: u32,
    last: Option<String>,
}

pub const DEFAULT_WINDOW: usize = 3;

impl Default for StuckDetector {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl StuckDetector {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            streak: 0,
            last: None,
        }
    }

    /// Record one iteration's signature. Returns `true` when the streak
    /// reaches the window length — i.e. on the third consecutive
    /// identical signature with the default window.
    pub fn observe(&mut self, signature: Option<&str>) -> bool {
        match signature {
            None => {
                self.streak = 0;
                self.last = None;
                false
            }
            Some(sig) => {
                if self.last.as_deref() == Some(sig) {
                    self.streak += 1;
                } else {
                    self.last = Some(sig.to_string());
                    self.streak = 1;
                }
                self.streak as usize >= self.window
            }
        }
    }

    /// The signature currently being repeated, if any.
    pub fn current_signature(&self) -> Option<&str> {
        self.last.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_on_third_consecutive_identical() {
        let mut detector = StuckDetector::default();
        assert!(!detector.observe(Some("s1")));
        assert!(!detector.observe(Some("s1")));
        assert!(detector.observe(Some("s1")));
        assert_eq!(detector.current_signature(), Some("s1"));
    }

    #[test]
    fn different_signature_restarts_streak() {
        let mut detector = StuckDetector::default();
        assert!(!detector.observe(Some("s1")));
        assert!(!detector.observe(Some("s2")));
        assert!(!detector.observe(Some("s1")));
        assert!(!detector.observe(Some("s1")));
        assert!(detector.observe(Some("s1")));
    }

    #[test]
    fn success_resets_window() {
        let mut detector = StuckDetector::default();
        assert!(!detector.observe(Some("s1")));
        assert!(!detector.observe(Some("s1")));
        assert!(!detector.observe(None));
        assert!(!detector.observe(Some("s1")));
        assert!(!detector.observe(Some("s1")));
        assert!(detector.observe(Some("s1")));
    }

    #[test]
    fn window_of_one_trips_immediately() {
        let mut detector = StuckDetector::new(1);
        assert!(detector.observe(Some("s1")));
    }
}
