use super::PropagationKey;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Remembers when each key last propagated, to absorb bursts of edge events.
#[derive(Debug)]
pub struct Cooldown {
    window: Duration,
    last: HashMap<PropagationKey, Instant>,
}

impl Cooldown {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: HashMap::new(),
        }
    }

    pub fn is_cooling(&self, key: &PropagationKey, now: Instant) -> bool {
        self.last
            .get(key)
            .is_some_and(|at| now.saturating_duration_since(*at) < self.window)
    }

    pub fn mark(&mut self, key: PropagationKey, now: Instant) {
        self.last.insert(key, now);
    }

    /// Drop entries whose window has passed.
    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.last
            .retain(|_, at| now.saturating_duration_since(*at) < window);
    }

    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheetcore::WorkflowRef;

    fn key() -> PropagationKey {
        PropagationKey {
            workflow: WorkflowRef::draft("w"),
            source: "a".into(),
            target: "b".into(),
            sheet_name: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn window_expires() {
        let mut cooldown = Cooldown::new(Duration::from_secs(30));
        let start = Instant::now();
        cooldown.mark(key(), start);

        assert!(cooldown.is_cooling(&key(), start + Duration::from_secs(29)));
        assert!(!cooldown.is_cooling(&key(), start + Duration::from_secs(30)));

        cooldown.prune(start + Duration::from_secs(31));
        assert!(cooldown.is_empty());
    }
}
