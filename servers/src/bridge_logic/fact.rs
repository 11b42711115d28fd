use tokio::sync::watch;

/// A single-assignment cell for a bootstrap fact.
///
/// The first `resolve` wins; later calls are ignored. Any number of tasks may
/// `wait` for the value, before or after resolution.
pub struct FactCell<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> FactCell<T> {
    pub fn new() -> Self {
        Self {
            tx: watch::Sender::new(None),
        }
    }

    /// Resolve the cell. Returns true if this call set the value, false if it
    /// was already resolved.
    pub fn resolve(&self, value: T) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(value);
                true
            } else {
                false
            }
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Wait until the cell is resolved and return the value.
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone().expect("wait_for guarantees a resolved slot"),
            // The sender lives inside `self`, so the channel cannot close
            // while we are borrowed.
            Err(_) => unreachable!("fact cell sender dropped while waiting"),
        }
    }
}

impl<T: Clone> Default for FactCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_resolve_wins() {
        let cell = FactCell::new();
        assert!(!cell.is_resolved());
        assert!(cell.resolve(1));
        assert!(cell.is_resolved());
        assert!(!cell.resolve(2));
    }

    #[tokio::test]
    async fn test_wait_returns_first_value() {
        let cell = FactCell::new();
        cell.resolve("a".to_string());
        cell.resolve("b".to_string());
        assert_eq!(cell.wait().await, "a");
    }

    #[tokio::test]
    async fn test_wait_blocks_until_resolved() {
        let cell = std::sync::Arc::new(FactCell::new());
        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.wait().await })
        };
        // Give the waiter a chance to park before resolving
        tokio::task::yield_now().await;
        cell.resolve(42);
        assert_eq!(waiter.await.unwrap(), 42);
    }
}
