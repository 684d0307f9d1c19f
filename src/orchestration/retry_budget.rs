use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared regeneration allowance for one batch.
///
/// Every failed generation attempt charges the budget, whichever item it
/// belongs to. `limit = max(total_items / 2, floor)`; the charge that pushes
/// the count past the limit is refused.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    used: Arc<AtomicUsize>,
    limit: usize,
}

impl RetryBudget {
    pub fn for_batch(total_items: usize, floor: usize) -> Self {
        Self {
            used: Arc::new(AtomicUsize::new(0)),
            limit: (total_items / 2).max(floor),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    /// Record one failure. `Ok(count)` while within budget, `Err(count)` once
    /// it has been exceeded.
    pub fn charge(&self) -> Result<usize, usize> {
        let count = self.used.fetch_add(1, Ordering::SeqCst) + 1;
        if count > self.limit {
            Err(count)
        } else {
            Ok(count)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_uses_floor_for_small_batches() {
        assert_eq!(RetryBudget::for_batch(4, 10).limit(), 10);
        assert_eq!(RetryBudget::for_batch(50, 10).limit(), 25);
    }

    #[test]
    fn test_eleventh_charge_is_refused() {
        let budget = RetryBudget::for_batch(4, 10);
        for expected in 1..=10 {
            assert_eq!(budget.charge(), Ok(expected));
        }
        assert_eq!(budget.charge(), Err(11));
    }

    #[test]
    fn test_clones_share_the_counter() {
        let budget = RetryBudget::for_batch(2, 3);
        let other = budget.clone();

        std::thread::scope(|scope| {
            scope.spawn(|| budget.charge());
            scope.spawn(|| other.charge());
        });
        assert_eq!(budget.used(), 2);
        assert_eq!(other.charge(), Ok(3));
        assert_eq!(budget.charge(), Err(4));
    }
}
