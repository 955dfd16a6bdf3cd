use rand::Rng;
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Filters idle this long are dropped.
pub const FILTER_EXPIRY_MS: u64 = 5 * 60 * 1_000;

/// Upper bound on block hashes returned by one `eth_getFilterChanges` call.
pub const MAX_BLOCKS_PER_POLL: u64 = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterKind {
    Block,
    PendingTransaction,
}

#[derive(Clone, Debug)]
struct StoredFilter {
    kind: FilterKind,
    created_block: u64,
    last_queried_block: u64,
    last_queried_at: u64,
}

/// What a poll of one filter should report.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FilterChanges {
    /// Block numbers whose hashes are due, possibly empty.
    Blocks(Option<RangeInclusive<u64>>),
    /// No mempool is visible through the gateway.
    Pending,
}

/// Installed `eth_new*Filter` filters keyed by their hex id.
#[derive(Default)]
pub struct FilterRegistry {
    filters: Mutex<HashMap<String, StoredFilter>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StoredFilter>> {
        self.filters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expire(filters: &mut HashMap<String, StoredFilter>, now_ms: u64) {
        filters.retain(|_, f| now_ms.saturating_sub(f.last_queried_at) < FILTER_EXPIRY_MS);
    }

    /// Random `u64` quantity, unique among installed filters.
    fn fresh_id(filters: &HashMap<String, StoredFilter>) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let id = format!("0x{:x}", rng.gen::<u64>());
            if !filters.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn install_at(&self, kind: FilterKind, latest_block: u64, now_ms: u64) -> String {
        let mut filters = self.lock();
        Self::expire(&mut filters, now_ms);
        let id = Self::fresh_id(&filters);
        filters.insert(
            id.clone(),
            StoredFilter {
                kind,
                created_block: latest_block,
                last_queried_block: latest_block,
                last_queried_at: now_ms,
            },
        );
        id
    }

    /// Advance the filter's cursor towards `latest_block`. `None` for unknown or expired ids.
    pub fn changes_at(&self, id: &str, latest_block: u64, now_ms: u64) -> Option<FilterChanges> {
        let mut filters = self.lock();
        Self::expire(&mut filters, now_ms);
        let filter = filters.get_mut(id)?;
        filter.last_queried_at = now_ms;

        match filter.kind {
            FilterKind::PendingTransaction => {
                filter.last_queried_block = latest_block.max(filter.last_queried_block);
                Some(FilterChanges::Pending)
            }
            FilterKind::Block => {
                if latest_block <= filter.last_queried_block {
                    return Some(FilterChanges::Blocks(None));
                }
                let from = filter.last_queried_block + 1;
                let to = latest_block.min(filter.last_queried_block + MAX_BLOCKS_PER_POLL);
                filter.last_queried_block = to;
                Some(FilterChanges::Blocks(Some(from..=to)))
            }
        }
    }

    pub fn uninstall(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    pub fn created_block(&self, id: &str) -> Option<u64> {
        self.lock().get(id).map(|f| f.created_block)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_filter_reports_each_block_once() {
        let registry = FilterRegistry::new();
        let id = registry.install_at(FilterKind::Block, 100, 0);
        assert_eq!(registry.created_block(&id), Some(100));

        assert_eq!(
            registry.changes_at(&id, 100, 10),
            Some(FilterChanges::Blocks(None))
        );
        assert_eq!(
            registry.changes_at(&id, 102, 20),
            Some(FilterChanges::Blocks(Some(101..=102)))
        );
        assert_eq!(
            registry.changes_at(&id, 102, 30),
            Some(FilterChanges::Blocks(None))
        );
    }

    #[test]
    fn long_gaps_are_paged() {
        let registry = FilterRegistry::new();
        let id = registry.install_at(FilterKind::Block, 0, 0);
        assert_eq!(
            registry.changes_at(&id, 200, 1),
            Some(FilterChanges::Blocks(Some(1..=64)))
        );
        assert_eq!(
            registry.changes_at(&id, 200, 2),
            Some(FilterChanges::Blocks(Some(65..=128)))
        );
    }

    #[test]
    fn pending_filter_never_reports() {
        let registry = FilterRegistry::new();
        let id = registry.install_at(FilterKind::PendingTransaction, 5, 0);
        assert_eq!(registry.changes_at(&id, 9, 1), Some(FilterChanges::Pending));
    }

    #[test]
    fn idle_filters_expire_and_polling_keeps_them_alive() {
        let registry = FilterRegistry::new();
        let idle = registry.install_at(FilterKind::Block, 1, 0);
        let busy = registry.install_at(FilterKind::Block, 1, 0);

        assert!(registry.changes_at(&busy, 1, FILTER_EXPIRY_MS - 1).is_some());
        assert!(registry.changes_at(&idle, 1, FILTER_EXPIRY_MS).is_none());
        assert!(registry.changes_at(&busy, 1, FILTER_EXPIRY_MS + 10).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn ids_are_unique_hex_quantities() {
        let registry = FilterRegistry::new();
        let ids: std::collections::HashSet<String> = (0..100)
            .map(|_| registry.install_at(FilterKind::Block, 0, 0))
            .collect();
        assert_eq!(ids.len(), 100);
        assert!(ids.iter().all(|id| id.starts_with("0x")));
    }

    #[test]
    fn uninstall_removes_once() {
        let registry = FilterRegistry::new();
        let id = registry.install_at(FilterKind::Block, 0, 0);
        assert!(registry.uninstall(&id));
        assert!(!registry.uninstall(&id));
        assert!(registry.changes_at(&id, 5, 1).is_none());
    }
}
