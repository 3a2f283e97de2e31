use crate::proxy::Proxy;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

/// Holds the verified upstream proxies together with the index of the one
/// currently in use. Exactly one proxy is active at a time; callers move to
/// another on upstream failure, rotation, or an operator request.
///
/// The sequence and the active index live under a single mutex so that no
/// reader can pair an index with a sequence it was not computed against.
#[derive(Debug, Default)]
pub struct ProxyPool {
    inner: Mutex<PoolState>,
}

#[derive(Debug, Default)]
struct PoolState {
    proxies: Vec<Proxy>,
    active: usize,
}

impl ProxyPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the pool contents with freshly verified proxies. The first
    /// entry becomes the active one.
    pub fn update(&self, proxies: Vec<Proxy>) {
        let mut state = self.lock();
        if let Some(first) = proxies.first() {
            info!(
                "active proxy: {} ({} {})",
                first.addr(),
                first.country,
                first.city
            );
        }
        state.proxies = proxies;
        state.active = 0;
    }

    /// The proxy currently in use, `None` when the pool is empty.
    pub fn current(&self) -> Option<Proxy> {
        let state = self.lock();
        state.proxies.get(state.active).cloned()
    }

    /// Advances to the next proxy, wrapping at the end of the list.
    pub fn switch_next(&self) -> Option<Proxy> {
        let mut state = self.lock();
        if state.proxies.is_empty() {
            return None;
        }
        state.active = (state.active + 1) % state.proxies.len();
        let proxy = state.proxies[state.active].clone();
        info!("switched to: {} ({} {})", proxy.addr(), proxy.country, proxy.city);
        Some(proxy)
    }

    /// Activates the proxy at `index`. Out-of-range indices leave the pool
    /// untouched and return `None`.
    pub fn switch_to(&self, index: usize) -> Option<Proxy> {
        let mut state = self.lock();
        if index >= state.proxies.len() {
            return None;
        }
        state.active = index;
        let proxy = state.proxies[index].clone();
        info!("switched to: {} ({} {})", proxy.addr(), proxy.country, proxy.city);
        Some(proxy)
    }

    /// Index of the active proxy. Only meaningful while the pool is
    /// non-empty.
    pub fn current_index(&self) -> usize {
        self.lock().active
    }

    pub fn size(&self) -> usize {
        self.lock().proxies.len()
    }

    /// Snapshot copy of all proxies; later pool mutations do not affect it.
    pub fn all(&self) -> Vec<Proxy> {
        self.lock().proxies.clone()
    }

    /// Snapshot of the proxies and the active index taken under one lock,
    /// for readers that need the pair to be mutually consistent.
    pub fn snapshot(&self) -> (Vec<Proxy>, usize) {
        let state = self.lock();
        (state.proxies.clone(), state.active)
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // A panic while holding the lock leaves plain data behind; keep going
        // with whatever state is there.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn proxies(n: usize) -> Vec<Proxy> {
        (0..n)
            .map(|i| Proxy::new(&format!("10.0.0.{}", i + 1), "1080").unwrap())
            .collect()
    }

    #[test]
    fn empty_pool() {
        let pool = ProxyPool::new();
        assert_eq!(pool.size(), 0);
        assert!(pool.current().is_none());
        assert!(pool.switch_next().is_none());
        assert!(pool.switch_to(0).is_none());
        assert!(pool.all().is_empty());
    }

    #[test]
    fn update_resets_active_to_first() {
        let pool = ProxyPool::new();
        pool.update(proxies(3));
        pool.switch_to(2);
        assert_eq!(pool.current_index(), 2);

        pool.update(proxies(5));
        assert_eq!(pool.current_index(), 0);
        assert_eq!(pool.current().unwrap().ip, "10.0.0.1");
    }

    #[test]
    fn switch_next_wraps_around() {
        let pool = ProxyPool::new();
        pool.update(proxies(3));

        assert_eq!(pool.switch_next().unwrap().ip, "10.0.0.2");
        assert_eq!(pool.switch_next().unwrap().ip, "10.0.0.3");
        assert_eq!(pool.switch_next().unwrap().ip, "10.0.0.1");
        assert_eq!(pool.current_index(), 0);
    }

    #[test]
    fn switch_next_full_cycle_returns_to_start() {
        let pool = ProxyPool::new();
        pool.update(proxies(7));
        pool.switch_to(4);

        for _ in 0..pool.size() {
            pool.switch_next();
        }
        assert_eq!(pool.current_index(), 4);
    }

    #[test]
    fn switch_to_rejects_out_of_range() {
        let pool = ProxyPool::new();
        pool.update(proxies(2));
        pool.switch_to(1);

        assert!(pool.switch_to(2).is_none());
        assert_eq!(pool.current_index(), 1);
    }

    #[test]
    fn all_returns_independent_snapshot() {
        let pool = ProxyPool::new();
        pool.update(proxies(3));

        let snapshot = pool.all();
        pool.update(proxies(1));

        assert_eq!(snapshot.len(), 3);
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn index_stays_in_bounds_under_concurrent_mutation() {
        let pool = Arc::new(ProxyPool::new());
        pool.update(proxies(5));

        let mut handles = Vec::new();
        for worker in 0..4usize {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                for i in 0..500usize {
                    match (worker + i) % 3 {
                        0 => {
                            pool.switch_next();
                        }
                        1 => {
                            pool.switch_to(i % 7);
                        }
                        _ => {
                            if i % 100 == 0 {
                                pool.update(proxies(1 + i % 5));
                            }
                        }
                    }
                    let (snapshot, index) = pool.snapshot();
                    if !snapshot.is_empty() {
                        assert!(index < snapshot.len());
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
