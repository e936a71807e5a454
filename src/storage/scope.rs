//! Access scopes
//!
//! All reads and writes against one backing store serialize through a
//! reentrant exclusive lock. A thread may nest scopes freely (a container
//! operation opening stream handles, a provider writing its reserved stream
//! inside a container operation); another thread blocks until the outermost
//! scope is released.

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::sync::Arc;

/// Shareable handle to one lock domain.
///
/// Clone it and hand the clone to every store that must serialize with the
/// others (e.g. the dimensions of one object space).
#[derive(Clone, Default)]
pub struct AccessLock {
    inner: Arc<ReentrantMutex<()>>,
}

impl AccessLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the lock domain, blocking while another thread holds it
    pub fn enter(&self) -> AccessScope<'_> {
        AccessScope {
            _guard: self.inner.lock(),
        }
    }

    /// Enter without blocking; `None` if another thread holds the scope
    pub fn try_enter(&self) -> Option<AccessScope<'_>> {
        self.inner.try_lock().map(|guard| AccessScope { _guard: guard })
    }

    /// Whether two handles refer to the same lock domain
    pub fn same_domain(&self, other: &AccessLock) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for AccessLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessLock")
            .field("domain", &Arc::as_ptr(&self.inner))
            .finish()
    }
}

/// Guard for an entered access scope. Dropping it leaves the scope.
pub struct AccessScope<'a> {
    _guard: ReentrantMutexGuard<'a, ()>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;

    #[test]
    fn test_scope_is_reentrant() {
        let lock = AccessLock::new();
        let _outer = lock.enter();
        let _inner = lock.enter();
        assert!(lock.try_enter().is_some());
    }

    #[test]
    fn test_scope_excludes_other_threads() {
        let lock = AccessLock::new();
        let released = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        let scope = lock.enter();
        let handle = {
            let lock = lock.clone();
            let released = released.clone();
            std::thread::spawn(move || {
                tx.send(lock.try_enter().is_none()).expect("send");
                let _scope = lock.enter();
                assert!(released.load(Ordering::SeqCst));
            })
        };

        assert!(rx.recv().expect("recv"), "second thread entered a held scope");
        released.store(true, Ordering::SeqCst);
        drop(scope);
        handle.join().expect("worker panicked");
    }

    #[test]
    fn test_clones_share_domain() {
        let a = AccessLock::new();
        let b = a.clone();
        let c = AccessLock::new();
        assert!(a.same_domain(&b));
        assert!(!a.same_domain(&c));
    }
}
