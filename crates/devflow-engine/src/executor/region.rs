//! Re-entrant lock serializing one synchronous region of a chain
//!
//! Contiguous synchronous stages share a single lock. A thread that already
//! holds it may take it again (an inline stage forwarding into the next inline
//! stage, or a feedback loop coming back around), up to a configured depth.

use devflow_core::{DevflowError, DevflowResult};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

#[derive(Debug, Default)]
struct Holder {
    owner: Option<ThreadId>,
    depth: usize,
}

/// Depth-bounded recursive lock
#[derive(Debug)]
pub struct RegionLock {
    holder: Mutex<Holder>,
    released: Condvar,
    max_depth: usize,
}

/// Releases one level of a [`RegionLock`] on drop
#[must_use = "the region is released when the guard is dropped"]
pub struct RegionGuard<'a> {
    lock: &'a RegionLock,
}

impl RegionLock {
    pub fn new(max_depth: usize) -> Self {
        Self {
            holder: Mutex::new(Holder::default()),
            released: Condvar::new(),
            max_depth: max_depth.max(1),
        }
    }

    /// Enter the region, blocking while another thread is inside
    pub fn lock(&self) -> DevflowResult<RegionGuard<'_>> {
        let me = thread::current().id();
        let mut holder = self.holder();
        loop {
            match holder.owner {
                None => {
                    holder.owner = Some(me);
                    holder.depth = 1;
                    return Ok(RegionGuard { lock: self });
                }
                Some(owner) if owner == me => {
                    if holder.depth >= self.max_depth {
                        return Err(DevflowError::NestingTooDeep {
                            depth: holder.depth + 1,
                            max: self.max_depth,
                        });
                    }
                    holder.depth += 1;
                    return Ok(RegionGuard { lock: self });
                }
                Some(_) => {
                    holder = self
                        .released
                        .wait(holder)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Nesting depth of the current holder, 0 when free
    pub fn depth(&self) -> usize {
        self.holder().depth
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.holder().owner == Some(thread::current().id())
    }

    fn holder(&self) -> MutexGuard<'_, Holder> {
        self.holder.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for RegionGuard<'_> {
    fn drop(&mut self) {
        let mut holder = self.lock.holder();
        holder.depth = holder.depth.saturating_sub(1);
        if holder.depth == 0 {
            holder.owner = None;
            self.lock.released.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn nest(lock: &RegionLock, remaining: usize) -> DevflowResult<usize> {
        let _guard = lock.lock()?;
        if remaining == 1 {
            Ok(lock.depth())
        } else {
            nest(lock, remaining - 1)
        }
    }

    #[test]
    fn test_nesting_up_to_limit() {
        let lock = RegionLock::new(8);
        assert_eq!(nest(&lock, 8).unwrap(), 8);
        assert_eq!(lock.depth(), 0);

        let error = nest(&lock, 9).unwrap_err();
        assert_eq!(error, DevflowError::NestingTooDeep { depth: 9, max: 8 });
        assert_eq!(lock.depth(), 0);
        assert!(!lock.is_held_by_current_thread());
    }

    #[test]
    fn test_other_threads_wait() {
        let lock = Arc::new(RegionLock::new(4));
        let entered = Arc::new(AtomicBool::new(false));

        let guard = lock.lock().unwrap();
        let handle = {
            let lock = lock.clone();
            let entered = entered.clone();
            std::thread::spawn(move || {
                let _guard = lock.lock().unwrap();
                entered.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));
        drop(guard);
        handle.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }
}
