//! Exclusive, FIFO-fair access to one physical device.
//!
//! A [`DeviceLock`] wraps the per-device state (the command channel and cached driver
//! state) in a tokio mutex. Tokio's mutex queues waiters in arrival order, so callers
//! are served first come, first served. Every acquisition is bounded by a timeout and
//! yields a [`DeviceGuard`] that releases the device when dropped, so early returns,
//! errors and panics can't leak the lock.

use crate::error::{AppResult, ControllerError};
use parking_lot::Mutex as SyncMutex;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone)]
struct HolderInfo {
    holder: String,
    since: Instant,
}

/// Lock serializing all access to one device.
pub struct DeviceLock<T> {
    name: Arc<str>,
    inner: Arc<Mutex<T>>,
    holder: Arc<SyncMutex<Option<HolderInfo>>>,
}

impl<T> Clone for DeviceLock<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            inner: Arc::clone(&self.inner),
            holder: Arc::clone(&self.holder),
        }
    }
}

impl<T> fmt::Debug for DeviceLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceLock")
            .field("name", &self.name)
            .field("holder", &self.current_holder())
            .finish()
    }
}

impl<T> DeviceLock<T> {
    /// Wrap `value` in a lock for the device called `name`.
    pub fn new(name: impl Into<String>, value: T) -> Self {
        Self {
            name: Arc::from(name.into()),
            inner: Arc::new(Mutex::new(value)),
            holder: Arc::new(SyncMutex::new(None)),
        }
    }

    /// Device name used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait up to `timeout` for exclusive access.
    ///
    /// # Arguments
    /// * `holder` - Identifies the caller in diagnostics and timeout errors
    /// * `timeout` - Maximum time to wait for the device
    ///
    /// # Errors
    /// `LockTimeout` naming the current holder when the wait runs out.
    pub async fn acquire(
        &self,
        holder: impl Into<String>,
        timeout: Duration,
    ) -> AppResult<DeviceGuard<T>> {
        let holder = holder.into();
        let started = Instant::now();

        match tokio::time::timeout(timeout, Arc::clone(&self.inner).lock_owned()).await {
            Ok(guard) => {
                trace!(device = %self.name, %holder, waited = ?started.elapsed(), "Device lock acquired");
                Ok(self.guard(guard, holder))
            }
            Err(_) => {
                let current = self
                    .current_holder()
                    .unwrap_or_else(|| "<unknown>".to_string());
                warn!(
                    device = %self.name,
                    %holder,
                    held_by = %current,
                    held_for = ?self.held_for(),
                    ?timeout,
                    "Timed out waiting for device lock"
                );
                Err(ControllerError::LockTimeout {
                    device: self.name.to_string(),
                    holder: current,
                    waited: started.elapsed(),
                })
            }
        }
    }

    /// Take the lock only if it is free right now.
    pub fn try_acquire(&self, holder: impl Into<String>) -> Option<DeviceGuard<T>> {
        Arc::clone(&self.inner)
            .try_lock_owned()
            .ok()
            .map(|guard| self.guard(guard, holder.into()))
    }

    /// Who holds the device right now, if anyone.
    pub fn current_holder(&self) -> Option<String> {
        self.holder.lock().as_ref().map(|h| h.holder.clone())
    }

    /// How long the current holder has held the device.
    pub fn held_for(&self) -> Option<Duration> {
        self.holder.lock().as_ref().map(|h| h.since.elapsed())
    }

    /// True when nobody holds the device.
    pub fn is_available(&self) -> bool {
        self.inner.try_lock().is_ok()
    }

    fn guard(&self, guard: OwnedMutexGuard<T>, holder: String) -> DeviceGuard<T> {
        *self.holder.lock() = Some(HolderInfo {
            holder: holder.clone(),
            since: Instant::now(),
        });
        DeviceGuard {
            guard,
            slot: Arc::clone(&self.holder),
            device: Arc::clone(&self.name),
            holder,
        }
    }
}

/// Exclusive access to a device; released on drop.
pub struct DeviceGuard<T> {
    guard: OwnedMutexGuard<T>,
    slot: Arc<SyncMutex<Option<HolderInfo>>>,
    device: Arc<str>,
    holder: String,
}

impl<T> fmt::Debug for DeviceGuard<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceGuard")
            .field("device", &self.device)
            .field("holder", &self.holder)
            .finish()
    }
}

impl<T> DeviceGuard<T> {
    /// Name the guard was acquired under.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Release explicitly. Equivalent to dropping the guard.
    pub fn release(self) {
        drop(self);
    }
}

impl<T> Deref for DeviceGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for DeviceGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for DeviceGuard<T> {
    fn drop(&mut self) {
        // cleared before the mutex itself unlocks, so the next holder's entry is never lost
        let held = self.slot.lock().take().map(|h| h.since.elapsed());
        debug!(device = %self.device, holder = %self.holder, ?held, "Device lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let lock = DeviceLock::new("psu", 0u32);
        assert!(lock.is_available());

        let mut guard = lock.acquire("caller-1", Duration::from_secs(1)).await.unwrap();
        *guard += 1;
        assert_eq!(lock.current_holder().as_deref(), Some("caller-1"));
        assert!(!lock.is_available());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(lock.held_for().unwrap() >= Duration::from_millis(20));
        guard.release();

        assert!(lock.is_available());
        assert!(lock.current_holder().is_none());
        assert!(lock.held_for().is_none());
        let guard = lock.acquire("caller-2", Duration::from_secs(1)).await.unwrap();
        assert_eq!(*guard, 1);
    }

    #[test]
    fn test_guard_debug_names_device_and_holder() {
        let lock = DeviceLock::new("psu", 5u8);
        let guard = lock.try_acquire("reader").unwrap();
        let shown = format!("{:?}", guard);
        assert!(shown.contains("psu"));
        assert!(shown.contains("reader"));
        assert!(!shown.contains('5'));
    }

    #[tokio::test]
    async fn test_held_lock_times_out_near_deadline() {
        let lock = DeviceLock::new("psu", ());
        let _held = lock.acquire("long-op", Duration::from_secs(1)).await.unwrap();

        let start = Instant::now();
        let err = lock
            .acquire("impatient", Duration::from_millis(100))
            .await
            .unwrap_err();
        let elapsed = start.elapsed();

        match err {
            ControllerError::LockTimeout { device, holder, .. } => {
                assert_eq!(device, "psu");
                assert_eq!(holder, "long-op");
            }
            other => panic!("expected LockTimeout, got {:?}", other),
        }
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_waiters_served_in_arrival_order() {
        let lock = DeviceLock::new("psu", Vec::<u32>::new());
        let first = lock.acquire("first", Duration::from_secs(1)).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..5u32 {
            let lock = lock.clone();
            handles.push(tokio::spawn(async move {
                let mut guard = lock
                    .acquire(format!("waiter-{}", i), Duration::from_secs(5))
                    .await
                    .unwrap();
                guard.push(i);
            }));
            // let each waiter enqueue before the next one
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }

        let guard = lock.acquire("check", Duration::from_secs(1)).await.unwrap();
        assert_eq!(*guard, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_panic_while_holding_releases() {
        let lock = DeviceLock::new("psu", ());
        let cloned = lock.clone();
        let result = tokio::spawn(async move {
            let _guard = cloned.acquire("doomed", Duration::from_secs(1)).await.unwrap();
            panic!("operation blew up");
        })
        .await;
        assert!(result.is_err());
        assert!(lock.is_available());
        assert!(lock.try_acquire("next").is_some());
    }
}
