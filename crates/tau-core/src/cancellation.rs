//! Cooperative cancellation scopes shared by subscribers and blocked requesters.
use std::{
    fmt,
    pin::pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
};

use tokio::sync::Notify;

type CancelCallback = Box<dyn FnOnce() + Send + 'static>;

/// Cooperative cancellation token shared across runtime components.
///
/// Cloning a token shares the same scope. Cancellation is one-way and
/// idempotent; waiters and registered callbacks are released exactly once.
#[derive(Clone, Default)]
pub struct CooperativeCancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
    callbacks: Mutex<CallbackSlots>,
    parent: Mutex<Option<CancelRegistration>>,
}

impl Drop for TokenInner {
    fn drop(&mut self) {
        let parent = match self.parent.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(registration) = parent {
            registration.unregister();
        }
    }
}

#[derive(Default)]
struct CallbackSlots {
    next_id: u64,
    entries: Vec<(u64, CancelCallback)>,
}

impl fmt::Debug for CooperativeCancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CooperativeCancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CooperativeCancellationToken {
    /// Creates a new, not-yet-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the token as cancelled, wakes pending waiters and runs callbacks.
    pub fn cancel(&self) {
        let already_cancelled = self.inner.cancelled.swap(true, Ordering::SeqCst);
        if already_cancelled {
            return;
        }
        self.inner.notify.notify_waiters();
        let drained = std::mem::take(&mut lock_or_recover(&self.inner.callbacks).entries);
        for (_, callback) in drained {
            callback();
        }
        let parent = lock_or_recover(&self.inner.parent).take();
        if let Some(registration) = parent {
            registration.unregister();
        }
    }

    /// Returns true when cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut notified = pin!(self.inner.notify.notified());
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    /// Returns a token cancelled together with `self`, or on its own.
    ///
    /// The parent callback is released once the child is cancelled or its last
    /// handle is dropped.
    pub fn child_token(&self) -> Self {
        let child = Self::new();
        let weak_child = Arc::downgrade(&child.inner);
        let registration = self.on_cancel(move || {
            if let Some(inner) = weak_child.upgrade() {
                CooperativeCancellationToken { inner }.cancel();
            }
        });
        *lock_or_recover(&child.inner.parent) = Some(registration);
        child
    }

    /// Runs `callback` once when the token is cancelled.
    ///
    /// The callback runs inline when the token is already cancelled, so it must
    /// not take locks the caller currently holds.
    pub fn on_cancel<F>(&self, callback: F) -> CancelRegistration
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slots = lock_or_recover(&self.inner.callbacks);
        if self.is_cancelled() {
            drop(slots);
            callback();
            return CancelRegistration {
                token: Weak::new(),
                id: 0,
            };
        }
        let id = slots.next_id;
        slots.next_id += 1;
        slots.entries.push((id, Box::new(callback)));
        CancelRegistration {
            token: Arc::downgrade(&self.inner),
            id,
        }
    }

    #[cfg(test)]
    fn registered_callbacks(&self) -> usize {
        lock_or_recover(&self.inner.callbacks).entries.len()
    }
}

/// Handle to a callback registered with [`CooperativeCancellationToken::on_cancel`].
///
/// Dropping the handle keeps the callback armed; call [`CancelRegistration::unregister`]
/// to release it before the token fires.
#[derive(Debug)]
pub struct CancelRegistration {
    token: Weak<TokenInner>,
    id: u64,
}

impl CancelRegistration {
    /// Removes the callback if it has not run yet.
    pub fn unregister(self) {
        let Some(inner) = self.token.upgrade() else {
            return;
        };
        lock_or_recover(&inner.callbacks)
            .entries
            .retain(|(id, _)| *id != self.id);
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
