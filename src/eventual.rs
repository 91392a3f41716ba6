use std::sync::{Arc, Mutex};

use crate::error::{Fault, ProviderError};

type Callback<T> = Box<dyn FnOnce(Result<T, ProviderError>) + Send>;

enum Slot<T> {
    /// Not yet settled; holds the continuations waiting for the value.
    Pending(Vec<Callback<T>>),
    Resolved(T),
    Failed(ProviderError),
}

/// A single-assignment value produced by one resource and consumed by any
/// number of downstream resources.
///
/// An `Eventual<T>` starts out pending and settles exactly once, either with
/// a value ([`resolve`](Self::resolve)) or with the error of the producing
/// resource ([`fail`](Self::fail)). Cloning the handle is how a consumer
/// subscribes; there is no way to observe an unsettled value other than
/// [`is_ready`](Self::is_ready) or [`try_get`](Self::try_get).
///
/// Settling twice is a [`Fault`]: it means the graph machinery tried to
/// produce the same output twice, and the first value is left untouched.
pub struct Eventual<T> {
    label: Arc<str>,
    inner: Arc<Mutex<Slot<T>>>,
}

impl<T> Clone for Eventual<T> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Eventual<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Eventual<T> {
    /// Creates a new pending value.
    pub fn new() -> Self {
        Self::named("value")
    }

    /// Creates a new pending value with a label used in fault reports,
    /// conventionally `resource.attribute`.
    pub fn named(label: impl Into<Arc<str>>) -> Self {
        Self {
            label: label.into(),
            inner: Arc::new(Mutex::new(Slot::Pending(Vec::new()))),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns whether the value has settled, successfully or not.
    pub fn is_ready(&self) -> bool {
        !matches!(*self.inner.lock().unwrap(), Slot::Pending(_))
    }
}

impl<T: Clone> Eventual<T> {
    /// Settles the value. Returns a [`Fault`] if it already settled; the
    /// original outcome is unaffected.
    pub fn resolve(&self, value: T) -> Result<(), Fault> {
        let waiters = {
            let mut slot = self.inner.lock().unwrap();
            match &mut *slot {
                Slot::Pending(waiters) => {
                    let waiters = std::mem::take(waiters);
                    *slot = Slot::Resolved(value.clone());
                    waiters
                }
                Slot::Resolved(_) => return Err(Fault::AlreadyResolved(self.label.to_string())),
                Slot::Failed(_) => return Err(Fault::AlreadyFailed(self.label.to_string())),
            }
        };

        // Continuations run outside the lock so they may inspect the value.
        for waiter in waiters {
            waiter(Ok(value.clone()));
        }

        Ok(())
    }

    /// Settles the value as failed. Same single-shot rule as
    /// [`resolve`](Self::resolve).
    pub fn fail(&self, error: ProviderError) -> Result<(), Fault> {
        let waiters = {
            let mut slot = self.inner.lock().unwrap();
            match &mut *slot {
                Slot::Pending(waiters) => {
                    let waiters = std::mem::take(waiters);
                    *slot = Slot::Failed(error.clone());
                    waiters
                }
                Slot::Resolved(_) => return Err(Fault::AlreadyResolved(self.label.to_string())),
                Slot::Failed(_) => return Err(Fault::AlreadyFailed(self.label.to_string())),
            }
        };

        for waiter in waiters {
            waiter(Err(error.clone()));
        }

        Ok(())
    }

    /// Registers a continuation invoked exactly once when the value settles.
    /// If it already settled, the callback fires immediately.
    pub fn on_ready<F>(&self, callback: F)
    where
        F: FnOnce(Result<T, ProviderError>) + Send + 'static,
    {
        let ready = {
            let mut slot = self.inner.lock().unwrap();
            match &mut *slot {
                Slot::Pending(waiters) => {
                    waiters.push(Box::new(callback));
                    return;
                }
                Slot::Resolved(value) => Ok(value.clone()),
                Slot::Failed(error) => Err(error.clone()),
            }
        };

        callback(ready);
    }

    /// Returns the settled outcome, or `None` while pending.
    pub fn try_get(&self) -> Option<Result<T, ProviderError>> {
        match &*self.inner.lock().unwrap() {
            Slot::Pending(_) => None,
            Slot::Resolved(value) => Some(Ok(value.clone())),
            Slot::Failed(error) => Some(Err(error.clone())),
        }
    }
}

impl<T> std::fmt::Debug for Eventual<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.inner.lock().unwrap() {
            Slot::Pending(_) => "pending",
            Slot::Resolved(_) => "resolved",
            Slot::Failed(_) => "failed",
        };
        write!(f, "Eventual({}, {state})", self.label)
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_resolve_once() {
        let value = Eventual::named("network.id");
        assert!(!value.is_ready());

        value.resolve("vpc-123".to_string()).unwrap();
        assert!(value.is_ready());
        assert_eq!(value.try_get().unwrap().unwrap(), "vpc-123");
    }

    #[test]
    fn test_double_resolve_is_fault() {
        let value = Eventual::named("network.id");
        value.resolve(1).unwrap();

        let fault = value.resolve(2).unwrap_err();
        assert_eq!(fault, Fault::AlreadyResolved("network.id".to_string()));

        // The first resolution must be unaffected.
        assert_eq!(value.try_get().unwrap().unwrap(), 1);
    }

    #[test]
    fn test_settle_after_fail_is_fault() {
        let value = Eventual::named("lb.dns_name");
        value.fail(ProviderError::msg("boom")).unwrap();

        assert!(matches!(value.resolve(1), Err(Fault::AlreadyFailed(_))));
        assert!(matches!(
            value.fail(ProviderError::msg("again")),
            Err(Fault::AlreadyFailed(_))
        ));
        assert!(value.try_get().unwrap().is_err());
    }

    #[test]
    fn test_on_ready_fires_exactly_once() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        let value = Eventual::<u32>::new();
        value.on_ready(|_| {
            CALLS.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(CALLS.load(Ordering::SeqCst), 0);
        value.resolve(7).unwrap();
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);

        // Registered after settling, the callback fires immediately.
        value.on_ready(|outcome| {
            assert_eq!(outcome.unwrap(), 7);
            CALLS.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(CALLS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_on_ready_observes_failure() {
        let value = Eventual::<u32>::named("service.arn");
        let seen = Arc::new(Mutex::new(None));

        let sink = seen.clone();
        value.on_ready(move |outcome| {
            *sink.lock().unwrap() = Some(outcome.is_err());
        });

        value.fail(ProviderError::msg("out of capacity")).unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(true));
    }
}
