use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError, Weak,
    },
};

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Entries<E> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener<E>)>>,
}

/// Registry of independent event listeners
///
/// Each registration gets its own [`Subscription`]; removing one never
/// touches the others.
pub struct ListenerRegistry<E> {
    entries: Arc<Entries<E>>,
}

impl<E> Clone for ListenerRegistry<E> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<E> Default for ListenerRegistry<E> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Entries {
                next_id: AtomicU64::new(0),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl<E> ListenerRegistry<E> {
    /// Number of registered listeners
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no listener is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> fmt::Debug for ListenerRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

impl<E: 'static> ListenerRegistry<E> {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener
    pub fn add<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.entries.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));

        let weak: Weak<Entries<E>> = Arc::downgrade(&self.entries);
        Subscription {
            remove: Box::new(move || {
                if let Some(entries) = weak.upgrade() {
                    entries
                        .listeners
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .retain(|(entry_id, _)| *entry_id != id);
                }
            }),
            released: AtomicBool::new(false),
        }
    }

    /// Deliver an event to every registered listener
    ///
    /// Listeners are called outside the registry lock, so a listener may
    /// unsubscribe itself or others while being notified.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = self
            .entries
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in snapshot {
            listener(event);
        }
    }
}

/// Handle that removes one listener registration
pub struct Subscription {
    remove: Box<dyn Fn() + Send + Sync>,
    released: AtomicBool,
}

impl Subscription {
    /// Remove the listener; further calls do nothing
    pub fn unsubscribe(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            (self.remove)();
        }
    }

    /// Whether the listener is still registered through this handle
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.released.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}
