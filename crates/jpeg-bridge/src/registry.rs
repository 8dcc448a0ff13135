//! Process-wide table from opaque session handles to bridge state.
//!
//! The engine's callbacks only receive the session's `client_data` pointer.
//! We store a handle there, never an address, and resolve it here on every
//! callback. A handle whose session has ended no longer resolves, so a stale
//! callback surfaces as an invariant violation instead of a dangling access.
//!
//! Handles come from a monotonically increasing counter and are never reused.

use std::collections::HashMap;
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

use crate::types::CodecError;

/// Which bridge a registered state belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Decode,
    Encode,
}

/// Opaque identifier handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Handle(NonZeroUsize);

impl Handle {
    /// Encode as the engine's `client_data` value.
    pub(crate) fn to_client_data(self) -> *mut c_void {
        self.0.get() as *mut c_void
    }

    pub(crate) fn from_client_data(data: *mut c_void) -> Option<Self> {
        NonZeroUsize::new(data as usize).map(Handle)
    }
}

/// Address of a session's bridge state.
///
/// Only the session that registered the entry dereferences it, on its own
/// thread, while it still owns the allocation.
#[derive(Debug, Clone, Copy)]
struct StatePtr(NonNull<()>);

// SAFETY: the registry only stores and returns the address; it never reads
// through it.
unsafe impl Send for StatePtr {}

#[derive(Debug)]
struct Entry {
    state: StatePtr,
    direction: Direction,
}

/// Concurrency-safe handle table.
#[derive(Debug)]
pub(crate) struct Registry {
    next: AtomicUsize,
    entries: Mutex<HashMap<Handle, Entry>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicUsize::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Handle, Entry>> {
        // Entries are inserted and removed whole; a panic elsewhere cannot
        // leave the map half-updated.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record `state` and return the handle that resolves to it.
    pub(crate) fn register(&self, state: NonNull<()>, direction: Direction) -> Handle {
        // Starts at 1 and is never reset.
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let handle = Handle(NonZeroUsize::new(id).unwrap_or(NonZeroUsize::MAX));
        self.entries().insert(
            handle,
            Entry {
                state: StatePtr(state),
                direction,
            },
        );
        handle
    }

    /// Resolve `handle` to the state registered for `direction`.
    pub(crate) fn lookup(
        &self,
        handle: Handle,
        direction: Direction,
    ) -> Result<NonNull<()>, CodecError> {
        match self.entries().get(&handle) {
            Some(entry) if entry.direction == direction => Ok(entry.state.0),
            Some(entry) => Err(CodecError::InternalInvariant(format!(
                "session handle {} belongs to a {:?} session, not {:?}",
                handle.0, entry.direction, direction
            ))),
            None => Err(CodecError::InternalInvariant(format!(
                "session handle {} is not registered",
                handle.0
            ))),
        }
    }

    /// Remove `handle`. Returns false if it was not registered.
    pub(crate) fn unregister(&self, handle: Handle) -> bool {
        self.entries().remove(&handle).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries().len()
    }
}

/// The registry shared by every session in the process.
pub(crate) fn global() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

/// Number of sessions currently registered in this process.
///
/// Returns to zero once every decode and encode has returned, whether it
/// succeeded or failed.
pub fn active_sessions() -> usize {
    global().len()
}

/// Registration that removes itself exactly once, when dropped.
#[derive(Debug)]
pub(crate) struct Registration {
    handle: Handle,
    registry: &'static Registry,
}

impl Registration {
    pub(crate) fn new(state: NonNull<()>, direction: Direction) -> Self {
        let registry = global();
        let handle = registry.register(state, direction);
        log::trace!("registered {direction:?} session {}", handle.0);
        Self { handle, registry }
    }

    pub(crate) fn handle(&self) -> Handle {
        self.handle
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if !self.registry.unregister(self.handle) {
            log::error!("session {} was already unregistered", self.handle.0);
        }
    }
}

/// Resolve an engine `client_data` value through the global registry.
pub(crate) fn resolve(data: *mut c_void, direction: Direction) -> Result<NonNull<()>, CodecError> {
    let handle = Handle::from_client_data(data).ok_or_else(|| {
        CodecError::InternalInvariant("engine callback carried no session handle".to_string())
    })?;
    global().lookup(handle, direction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn dummy(value: &mut u32) -> NonNull<()> {
        NonNull::from(value).cast()
    }

    #[test]
    fn test_register_lookup_unregister() {
        let registry = Registry::new();
        let mut value = 7u32;
        let handle = registry.register(dummy(&mut value), Direction::Decode);

        assert_eq!(registry.len(), 1);
        let ptr = registry.lookup(handle, Direction::Decode).unwrap();
        assert_eq!(unsafe { *ptr.cast::<u32>().as_ptr() }, 7);

        assert!(registry.unregister(handle));
        assert_eq!(registry.len(), 0);
        assert!(!registry.unregister(handle));
    }

    #[test]
    fn test_lookup_unknown_handle_is_invariant_violation() {
        let registry = Registry::new();
        let handle = Handle(NonZeroUsize::new(99).unwrap());
        let err = registry.lookup(handle, Direction::Encode).unwrap_err();
        assert!(matches!(err, CodecError::InternalInvariant(_)));
    }

    #[test]
    fn test_lookup_wrong_direction() {
        let registry = Registry::new();
        let mut value = 1u32;
        let handle = registry.register(dummy(&mut value), Direction::Encode);
        assert!(registry.lookup(handle, Direction::Decode).is_err());
        registry.unregister(handle);
    }

    #[test]
    fn test_handles_are_not_reused() {
        let registry = Registry::new();
        let mut value = 0u32;
        let first = registry.register(dummy(&mut value), Direction::Decode);
        registry.unregister(first);
        let second = registry.register(dummy(&mut value), Direction::Decode);
        assert_ne!(first, second);
        assert!(registry.lookup(first, Direction::Decode).is_err());
        registry.unregister(second);
    }

    #[test]
    fn test_client_data_round_trip() {
        let handle = Handle(NonZeroUsize::new(42).unwrap());
        assert_eq!(Handle::from_client_data(handle.to_client_data()), Some(handle));
        assert_eq!(Handle::from_client_data(std::ptr::null_mut()), None);
    }

    #[test]
    fn test_concurrent_registration() {
        let registry = Arc::new(Registry::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let mut value = 0u32;
                    for _ in 0..100 {
                        let handle = registry.register(dummy(&mut value), Direction::Decode);
                        assert!(registry.lookup(handle, Direction::Decode).is_ok());
                        assert!(registry.unregister(handle));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(registry.len(), 0);
    }
}
