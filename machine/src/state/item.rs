//! Persistable state cells.

use super::codec;
use bincode::Options;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// A shared, persistable value.
///
/// The owning component keeps one clone and registers another with the
/// [`StateManager`](super::StateManager); both see the same value. Saving
/// reads the current value, loading replaces it.
pub struct StateItem<T>(Rc<RefCell<T>>);

impl<T> StateItem<T> {
    pub fn new(value: T) -> Self {
        Self(Rc::new(RefCell::new(value)))
    }

    pub fn set(&self, value: T) {
        *self.0.borrow_mut() = value;
    }

    pub fn replace(&self, value: T) -> T {
        self.0.replace(value)
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.0.borrow())
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.0.borrow_mut())
    }
}

impl<T: Clone> StateItem<T> {
    pub fn get(&self) -> T {
        self.0.borrow().clone()
    }
}

impl<T> Clone for StateItem<T> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

impl<T: Default> Default for StateItem<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for StateItem<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StateItem").field(&*self.0.borrow()).finish()
    }
}

/// Deferred assignment produced by [`SaveEntry::stage`].
pub(crate) type StagedLoad = Box<dyn FnOnce()>;

/// Type-erased view of a registered [`StateItem`].
pub(crate) trait SaveEntry {
    fn type_name(&self) -> &'static str;
    fn encode(&self) -> bincode::Result<Vec<u8>>;
    /// Decode `bytes` without touching the live value; the returned closure
    /// performs the assignment.
    fn stage(&self, bytes: &[u8]) -> bincode::Result<StagedLoad>;
}

impl<T> SaveEntry for StateItem<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn encode(&self) -> bincode::Result<Vec<u8>> {
        codec().serialize(&*self.0.borrow())
    }

    fn stage(&self, bytes: &[u8]) -> bincode::Result<StagedLoad> {
        let value: T = codec().deserialize(bytes)?;
        let target = self.clone();
        Ok(Box::new(move || target.set(value)))
    }
}
