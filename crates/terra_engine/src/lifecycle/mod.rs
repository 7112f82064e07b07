//! # Object Lifecycle Manager
//!
//! Owns long-lived engine singletons behind typed slots and a caller-supplied
//! teardown priority. Objects are type-erased into a flat arena of
//! `(priority, sequence, Box<dyn Any>)` entries; each object releases its native
//! handles in its own `Drop`, so teardown order is the order entries are dropped.
//!
//! Teardown runs in strictly descending priority. Entries sharing a priority are
//! dropped in reverse registration order. After cleanup every slot is empty and
//! may be constructed again.
//!
//! ```
//! use terra_engine::lifecycle::{ObjectManager, Slot};
//!
//! const COUNTER: Slot<u32> = Slot::new("counter");
//!
//! let mut objects = ObjectManager::new();
//! objects.create_object(&COUNTER, 7, 3).unwrap();
//! assert_eq!(*objects.get(&COUNTER).unwrap(), 7);
//!
//! objects.start_clean_up();
//! assert!(!objects.contains(&COUNTER));
//! ```

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;

use crate::foundation::logging::debug;

/// Teardown priority; higher values are destroyed earlier
pub type Priority = u32;

/// Typed name of a lifecycle slot
///
/// A slot holds at most one live object of type `T` at a time.
pub struct Slot<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Slot<T> {
    /// Declare a slot
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    /// Slot name
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Slot<T> {}

impl<T> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Slot").field(&self.name).finish()
    }
}

/// Lifecycle manager misuse
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectManagerError {
    /// The slot already holds a live object
    #[error("Slot '{slot}' already holds a live object")]
    SlotOccupied {
        /// Slot name
        slot: &'static str,
    },

    /// The slot holds no object
    #[error("Slot '{slot}' is empty")]
    SlotEmpty {
        /// Slot name
        slot: &'static str,
    },

    /// The slot holds an object of another type
    #[error("Slot '{slot}' holds an object of a different type")]
    TypeMismatch {
        /// Slot name
        slot: &'static str,
    },

    /// A higher-priority object is still live and may depend on this one
    #[error("Slot '{slot}' cannot be destroyed while '{blocker}' (priority {priority}) is live")]
    OutOfOrder {
        /// Slot name
        slot: &'static str,
        /// Live slot that must be destroyed first
        blocker: &'static str,
        /// Priority of the blocking slot
        priority: Priority,
    },

    /// The same slot was requested twice in one mutable borrow
    #[error("Slot '{slot}' cannot be borrowed mutably twice")]
    AliasedBorrow {
        /// Slot name
        slot: &'static str,
    },
}

struct ManagedObject {
    slot: &'static str,
    priority: Priority,
    sequence: u64,
    object: Box<dyn Any>,
}

/// # Object Manager
///
/// Priority-tagged arena of heterogeneous engine objects.
#[derive(Default)]
pub struct ObjectManager {
    entries: Vec<ManagedObject>,
    next_sequence: u64,
}

impl ObjectManager {
    /// Create an empty manager
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_sequence: 0,
        }
    }

    /// Place `object` into `slot`, recorded for teardown at `priority`
    ///
    /// Fails with [`ObjectManagerError::SlotOccupied`] if the slot is live; the
    /// rejected object is dropped and the existing one is left untouched.
    pub fn create_object<T: 'static>(
        &mut self,
        slot: &Slot<T>,
        object: T,
        priority: Priority,
    ) -> Result<&mut T, ObjectManagerError> {
        self.ensure_vacant(slot)?;

        debug!("Created '{}' at teardown priority {}", slot.name, priority);
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.push(ManagedObject {
            slot: slot.name,
            priority,
            sequence,
            object: Box::new(object),
        });

        let entry = self
            .entries
            .last_mut()
            .ok_or(ObjectManagerError::SlotEmpty { slot: slot.name })?;
        entry
            .object
            .downcast_mut::<T>()
            .ok_or(ObjectManagerError::TypeMismatch { slot: slot.name })
    }

    /// Fail if `slot` already holds an object
    ///
    /// Lets callers reject a double construction before building anything.
    pub fn ensure_vacant<T>(&self, slot: &Slot<T>) -> Result<(), ObjectManagerError> {
        if self.position(slot.name).is_some() {
            return Err(ObjectManagerError::SlotOccupied { slot: slot.name });
        }
        Ok(())
    }

    /// Whether `slot` holds a live object
    pub fn contains<T>(&self, slot: &Slot<T>) -> bool {
        self.position(slot.name).is_some()
    }

    /// Borrow the object in `slot`
    pub fn get<T: 'static>(&self, slot: &Slot<T>) -> Result<&T, ObjectManagerError> {
        let index = self
            .position(slot.name)
            .ok_or(ObjectManagerError::SlotEmpty { slot: slot.name })?;
        self.entries[index]
            .object
            .downcast_ref::<T>()
            .ok_or(ObjectManagerError::TypeMismatch { slot: slot.name })
    }

    /// Mutably borrow the object in `slot`
    pub fn get_mut<T: 'static>(&mut self, slot: &Slot<T>) -> Result<&mut T, ObjectManagerError> {
        let index = self
            .position(slot.name)
            .ok_or(ObjectManagerError::SlotEmpty { slot: slot.name })?;
        self.entries[index]
            .object
            .downcast_mut::<T>()
            .ok_or(ObjectManagerError::TypeMismatch { slot: slot.name })
    }

    /// Borrow the object in `slot` if present
    pub fn try_get<T: 'static>(&self, slot: &Slot<T>) -> Option<&T> {
        self.get(slot).ok()
    }

    /// Mutably borrow two distinct slots at once
    pub fn get_pair_mut<A: 'static, B: 'static>(
        &mut self,
        first: &Slot<A>,
        second: &Slot<B>,
    ) -> Result<(&mut A, &mut B), ObjectManagerError> {
        let a = self
            .position(first.name)
            .ok_or(ObjectManagerError::SlotEmpty { slot: first.name })?;
        let b = self
            .position(second.name)
            .ok_or(ObjectManagerError::SlotEmpty { slot: second.name })?;
        if a == b {
            return Err(ObjectManagerError::AliasedBorrow { slot: first.name });
        }

        let (low, high) = (a.min(b), a.max(b));
        let (head, tail) = self.entries.split_at_mut(high);
        let (low_entry, high_entry) = (&mut head[low], &mut tail[0]);
        let (first_entry, second_entry) = if a < b {
            (low_entry, high_entry)
        } else {
            (high_entry, low_entry)
        };

        let first_object = first_entry
            .object
            .downcast_mut::<A>()
            .ok_or(ObjectManagerError::TypeMismatch { slot: first.name })?;
        let second_object = second_entry
            .object
            .downcast_mut::<B>()
            .ok_or(ObjectManagerError::TypeMismatch { slot: second.name })?;
        Ok((first_object, second_object))
    }

    /// Remove the object in `slot` and destroy it immediately
    ///
    /// Used for wholesale recreation (e.g. the swapchain on resize). Fails with
    /// [`ObjectManagerError::OutOfOrder`] while any object of strictly higher
    /// priority is live, since it may still reference this one.
    pub fn destroy_object<T: 'static>(&mut self, slot: &Slot<T>) -> Result<(), ObjectManagerError> {
        let index = self
            .position(slot.name)
            .ok_or(ObjectManagerError::SlotEmpty { slot: slot.name })?;
        if !self.entries[index].object.is::<T>() {
            return Err(ObjectManagerError::TypeMismatch { slot: slot.name });
        }
        let priority = self.entries[index].priority;
        if let Some(blocker) = self
            .entries
            .iter()
            .filter(|entry| entry.priority > priority)
            .max_by_key(|entry| (entry.priority, entry.sequence))
        {
            return Err(ObjectManagerError::OutOfOrder {
                slot: slot.name,
                blocker: blocker.slot,
                priority: blocker.priority,
            });
        }
        let entry = self.entries.remove(index);
        debug!("Destroying '{}' (priority {})", entry.slot, entry.priority);
        drop(entry);
        Ok(())
    }

    /// Slot names in the order `start_clean_up` would destroy them
    pub fn teardown_order(&self) -> Vec<(&'static str, Priority)> {
        let mut order: Vec<_> = self
            .entries
            .iter()
            .map(|entry| (entry.priority, entry.sequence, entry.slot))
            .collect();
        order.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
        order.into_iter().map(|(priority, _, slot)| (slot, priority)).collect()
    }

    /// Number of live objects
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no object is live
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Destroy every object, highest priority first
    pub fn start_clean_up(&mut self) {
        if self.entries.is_empty() {
            return;
        }

        // Ascending (priority, sequence) so popping from the back yields teardown order
        self.entries
            .sort_by(|a, b| a.priority.cmp(&b.priority).then(a.sequence.cmp(&b.sequence)));

        while let Some(entry) = self.entries.pop() {
            debug!("Destroying '{}' (priority {})", entry.slot, entry.priority);
            drop(entry);
        }
    }

    fn position(&self, slot: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.slot == slot)
    }
}

impl Drop for ObjectManager {
    fn drop(&mut self) {
        self.start_clean_up();
    }
}

impl fmt::Debug for ObjectManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectManager")
            .field("teardown_order", &self.teardown_order())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    type DropLog = Rc<RefCell<Vec<&'static str>>>;

    struct Tracked {
        name: &'static str,
        log: DropLog,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.log.borrow_mut().push(self.name);
        }
    }

    fn tracked(name: &'static str, log: &DropLog) -> Tracked {
        Tracked {
            name,
            log: Rc::clone(log),
        }
    }

    const A: Slot<Tracked> = Slot::new("a");
    const B: Slot<Tracked> = Slot::new("b");
    const C: Slot<Tracked> = Slot::new("c");
    const D: Slot<Tracked> = Slot::new("d");

    #[test]
    fn test_teardown_descending_priority() {
        let log = DropLog::default();
        let mut objects = ObjectManager::new();

        // Registration order deliberately differs from priority order
        objects.create_object(&C, tracked("p3", &log), 3).unwrap();
        objects.create_object(&A, tracked("p5", &log), 5).unwrap();
        objects.create_object(&D, tracked("p1", &log), 1).unwrap();
        objects.create_object(&B, tracked("p4", &log), 4).unwrap();

        objects.start_clean_up();

        assert_eq!(*log.borrow(), vec!["p5", "p4", "p3", "p1"]);
        assert!(objects.is_empty());
    }

    #[test]
    fn test_equal_priority_reverse_registration() {
        let log = DropLog::default();
        let mut objects = ObjectManager::new();

        objects.create_object(&A, tracked("first", &log), 2).unwrap();
        objects.create_object(&B, tracked("second", &log), 2).unwrap();
        objects.create_object(&C, tracked("top", &log), 9).unwrap();
        objects.create_object(&D, tracked("third", &log), 2).unwrap();

        assert_eq!(
            objects.teardown_order(),
            vec![("c", 9), ("d", 2), ("b", 2), ("a", 2)]
        );

        objects.start_clean_up();
        assert_eq!(*log.borrow(), vec!["top", "third", "second", "first"]);
    }

    #[test]
    fn test_double_create_is_rejected() {
        let log = DropLog::default();
        let mut objects = ObjectManager::new();

        objects.create_object(&A, tracked("original", &log), 1).unwrap();
        let result = objects.create_object(&A, tracked("duplicate", &log), 1);

        assert_eq!(result.err(), Some(ObjectManagerError::SlotOccupied { slot: "a" }));
        // The rejected object is dropped, the live one is untouched
        assert_eq!(*log.borrow(), vec!["duplicate"]);
        assert_eq!(objects.get(&A).unwrap().name, "original");
        assert_eq!(objects.len(), 1);
    }

    #[test]
    fn test_reconstruct_after_clean_up() {
        let log = DropLog::default();
        let mut objects = ObjectManager::new();

        objects.create_object(&A, tracked("run1", &log), 1).unwrap();
        objects.start_clean_up();
        assert!(!objects.contains(&A));
        assert_eq!(objects.get(&A).err(), Some(ObjectManagerError::SlotEmpty { slot: "a" }));

        objects.create_object(&A, tracked("run2", &log), 1).unwrap();
        assert!(objects.contains(&A));
        drop(objects);

        assert_eq!(*log.borrow(), vec!["run1", "run2"]);
    }

    #[test]
    fn test_type_mismatch() {
        const NUMBER: Slot<u32> = Slot::new("value");
        const TEXT: Slot<String> = Slot::new("value");

        let mut objects = ObjectManager::new();
        objects.create_object(&NUMBER, 42, 0).unwrap();

        assert_eq!(
            objects.get(&TEXT).err(),
            Some(ObjectManagerError::TypeMismatch { slot: "value" })
        );
        assert!(objects.destroy_object(&TEXT).is_err());
        assert_eq!(*objects.get(&NUMBER).unwrap(), 42);
    }

    #[test]
    fn test_get_pair_mut() {
        const LEFT: Slot<Vec<u32>> = Slot::new("left");
        const RIGHT: Slot<u64> = Slot::new("right");

        let mut objects = ObjectManager::new();
        objects.create_object(&LEFT, vec![1, 2], 0).unwrap();
        objects.create_object(&RIGHT, 10, 1).unwrap();

        {
            let (right, left) = objects.get_pair_mut(&RIGHT, &LEFT).unwrap();
            *right += 1;
            left.push(3);
        }

        assert_eq!(*objects.get(&RIGHT).unwrap(), 11);
        assert_eq!(*objects.get(&LEFT).unwrap(), vec![1, 2, 3]);
        assert_eq!(
            objects.get_pair_mut(&LEFT, &LEFT).err(),
            Some(ObjectManagerError::AliasedBorrow { slot: "left" })
        );
    }

    #[test]
    fn test_destroy_object_frees_slot() {
        let log = DropLog::default();
        let mut objects = ObjectManager::new();

        objects.create_object(&A, tracked("swapchain", &log), 6).unwrap();
        objects.create_object(&B, tracked("device", &log), 2).unwrap();
        objects.destroy_object(&A).unwrap();
        assert_eq!(*log.borrow(), vec!["swapchain"]);

        objects.create_object(&A, tracked("swapchain2", &log), 6).unwrap();
        objects.start_clean_up();
        assert_eq!(*log.borrow(), vec!["swapchain", "swapchain2", "device"]);
    }

    #[test]
    fn test_destroy_below_live_dependent_is_rejected() {
        let log = DropLog::default();
        let mut objects = ObjectManager::new();

        objects.create_object(&A, tracked("device", &log), 2).unwrap();
        objects.create_object(&B, tracked("allocator", &log), 3).unwrap();
        objects.create_object(&C, tracked("staging", &log), 3).unwrap();

        assert_eq!(
            objects.destroy_object(&A).err(),
            Some(ObjectManagerError::OutOfOrder {
                slot: "a",
                blocker: "c",
                priority: 3
            })
        );
        assert!(log.borrow().is_empty());
        assert_eq!(objects.len(), 3);

        // Equal priorities do not block each other
        objects.destroy_object(&B).unwrap();
        objects.destroy_object(&C).unwrap();
        objects.destroy_object(&A).unwrap();
        assert_eq!(*log.borrow(), vec!["allocator", "staging", "device"]);
    }
}
