use std::any::Any;
use std::rc::Rc;
use std::sync::Mutex;
use thiserror::Error;

/// Scope of a reserved user-argument slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserArgScope {
    Ssn,
    Txn,
    Global,
}

const MAX_SLOTS: usize = 16;

#[derive(Debug, Error)]
pub enum UserArgError {
    #[error("no free {0:?} user-arg slots (max {MAX_SLOTS})")]
    Exhausted(UserArgScope),
    #[error("user-arg name already reserved: {0}")]
    Duplicate(String),
}

#[derive(Debug, Clone)]
struct SlotInfo {
    name: String,
    description: String,
}

/// Process-wide registry of named user-argument slot indices, reserved at
/// startup. The indices are stable for the process lifetime so plugins can
/// cache them.
#[derive(Default)]
pub struct UserArgRegistry {
    ssn: Mutex<Vec<SlotInfo>>,
    txn: Mutex<Vec<SlotInfo>>,
    global: Mutex<Vec<SlotInfo>>,
}

impl UserArgRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self, scope: UserArgScope) -> &Mutex<Vec<SlotInfo>> {
        match scope {
            UserArgScope::Ssn => &self.ssn,
            UserArgScope::Txn => &self.txn,
            UserArgScope::Global => &self.global,
        }
    }

    pub fn reserve(
        &self,
        scope: UserArgScope,
        name: &str,
        description: &str,
    ) -> Result<usize, UserArgError> {
        let mut slots = self.slots(scope).lock().unwrap_or_else(|e| e.into_inner());
        if slots.iter().any(|s| s.name == name) {
            return Err(UserArgError::Duplicate(name.to_string()));
        }
        if slots.len() >= MAX_SLOTS {
            return Err(UserArgError::Exhausted(scope));
        }
        slots.push(SlotInfo { name: name.to_string(), description: description.to_string() });
        Ok(slots.len() - 1)
    }

    pub fn lookup(&self, scope: UserArgScope, name: &str) -> Option<usize> {
        let slots = self.slots(scope).lock().unwrap_or_else(|e| e.into_inner());
        slots.iter().position(|s| s.name == name)
    }

    pub fn describe(&self, scope: UserArgScope, index: usize) -> Option<(String, String)> {
        let slots = self.slots(scope).lock().unwrap_or_else(|e| e.into_inner());
        slots.get(index).map(|s| (s.name.clone(), s.description.clone()))
    }
}

/// Indexed plugin data attached to one session or transaction. The reactor
/// provides no synchronization beyond the per-SM serialization, so values
/// are plain `Rc`s.
#[derive(Default)]
pub struct UserArgs {
    slots: Vec<Option<Rc<dyn Any>>>,
}

impl UserArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, index: usize, value: Rc<dyn Any>) {
        if self.slots.len() <= index {
            self.slots.resize(index + 1, None);
        }
        self.slots[index] = Some(value);
    }

    pub fn get(&self, index: usize) -> Option<Rc<dyn Any>> {
        self.slots.get(index).and_then(|s| s.clone())
    }

    pub fn get_as<T: 'static>(&self, index: usize) -> Option<Rc<T>> {
        self.get(index).and_then(|rc| rc.downcast::<T>().ok())
    }

    pub fn clear(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_returns_sequential_indices() {
        let reg = UserArgRegistry::new();
        let a = reg.reserve(UserArgScope::Txn, "gzip.state", "gzip context").unwrap();
        let b = reg.reserve(UserArgScope::Txn, "bg_fetch.url", "background fetch key").unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(reg.lookup(UserArgScope::Txn, "bg_fetch.url"), Some(1));
    }

    #[test]
    fn scopes_are_independent() {
        let reg = UserArgRegistry::new();
        let t = reg.reserve(UserArgScope::Txn, "x", "").unwrap();
        let s = reg.reserve(UserArgScope::Ssn, "x", "").unwrap();
        assert_eq!((t, s), (0, 0));
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let reg = UserArgRegistry::new();
        reg.reserve(UserArgScope::Ssn, "x", "").unwrap();
        assert!(matches!(
            reg.reserve(UserArgScope::Ssn, "x", ""),
            Err(UserArgError::Duplicate(_))
        ));
    }

    #[test]
    fn slots_exhaust_at_max() {
        let reg = UserArgRegistry::new();
        for i in 0..16 {
            reg.reserve(UserArgScope::Global, &format!("slot{i}"), "").unwrap();
        }
        assert!(matches!(
            reg.reserve(UserArgScope::Global, "one-too-many", ""),
            Err(UserArgError::Exhausted(_))
        ));
    }

    #[test]
    fn args_round_trip_typed_values() {
        let mut args = UserArgs::new();
        args.set(3, Rc::new(42u64));
        assert_eq!(args.get_as::<u64>(3).as_deref(), Some(&42));
        assert!(args.get_as::<String>(3).is_none(), "wrong type downcast fails");
        assert!(args.get(0).is_none());
        args.clear(3);
        assert!(args.get(3).is_none());
    }

    #[test]
    fn describe_reports_reservation() {
        let reg = UserArgRegistry::new();
        let idx = reg.reserve(UserArgScope::Txn, "hdr_rw", "header rewrite state").unwrap();
        let (name, desc) = reg.describe(UserArgScope::Txn, idx).unwrap();
        assert_eq!(name, "hdr_rw");
        assert_eq!(desc, "header rewrite state");
    }
}
