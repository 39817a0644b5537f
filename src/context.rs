//! Fiber-local variables and continuation snapshots.
//!
//! Every fiber carries an ambient, typed key-value set — read implicitly by
//! the code running on it rather than passed as parameters. When work moves
//! to another fiber (a pool dispatch, or a reaction registered on a promise)
//! the current set is captured as a [`Snapshot`] and installed on the fiber
//! that eventually executes, so request- and transaction-like state follows
//! the *logical* caller, not the physical executor.
//!
//! # Shallow-clone semantics
//!
//! Snapshot capture shallow-clones each value:
//!
//! - scalars are copied by value, strings share their allocation;
//! - lists are copied element-wise at the top level;
//! - records ([`ContextRecord`]) are copied field-wise into a **new**
//!   record, while records nested *inside* those fields remain shared
//!   between parent and child.
//!
//! Nested sharing is deliberate, not a defect: a snapshot isolates the
//! top-level shape of the caller's state cheaply and leaves deep structures
//! aliased, exactly like a shallow object copy. Do not deep-clone.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Error;
use crate::fiber;

/// A shared, mutable structured record stored in fiber-local state.
///
/// `ContextRecord` is the only context value with interior mutability, which
/// makes the shallow-clone rule observable: after a snapshot, writes to the
/// *copy's* top-level fields are invisible to the original, while writes to
/// a record nested inside a field are visible to both.
///
/// Cloning a `ContextRecord` (or a [`ContextValue::Record`]) shares the
/// underlying record; [`ContextValue::shallow_clone`] is what produces the
/// field-wise copy.
#[derive(Clone, Default)]
pub struct ContextRecord {
    fields: Arc<RwLock<BTreeMap<String, ContextValue>>>,
}

impl ContextRecord {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a field, sharing any nested structure.
    pub fn get(&self, key: &str) -> Option<ContextValue> {
        self.fields.read().get(key).cloned()
    }

    /// Writes a field.
    pub fn set(&self, key: impl Into<String>, value: impl Into<ContextValue>) {
        self.fields.write().insert(key.into(), value.into());
    }

    /// Removes a field, returning its previous value.
    pub fn remove(&self, key: &str) -> Option<ContextValue> {
        self.fields.write().remove(key)
    }

    /// Number of top-level fields.
    pub fn len(&self) -> usize {
        self.fields.read().len()
    }

    /// Whether the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.read().is_empty()
    }

    /// Whether two handles refer to the same underlying record.
    ///
    /// This is the identity test the shallow-clone semantics are defined in
    /// terms of: a snapshot's top-level record is *not* `ptr_eq` with the
    /// original, while nested records are.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.fields, &other.fields)
    }

    /// Field-wise copy: a new record whose top-level values are
    /// share-clones of the original's.
    fn shallow_clone(&self) -> Self {
        let copy: BTreeMap<String, ContextValue> = self
            .fields
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self {
            fields: Arc::new(RwLock::new(copy)),
        }
    }
}

impl fmt::Debug for ContextRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.fields.read().iter()).finish()
    }
}

/// A value stored in fiber-local state.
///
/// Equality is structural for scalars and lists; for records it is
/// *identity* ([`ContextRecord::ptr_eq`]), because two records with equal
/// fields but separate storage behave differently under mutation.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum ContextValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    List(Vec<ContextValue>),
    Record(ContextRecord),
}

impl ContextValue {
    /// Shallow clone per the snapshot rule: scalars by value, lists copied
    /// element-wise at the top level, records copied field-wise with nested
    /// records still shared.
    pub fn shallow_clone(&self) -> Self {
        match self {
            ContextValue::List(items) => ContextValue::List(items.clone()),
            ContextValue::Record(record) => ContextValue::Record(record.shallow_clone()),
            other => other.clone(),
        }
    }

    /// Returns the string slice if this is a `Str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ContextValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer if this is an `Int`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ContextValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the boolean if this is a `Bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ContextValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the float if this is a `Float`.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            ContextValue::Float(x) => Some(*x),
            _ => None,
        }
    }

    /// Returns the record handle if this is a `Record`.
    pub fn as_record(&self) -> Option<&ContextRecord> {
        match self {
            ContextValue::Record(r) => Some(r),
            _ => None,
        }
    }
}

impl PartialEq for ContextValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ContextValue::Null, ContextValue::Null) => true,
            (ContextValue::Bool(a), ContextValue::Bool(b)) => a == b,
            (ContextValue::Int(a), ContextValue::Int(b)) => a == b,
            (ContextValue::Float(a), ContextValue::Float(b)) => a == b,
            (ContextValue::Str(a), ContextValue::Str(b)) => a == b,
            (ContextValue::List(a), ContextValue::List(b)) => a == b,
            (ContextValue::Record(a), ContextValue::Record(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl From<bool> for ContextValue {
    fn from(v: bool) -> Self {
        ContextValue::Bool(v)
    }
}

impl From<i64> for ContextValue {
    fn from(v: i64) -> Self {
        ContextValue::Int(v)
    }
}

impl From<f64> for ContextValue {
    fn from(v: f64) -> Self {
        ContextValue::Float(v)
    }
}

impl From<&str> for ContextValue {
    fn from(v: &str) -> Self {
        ContextValue::Str(Arc::from(v))
    }
}

impl From<String> for ContextValue {
    fn from(v: String) -> Self {
        ContextValue::Str(Arc::from(v.as_str()))
    }
}

impl From<ContextRecord> for ContextValue {
    fn from(v: ContextRecord) -> Self {
        ContextValue::Record(v)
    }
}

impl<V: Into<ContextValue>> From<Vec<V>> for ContextValue {
    fn from(v: Vec<V>) -> Self {
        ContextValue::List(v.into_iter().map(Into::into).collect())
    }
}

/// An immutable-by-convention shallow copy of a fiber's local variables at a
/// defined moment.
///
/// Captured at task *dispatch* time and at reaction *registration* time —
/// never at execution time — and installed as the executing fiber's ambient
/// state before its task body runs.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    entries: BTreeMap<String, ContextValue>,
}

impl Snapshot {
    /// The empty snapshot.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Shallow-clones the locals of the currently active fiber.
    ///
    /// Returns an empty snapshot when no fiber is active, so capture is
    /// total and dispatching from plain threads always works.
    ///
    /// ```
    /// use fiber_promise::Snapshot;
    ///
    /// // No fiber is active on this thread.
    /// assert!(Snapshot::capture().is_empty());
    /// ```
    pub fn capture() -> Self {
        fiber::with_scope(|scope| Snapshot::from_locals(scope.locals()))
            .unwrap_or_default()
    }

    pub(crate) fn from_locals(locals: &BTreeMap<String, ContextValue>) -> Self {
        let entries = locals
            .iter()
            .map(|(k, v)| (k.clone(), v.shallow_clone()))
            .collect();
        Self { entries }
    }

    /// Adds an entry; useful for seeding dispatches from plain threads.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    /// Looks up an entry.
    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.entries.get(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ContextValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub(crate) fn into_entries(self) -> BTreeMap<String, ContextValue> {
        self.entries
    }
}

/// Sets a fiber-local variable on the currently active fiber.
///
/// # Errors
///
/// Returns [`Error::Context`] when called outside any active fiber.
///
/// ```
/// use fiber_promise::{context, Error, Runtime};
///
/// // Outside a fiber there is nowhere to store the value.
/// assert!(matches!(context::set("k", 1_i64), Err(Error::Context)));
///
/// let rt = Runtime::new();
/// let done = rt.dispatch(|| {
///     context::set("k", "X")?;
///     Ok::<_, Error>(context::get_str("k"))
/// });
/// let settled = done.block_until_settled(std::time::Duration::from_secs(5));
/// assert_eq!(settled, Some(Ok(Some("X".to_string()))));
/// ```
pub fn set(key: impl Into<String>, value: impl Into<ContextValue>) -> Result<(), Error> {
    let key = key.into();
    let value = value.into();
    fiber::with_scope(move |scope| {
        scope.locals_mut().insert(key, value);
    })
    .ok_or(Error::Context)
}

/// Reads a fiber-local variable from the currently active fiber.
///
/// Returns `None` outside a fiber or when the key is absent. The returned
/// value shares structure with the stored one (records stay aliased).
pub fn get(key: &str) -> Option<ContextValue> {
    fiber::with_scope(|scope| scope.locals().get(key).cloned()).flatten()
}

/// Removes a fiber-local variable, returning its previous value.
pub fn remove(key: &str) -> Option<ContextValue> {
    fiber::with_scope(|scope| scope.locals_mut().remove(key)).flatten()
}

/// Reads a fiber-local string variable.
///
/// Returns `None` when the key is absent *or* holds a non-string value;
/// type mismatches are not errors in the fiber-local model.
pub fn get_str(key: &str) -> Option<String> {
    get(key).and_then(|v| v.as_str().map(str::to_string))
}

/// Reads a fiber-local integer variable.
pub fn get_int(key: &str) -> Option<i64> {
    get(key).and_then(|v| v.as_int())
}

/// Reads a fiber-local boolean variable.
pub fn get_bool(key: &str) -> Option<bool> {
    get(key).and_then(|v| v.as_bool())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn scalars_copy_by_value() {
        let v = ContextValue::Int(7);
        assert_eq!(v.shallow_clone(), v);

        let s = ContextValue::from("hello");
        assert_eq!(s.shallow_clone(), s);
    }

    #[test]
    fn record_shallow_clone_copies_top_level_only() {
        let nested = ContextRecord::new();
        nested.set("hits", 1_i64);

        let top = ContextRecord::new();
        top.set("name", "req-1");
        top.set("stats", nested.clone());

        let copied = match ContextValue::Record(top.clone()).shallow_clone() {
            ContextValue::Record(r) => r,
            other => panic!("expected record, got {other:?}"),
        };

        // New top-level storage...
        assert!(!copied.ptr_eq(&top));
        copied.set("name", "req-2");
        assert_eq!(top.get("name"), Some(ContextValue::from("req-1")));

        // ...but the nested record stays shared both ways.
        let copied_nested = copied.get("stats").unwrap();
        assert!(copied_nested.as_record().unwrap().ptr_eq(&nested));
        nested.set("hits", 2_i64);
        assert_eq!(
            copied_nested.as_record().unwrap().get("hits"),
            Some(ContextValue::Int(2))
        );
    }

    #[test]
    fn list_shallow_clone_copies_elements_sharing_records() {
        let nested = ContextRecord::new();
        let list = ContextValue::from(vec![
            ContextValue::Int(1),
            ContextValue::Record(nested.clone()),
        ]);

        let copy = list.shallow_clone();
        let ContextValue::List(items) = copy else {
            panic!("expected list");
        };
        assert_eq!(items[0], ContextValue::Int(1));
        assert!(items[1].as_record().unwrap().ptr_eq(&nested));
    }

    #[test]
    fn snapshot_from_locals_shallow_clones_each_key() {
        let record = ContextRecord::new();
        let mut locals = BTreeMap::new();
        locals.insert("n".to_string(), ContextValue::Int(3));
        locals.insert("r".to_string(), ContextValue::Record(record.clone()));

        let snapshot = Snapshot::from_locals(&locals);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get("n"), Some(&ContextValue::Int(3)));
        // The snapshot's record is a field-wise copy, not the same storage.
        assert!(!snapshot
            .get("r")
            .unwrap()
            .as_record()
            .unwrap()
            .ptr_eq(&record));
    }

    #[test]
    fn accessors_ignore_type_mismatches() {
        // No fiber on this thread: everything is None / Context.
        assert_eq!(get("missing"), None);
        assert_eq!(get_str("missing"), None);
        assert!(matches!(set("k", 1_i64), Err(Error::Context)));
        assert_eq!(remove("k"), None);
    }

    #[test]
    fn record_equality_is_identity() {
        let a = ContextRecord::new();
        let b = ContextRecord::new();
        assert_eq!(ContextValue::Record(a.clone()), ContextValue::Record(a.clone()));
        assert_ne!(ContextValue::Record(a), ContextValue::Record(b));
    }
}
