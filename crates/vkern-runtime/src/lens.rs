#![forbid(unsafe_code)]

//! Field lenses: read/write views into part of a `Store<Value>`.
//!
//! A lens is a root store plus a path. `get()` projects the root's current
//! value through the path; `set()` rebuilds the root value with the node at
//! the path replaced and writes it back under the root's write lock. A path
//! that no longer resolves (for example an index into a list that shrank)
//! yields a [`LensError`] and writes nothing.
//!
//! ```
//! use vkern_runtime::store::Store;
//! use vkern_runtime::value::Value;
//!
//! let doc = Store::new(Value::map([("items", Value::seq(["a", "b"]))]));
//! let second = doc.attr("items").index(1);
//! assert_eq!(second.get(), Ok(Value::from("b")));
//!
//! second.set("z").unwrap();
//! assert_eq!(doc.attr("items").get(), Ok(Value::seq(["a", "z"])));
//!
//! doc.attr("items").set(Value::seq(["a"])).unwrap();
//! assert!(second.get().is_err());
//! ```

use std::fmt;
use std::sync::Arc;

use crate::computed::Computed;
use crate::error::LensError;
use crate::source::{ChangeFn, DependencyKey, Source};
use crate::store::Store;
use crate::subscription::Subscription;
use crate::tracking;
use crate::value::{PathStep, Value, format_path};

/// A path into the value of a `Store<Value>`.
#[derive(Clone)]
pub struct FieldLens {
    root: Store<Value>,
    path: Arc<[PathStep]>,
}

impl fmt::Debug for FieldLens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldLens")
            .field("path", &format_path(&self.path))
            .finish_non_exhaustive()
    }
}

impl FieldLens {
    pub(crate) fn root(root: Store<Value>) -> Self {
        Self {
            root,
            path: Arc::from(Vec::new()),
        }
    }

    fn step(&self, step: PathStep) -> Self {
        let mut path = self.path.to_vec();
        path.push(step);
        Self {
            root: self.root.clone(),
            path: path.into(),
        }
    }

    /// Lens on a record field (or mapping member) of this node.
    #[must_use]
    pub fn attr(&self, name: impl Into<String>) -> Self {
        self.step(PathStep::Attr(name.into()))
    }

    /// Lens on a mapping key of this node.
    #[must_use]
    pub fn key(&self, key: impl Into<String>) -> Self {
        self.step(PathStep::Key(key.into()))
    }

    /// Lens on a sequence position of this node.
    #[must_use]
    pub fn index(&self, index: usize) -> Self {
        self.step(PathStep::Index(index))
    }

    #[must_use]
    pub fn path(&self) -> &[PathStep] {
        &self.path
    }

    /// The store this lens projects from.
    #[must_use]
    pub fn store(&self) -> &Store<Value> {
        &self.root
    }

    /// Current value at the path. Recorded by [`tracking::track`].
    pub fn get(&self) -> Result<Value, LensError> {
        tracking::record(self);
        self.read()
    }

    /// Replace the value at the path.
    pub fn set(&self, value: impl Into<Value>) -> Result<(), LensError> {
        let value = value.into();
        let path = Arc::clone(&self.path);
        self.root
            .try_update_with(|current| current.with_path_replaced(&path, value))
    }

    /// Replace the value at the path with `f(current)`, atomically with
    /// respect to other writers of the root store.
    pub fn update(&self, f: impl FnOnce(&Value) -> Value) -> Result<(), LensError> {
        let path = Arc::clone(&self.path);
        self.root.try_update_with(|current| {
            let next = f(current.get_path(&path)?);
            current.with_path_replaced(&path, next)
        })
    }

    /// Call `callback(new)` when the value at the path changes.
    ///
    /// Root changes that leave this path's value equal are filtered out, as
    /// are changes after which the path no longer resolves.
    pub fn subscribe(&self, callback: impl Fn(&Value) + Send + Sync + 'static) -> Subscription {
        self.subscribe_change(move |new, _| callback(new))
    }

    /// Call `callback(new, old)` when the value at the path changes. `old`
    /// is `None` if the path did not resolve before the change.
    pub fn subscribe_change(
        &self,
        callback: impl Fn(&Value, Option<&Value>) + Send + Sync + 'static,
    ) -> Subscription {
        self.watch(Arc::new(
            move |new: &Result<Value, LensError>, old: &Result<Value, LensError>| {
                if let Ok(new) = new {
                    callback(new, old.as_ref().ok());
                }
            },
        ))
    }

    /// A read-only value derived from this lens. Its output is an error
    /// while the path does not resolve.
    pub fn computed<R>(
        &self,
        f: impl Fn(&Value) -> R + Send + Sync + 'static,
    ) -> Computed<Self, Result<R, LensError>>
    where
        R: Clone + PartialEq + Send + Sync + 'static,
    {
        Computed::new(self.clone(), move |projected: &Result<Value, LensError>| {
            projected.as_ref().map(&f).map_err(Clone::clone)
        })
    }
}

impl Source for FieldLens {
    type Output = Result<Value, LensError>;

    fn read(&self) -> Self::Output {
        self.root.peek().get_path(&self.path).cloned()
    }

    fn watch(&self, on_change: Arc<ChangeFn<Self::Output>>) -> Subscription {
        let path = Arc::clone(&self.path);
        self.root.subscribe_change(move |new: &Value, old: &Value| {
            let new = new.get_path(&path).cloned();
            let old = old.get_path(&path).cloned();
            if new != old {
                on_change(&new, &old);
            }
        })
    }

    fn dependency_key(&self) -> DependencyKey {
        self.root.dependency_key().derived(format_path(&self.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn todo_store() -> Store<Value> {
        Store::new(Value::record(
            "Todos",
            [
                ("title", Value::from("inbox")),
                ("items", Value::seq(["milk", "eggs"])),
            ],
        ))
    }

    #[test]
    fn set_then_get_round_trips() {
        let store = todo_store();
        let title = store.attr("title");
        title.set("errands").unwrap();
        assert_eq!(title.get(), Ok(Value::from("errands")));
        assert_eq!(
            store.attr("items").index(0).get(),
            Ok(Value::from("milk")),
            "siblings untouched"
        );
    }

    #[test]
    fn shrunk_list_makes_index_lens_out_of_range() {
        let store = todo_store();
        let second = store.attr("items").index(1);
        assert_eq!(second.get(), Ok(Value::from("eggs")));
        store.attr("items").set(Value::seq(["milk"])).unwrap();
        let err = second.get().unwrap_err();
        assert!(matches!(err, LensError::OutOfRange { index: 1, len: 1, .. }));
        let version = store.version();
        assert!(second.set("bread").is_err());
        assert_eq!(store.version(), version, "failed set writes nothing");
    }

    #[test]
    fn update_applies_function_to_current_node() {
        let store = Store::new(Value::map([("count", 1)]));
        let count = store.key("count");
        count
            .update(|v| Value::from(v.as_int().unwrap_or(0) + 1))
            .unwrap();
        assert_eq!(count.get(), Ok(Value::from(2)));
    }

    #[test]
    fn subscription_ignores_sibling_changes() {
        let store = todo_store();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let _sub = store.attr("title").subscribe(move |v| s.lock().unwrap().push(v.clone()));
        store.attr("items").index(0).set("oat milk").unwrap();
        assert!(seen.lock().unwrap().is_empty());
        store.attr("title").set("weekend").unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![Value::from("weekend")]);
    }

    #[test]
    fn subscribe_change_reports_missing_old_value() {
        let store = Store::new(Value::map([("a", 1)]));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let _sub = store.key("b").subscribe_change(move |new, old| {
            s.lock().unwrap().push((new.clone(), old.cloned()));
        });
        store.key("b").set(5).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(Value::from(5), None)]);
    }

    #[test]
    fn lens_computed_tracks_errors() {
        let store = todo_store();
        let upper = store
            .attr("items")
            .index(1)
            .computed(|v| v.as_str().map(str::to_uppercase));
        assert_eq!(upper.get(), Ok(Some("EGGS".to_string())));
        store.attr("items").set(Value::seq(Vec::<Value>::new())).unwrap();
        assert!(upper.get().is_err());
    }

    #[test]
    fn debug_shows_path() {
        let lens = todo_store().attr("items").index(3);
        assert!(format!("{lens:?}").contains("$.items[3]"));
    }
}
