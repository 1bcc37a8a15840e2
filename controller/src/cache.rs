//! Keyed, read-only access to the locally cached cluster state.

use kube::{
    runtime::reflector::{ObjectRef, Store},
    Resource, ResourceExt,
};
use std::{hash::Hash, sync::Arc};

/// Read access to one resource kind's cache.
pub trait Cache<K> {
    /// Returns the object stored under `key`, if any.
    fn get_by_key(&self, key: &str) -> Option<Arc<K>>;

    /// Returns every cached object in no particular order.
    fn list(&self) -> Vec<Arc<K>>;
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid object key: {0:?}")]
pub struct InvalidKey(pub String);

/// Returns the work key for an object: `namespace/name`, or `name` for
/// cluster-scoped objects.
pub fn key_of<K: Resource>(obj: &K) -> String {
    let name = obj.name_any();
    match obj.namespace() {
        Some(ns) => format!("{ns}/{name}"),
        None => name,
    }
}

/// Splits a work key into its optional namespace and name.
pub fn parse_key(key: &str) -> Result<(Option<&str>, &str), InvalidKey> {
    let mut parts = key.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), None, None) if !name.is_empty() => Ok((None, name)),
        (Some(ns), Some(name), None) if !ns.is_empty() && !name.is_empty() => {
            Ok((Some(ns), name))
        }
        _ => Err(InvalidKey(key.to_string())),
    }
}

impl<K> Cache<K> for Store<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    fn get_by_key(&self, key: &str) -> Option<Arc<K>> {
        let (ns, name) = parse_key(key).ok()?;
        let obj_ref = match ns {
            Some(ns) => ObjectRef::new(name).within(ns),
            None => ObjectRef::new(name),
        };
        self.get(&obj_ref)
    }

    fn list(&self) -> Vec<Arc<K>> {
        self.state()
    }
}
