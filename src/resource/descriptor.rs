use std::any::TypeId;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::resource::Resource;

/// Cache key of a resource: class name and implementing type plus
/// stringified options.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub class: String,
    pub type_id: TypeId,
    pub args: Vec<String>,
    pub options: BTreeMap<String, String>,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self.args.clone();
        parts.extend(self.options.iter().map(|(k, v)| format!("{k}={v}")));
        write!(f, "{}({})", self.class, parts.join(", "))
    }
}

/// A resource class together with the options it is constructed with.
///
/// Two descriptors are equivalent iff their [`ResourceKey`]s are equal.
#[derive(Clone)]
pub struct ResourceDescriptor {
    resource: Arc<dyn Resource>,
    key: ResourceKey,
}

impl ResourceDescriptor {
    pub fn new<R: Resource + 'static>(resource: Arc<R>) -> Self {
        let key = ResourceKey {
            class: resource.name().to_owned(),
            type_id: TypeId::of::<R>(),
            args: Vec::new(),
            options: BTreeMap::new(),
        };
        Self { resource: resource as Arc<dyn Resource>, key }
    }

    /// Append a positional option.
    pub fn arg(mut self, value: impl ToString) -> Self {
        self.key.args.push(value.to_string());
        self
    }

    /// Set a named option.
    pub fn option(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.key.options.insert(name.into(), value.to_string());
        self
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn resource(&self) -> &Arc<dyn Resource> {
        &self.resource
    }

    pub fn oneshot(&self) -> bool {
        self.resource.oneshot()
    }
}

impl PartialEq for ResourceDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for ResourceDescriptor {}

impl Hash for ResourceDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Debug for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ResourceDescriptor").field(&self.key).finish()
    }
}

impl fmt::Display for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.key.fmt(f)
    }
}
