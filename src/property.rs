//! Hardware property catalog
//!
//! Property ids, values and enum tables are discovered once at start-up and
//! never mutated afterwards. [`BoundProperty`] pairs an object with the
//! resolved id of one of its properties; an unresolved binding is how the
//! engine represents "this hardware lacks the capability".

use crate::{Error, Result};
use std::collections::HashMap;

/// Kernel property id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyId(pub u32);

/// Read-only view of the properties exposed by the display objects
pub trait PropertyCatalog: Send + Sync {
    /// Resolve a property of an object by name, `None` if unsupported
    fn lookup(&self, object_id: u32, name: &str) -> Option<PropertyId>;

    /// Value of the property as read at discovery time
    fn current_value(&self, prop: PropertyId) -> Result<u64>;

    /// Kernel value of a symbolic enum entry
    fn enum_value_for(&self, prop: PropertyId, symbolic: &str) -> Result<u64>;

    /// `(min, max)` of a range property
    fn range(&self, _prop: PropertyId) -> Option<(u64, u64)> {
        None
    }

    fn is_immutable(&self, _prop: PropertyId) -> bool {
        false
    }
}

/// Description of one discovered property
#[derive(Debug, Clone, Default)]
pub struct PropertyInfo {
    pub name: String,
    pub value: u64,
    pub enums: HashMap<String, u64>,
    pub range: Option<(u64, u64)>,
    pub immutable: bool,
}

impl PropertyInfo {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_value(mut self, value: u64) -> Self {
        self.value = value;
        self
    }

    pub fn with_enum(mut self, symbolic: &str, value: u64) -> Self {
        self.enums.insert(symbolic.to_string(), value);
        self
    }

    pub fn with_range(mut self, min: u64, max: u64) -> Self {
        self.range = Some((min, max));
        self
    }

    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }
}

/// Immutable in-memory [`PropertyCatalog`]
#[derive(Debug, Clone, Default)]
pub struct PropertyTable {
    by_name: HashMap<(u32, String), PropertyId>,
    props: HashMap<PropertyId, PropertyInfo>,
}

impl PropertyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a property of `object_id`
    pub fn with(mut self, object_id: u32, id: u32, info: PropertyInfo) -> Self {
        let id = PropertyId(id);
        self.by_name.insert((object_id, info.name.clone()), id);
        self.props.insert(id, info);
        self
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    fn info(&self, prop: PropertyId) -> Result<&PropertyInfo> {
        self.props
            .get(&prop)
            .ok_or_else(|| Error::Drm(format!("unknown property id {}", prop.0)))
    }
}

impl PropertyCatalog for PropertyTable {
    fn lookup(&self, object_id: u32, name: &str) -> Option<PropertyId> {
        self.by_name.get(&(object_id, name.to_string())).copied()
    }

    fn current_value(&self, prop: PropertyId) -> Result<u64> {
        Ok(self.info(prop)?.value)
    }

    fn enum_value_for(&self, prop: PropertyId, symbolic: &str) -> Result<u64> {
        let info = self.info(prop)?;
        info.enums.get(symbolic).copied().ok_or_else(|| {
            Error::InvalidConfiguration(format!("{} has no enum entry {:?}", info.name, symbolic))
        })
    }

    fn range(&self, prop: PropertyId) -> Option<(u64, u64)> {
        self.props.get(&prop).and_then(|info| info.range)
    }

    fn is_immutable(&self, prop: PropertyId) -> bool {
        self.props.get(&prop).is_some_and(|info| info.immutable)
    }
}

/// A property of a specific object, resolved once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundProperty {
    pub object_id: u32,
    pub name: &'static str,
    pub id: Option<PropertyId>,
}

impl BoundProperty {
    pub fn resolve(catalog: &dyn PropertyCatalog, object_id: u32, name: &'static str) -> Self {
        Self {
            object_id,
            name,
            id: catalog.lookup(object_id, name),
        }
    }

    pub fn is_supported(&self) -> bool {
        self.id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PropertyTable {
        PropertyTable::new()
            .with(10, 1, PropertyInfo::new("ACTIVE").with_value(1))
            .with(
                20,
                2,
                PropertyInfo::new("pixel blend mode")
                    .with_enum("None", 0)
                    .with_enum("Pre-multiplied", 1)
                    .with_enum("Coverage", 2),
            )
            .with(20, 3, PropertyInfo::new("zpos").with_range(1, 7).immutable())
    }

    #[test]
    fn test_lookup_is_per_object() {
        let table = table();
        assert_eq!(table.lookup(10, "ACTIVE"), Some(PropertyId(1)));
        assert_eq!(table.lookup(20, "ACTIVE"), None);
        assert!(!BoundProperty::resolve(&table, 20, "alpha").is_supported());
    }

    #[test]
    fn test_enum_and_range_queries() {
        let table = table();
        assert_eq!(table.enum_value_for(PropertyId(2), "Coverage").unwrap(), 2);
        assert!(table.enum_value_for(PropertyId(2), "Bogus").is_err());
        assert_eq!(table.range(PropertyId(3)), Some((1, 7)));
        assert!(table.is_immutable(PropertyId(3)));
        assert_eq!(table.current_value(PropertyId(1)).unwrap(), 1);
        assert!(table.current_value(PropertyId(99)).is_err());
    }
}
