//! Item registry and field routing
//!
//! Every field name routes to exactly one item. Items are generated in
//! dependency order (Kahn's algorithm); ties keep registration order so that
//! generation is deterministic.

use crate::items::StoreItem;
use clusterstore_core::{FieldSpec, Result, StoreError};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;

/// Registered items and the field -> item routes
#[derive(Default)]
pub struct ItemRegistry {
    items: Vec<Box<dyn StoreItem>>,
    routes: FxHashMap<String, usize>,
}

impl ItemRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an item and route all of its fields to it
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the item name or one of its fields is taken.
    pub fn register(&mut self, item: Box<dyn StoreItem>) -> Result<()> {
        if self.index_of(item.name()).is_some() {
            return Err(StoreError::InvalidConfig(format!(
                "item '{}' is already registered",
                item.name()
            )));
        }
        let fields = item.fields();
        for spec in &fields {
            if let Some(&owner) = self.routes.get(&spec.name) {
                return Err(StoreError::InvalidConfig(format!(
                    "field '{}' already belongs to item '{}'",
                    spec.name,
                    self.items[owner].name()
                )));
            }
        }
        let idx = self.items.len();
        for spec in fields {
            self.routes.insert(spec.name, idx);
        }
        self.items.push(item);
        Ok(())
    }

    /// Route a field to an item that produces it
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the item is unknown, does not produce the field, or
    /// the field is routed to another item.
    pub fn route(&mut self, field: &str, item_name: &str) -> Result<()> {
        let idx = self
            .index_of(item_name)
            .ok_or_else(|| StoreError::InvalidConfig(format!("unknown item '{}'", item_name)))?;
        if !self.items[idx].fields().iter().any(|f| f.name == field) {
            return Err(StoreError::InvalidConfig(format!(
                "item '{}' does not produce field '{}'",
                item_name, field
            )));
        }
        match self.routes.get(field) {
            Some(&owner) if owner != idx => Err(StoreError::InvalidConfig(format!(
                "field '{}' already belongs to item '{}'",
                field,
                self.items[owner].name()
            ))),
            _ => {
                self.routes.insert(field.to_string(), idx);
                Ok(())
            }
        }
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.items.iter().position(|i| i.name() == name)
    }

    /// Item by name
    pub fn get(&self, name: &str) -> Option<&dyn StoreItem> {
        self.index_of(name).map(|i| self.items[i].as_ref())
    }

    /// Mutable item by name
    pub fn get_mut(&mut self, name: &str) -> Option<&mut (dyn StoreItem + 'static)> {
        match self.index_of(name) {
            Some(i) => Some(self.items[i].as_mut()),
            None => None,
        }
    }

    /// Item owning a field
    ///
    /// # Errors
    ///
    /// `MissingField` if the field is not routed.
    pub fn owner(&self, field: &str) -> Result<&dyn StoreItem> {
        self.routes
            .get(field)
            .map(|&i| self.items[i].as_ref())
            .ok_or_else(|| StoreError::unregistered(field))
    }

    /// Declared spec of a routed field
    pub fn spec(&self, field: &str) -> Result<FieldSpec> {
        self.owner(field)?
            .fields()
            .into_iter()
            .find(|f| f.name == field)
            .ok_or_else(|| StoreError::unregistered(field))
    }

    /// Routed field names, sorted
    pub fn field_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Item names in registration order
    pub fn item_names(&self) -> Vec<&str> {
        self.items.iter().map(|i| i.name()).collect()
    }

    /// Iterate items mutably in registration order
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn StoreItem>> {
        self.items.iter_mut()
    }

    /// Mutable item by position
    pub(crate) fn at_mut(&mut self, idx: usize) -> &mut dyn StoreItem {
        self.items[idx].as_mut()
    }

    /// Item positions in generation order
    ///
    /// # Errors
    ///
    /// `InvalidConfig` on an unknown dependency or a cycle.
    pub fn generation_order(&self) -> Result<Vec<usize>> {
        let n = self.items.len();
        let mut indegree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, item) in self.items.iter().enumerate() {
            for dep in item.dependencies() {
                let d = self.index_of(&dep).ok_or_else(|| {
                    StoreError::InvalidConfig(format!(
                        "item '{}' depends on unknown item '{}'",
                        item.name(),
                        dep
                    ))
                })?;
                indegree[i] += 1;
                dependents[d].push(i);
            }
        }

        let mut ready: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(i) = ready.pop_front() {
            order.push(i);
            for &j in &dependents[i] {
                indegree[j] -= 1;
                if indegree[j] == 0 {
                    ready.push_back(j);
                }
            }
        }
        if order.len() != n {
            let stuck: Vec<&str> = (0..n)
                .filter(|i| !order.contains(i))
                .map(|i| self.items[i].name())
                .collect();
            return Err(StoreError::InvalidConfig(format!(
                "dependency cycle between items {:?}",
                stuck
            )));
        }
        Ok(order)
    }

    /// Number of items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if no item is registered
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl std::fmt::Debug for ItemRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemRegistry")
            .field("items", &self.item_names())
            .field("fields", &self.field_names())
            .finish()
    }
}
