use serde::{Deserialize, Serialize};

use crate::data::MAX_NUM_REGULAR_GRIDS;
use crate::error::SpatialError;

/// A spatial data category: a bit position in the category bitmask.
/// Always below [`MAX_NUM_REGULAR_GRIDS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct Category(pub(crate) u16);

impl Category {
    /// `None` if `index` does not fit the category bitmask.
    pub fn new(index: usize) -> Option<Self> {
        (index < MAX_NUM_REGULAR_GRIDS).then_some(Self(index as u16))
    }

    pub fn index(&self) -> u16 {
        self.0
    }

    pub fn bitmask(&self) -> u32 {
        1u32.checked_shl(self.0 as u32).unwrap_or(0)
    }

    /// The regular grid holding this category.
    pub fn grid_index(&self) -> usize {
        self.0 as usize
    }
}

impl TryFrom<u16> for Category {
    type Error = SpatialError;

    fn try_from(index: u16) -> Result<Self, Self::Error> {
        Self::new(index as usize).ok_or(SpatialError::InvalidCategory(index))
    }
}

impl From<Category> for u16 {
    fn from(category: Category) -> Self {
        category.0
    }
}

/// Behavior flags for a category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryFlags {
    /// Data in this category moves or changes every frame; cache grids would
    /// be rebuilt constantly, so the category is never cached.
    pub frequent_changes: bool,
}

impl CategoryFlags {
    pub const NONE: Self = Self {
        frequent_changes: false,
    };
    pub const FREQUENT_CHANGES: Self = Self {
        frequent_changes: true,
    };
}

#[derive(Debug, Clone)]
struct CategoryInfo {
    name: String,
    flags: CategoryFlags,
}

/// Names categories and stores their flags. Categories that were never
/// registered still work: they are unnamed and use default flags.
#[derive(Debug, Clone, Default)]
pub struct CategoryRegistry {
    categories: Vec<CategoryInfo>,
}

impl CategoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a category, or return the existing one with the same name.
    pub fn register(&mut self, name: &str, flags: CategoryFlags) -> Result<Category, SpatialError> {
        if let Some(existing) = self.find(name) {
            return Ok(existing);
        }
        if self.categories.len() >= MAX_NUM_REGULAR_GRIDS {
            tracing::warn!(name, "too many spatial data categories");
            return Err(SpatialError::GridExhaustion {
                requested: self.categories.len() + 1,
                limit: MAX_NUM_REGULAR_GRIDS,
            });
        }
        let category = Category(self.categories.len() as u16);
        self.categories.push(CategoryInfo {
            name: name.to_owned(),
            flags,
        });
        tracing::debug!(name, index = category.0, "registered spatial category");
        Ok(category)
    }

    pub fn find(&self, name: &str) -> Option<Category> {
        self.categories
            .iter()
            .position(|c| c.name == name)
            .map(|i| Category(i as u16))
    }

    pub fn name(&self, category: Category) -> Option<&str> {
        self.categories
            .get(category.0 as usize)
            .map(|c| c.name.as_str())
    }

    pub fn flags(&self, category: Category) -> CategoryFlags {
        self.categories
            .get(category.0 as usize)
            .map(|c| c.flags)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_assigns_sequential_bits() {
        let mut reg = CategoryRegistry::new();
        let a = reg.register("RenderStatic", CategoryFlags::NONE).unwrap();
        let b = reg
            .register("RenderDynamic", CategoryFlags::FREQUENT_CHANGES)
            .unwrap();
        assert_eq!(a, Category(0));
        assert_eq!(b.bitmask(), 0b10);
        assert_eq!(reg.name(b), Some("RenderDynamic"));
        assert!(reg.flags(b).frequent_changes);
        assert!(!reg.flags(a).frequent_changes);
    }

    #[test]
    fn register_same_name_twice() {
        let mut reg = CategoryRegistry::new();
        let a = reg.register("Occluder", CategoryFlags::NONE).unwrap();
        let again = reg.register("Occluder", CategoryFlags::NONE).unwrap();
        assert_eq!(a, again);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn unregistered_category_has_default_flags() {
        let reg = CategoryRegistry::new();
        assert_eq!(reg.flags(Category(5)), CategoryFlags::NONE);
        assert!(reg.name(Category(5)).is_none());
    }

    #[test]
    fn category_index_is_bounded() {
        assert_eq!(Category::new(31).map(|c| c.bitmask()), Some(1 << 31));
        assert!(Category::new(32).is_none());
        assert!(Category::new(63).is_none());
        assert!(matches!(
            Category::try_from(40u16),
            Err(SpatialError::InvalidCategory(40))
        ));
        assert_eq!(Category(40).bitmask(), 0);
    }

    #[test]
    fn registry_is_bounded_by_bitmask_width() {
        let mut reg = CategoryRegistry::new();
        for i in 0..MAX_NUM_REGULAR_GRIDS {
            reg.register(&format!("cat{i}"), CategoryFlags::NONE).unwrap();
        }
        let err = reg.register("one too many", CategoryFlags::NONE).unwrap_err();
        assert!(matches!(
            err,
            SpatialError::GridExhaustion { limit: 32, .. }
        ));
    }
}
