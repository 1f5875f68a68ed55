//! Kernel-owned State and framework-gated Cache objects.

use std::any::Any;

/// Long-lived, kernel-defined object created once per kernel instance.
pub trait OpKernelState: Any + Send {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Kernel-defined object derived from shapes and attributes, rebuilt when they change.
pub trait OpKernelCache: Any + Send {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any + Send> OpKernelState for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl<T: Any + Send> OpKernelCache for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Downcasts an optional state/cache slot to the kernel's concrete type.
pub fn downcast_state<T: Any>(state: Option<&dyn OpKernelState>) -> Option<&T> {
    state.and_then(|state| state.as_any().downcast_ref::<T>())
}

pub fn downcast_cache<T: Any>(cache: Option<&dyn OpKernelCache>) -> Option<&T> {
    cache.and_then(|cache| cache.as_any().downcast_ref::<T>())
}

/// What changed since the cache was last built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheInvalidation {
    Unchanged,
    ShapeChanged,
    AttrsChanged,
    AllChanged,
}

impl CacheInvalidation {
    pub const ALL_MAY_CHANGE: u32 = 0;
    pub const SHAPE_NOT_CHANGED: u32 = 1 << 0;
    pub const ATTR_NOT_CHANGED: u32 = 1 << 1;

    pub fn from_changes(shape_changed: bool, attrs_changed: bool) -> Self {
        match (shape_changed, attrs_changed) {
            (false, false) => CacheInvalidation::Unchanged,
            (true, false) => CacheInvalidation::ShapeChanged,
            (false, true) => CacheInvalidation::AttrsChanged,
            (true, true) => CacheInvalidation::AllChanged,
        }
    }

    /// Decodes the legacy "not changed" bit mask. Unknown bits are ignored.
    pub fn from_flags(flags: u32) -> Self {
        Self::from_changes(
            flags & Self::SHAPE_NOT_CHANGED == 0,
            flags & Self::ATTR_NOT_CHANGED == 0,
        )
    }

    pub fn to_flags(self) -> u32 {
        let mut flags = Self::ALL_MAY_CHANGE;
        if !self.shape_changed() {
            flags |= Self::SHAPE_NOT_CHANGED;
        }
        if !self.attrs_changed() {
            flags |= Self::ATTR_NOT_CHANGED;
        }
        flags
    }

    pub fn shape_changed(self) -> bool {
        matches!(
            self,
            CacheInvalidation::ShapeChanged | CacheInvalidation::AllChanged
        )
    }

    pub fn attrs_changed(self) -> bool {
        matches!(
            self,
            CacheInvalidation::AttrsChanged | CacheInvalidation::AllChanged
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CacheInvalidation::Unchanged => "unchanged",
            CacheInvalidation::ShapeChanged => "shape_changed",
            CacheInvalidation::AttrsChanged => "attrs_changed",
            CacheInvalidation::AllChanged => "all_changed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_flags_map_onto_variants() {
        assert_eq!(CacheInvalidation::from_flags(0), CacheInvalidation::AllChanged);
        assert_eq!(
            CacheInvalidation::from_flags(CacheInvalidation::SHAPE_NOT_CHANGED),
            CacheInvalidation::AttrsChanged
        );
        assert_eq!(
            CacheInvalidation::from_flags(CacheInvalidation::ATTR_NOT_CHANGED),
            CacheInvalidation::ShapeChanged
        );
        assert_eq!(CacheInvalidation::from_flags(0b11), CacheInvalidation::Unchanged);
        for variant in [
            CacheInvalidation::Unchanged,
            CacheInvalidation::ShapeChanged,
            CacheInvalidation::AttrsChanged,
            CacheInvalidation::AllChanged,
        ] {
            assert_eq!(CacheInvalidation::from_flags(variant.to_flags()), variant);
        }
    }

    #[test]
    fn slots_downcast_to_concrete_types() {
        struct RowLayout(usize);
        let cache: Box<dyn OpKernelCache> = Box::new(RowLayout(8));
        assert_eq!(downcast_cache::<RowLayout>(Some(cache.as_ref())).map(|c| c.0), Some(8));
        assert!(downcast_cache::<u32>(Some(cache.as_ref())).is_none());
        assert!(downcast_state::<u32>(None).is_none());
    }
}
