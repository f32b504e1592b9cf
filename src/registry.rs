//! Process-wide registry of vector spaces and their subspaces.
//!
//! Space id 0 is the anonymous space of extent [`MAX_SPACE_DIM`]; registered
//! spaces carry ids greater than zero and automatically own a full subspace
//! with id 0. Clients hold plain integer ids; the registry owns all metadata.

use std::sync::RwLock;

use rustc_hash::FxHashMap;

use crate::error::TneError;
use crate::types::{DimExtent, SpaceId, SubspaceId, FULL_SUBSPACE, MAX_SPACE_DIM, SOME_SPACE};

/// A registered vector space.
#[derive(Debug, Clone)]
pub struct VectorSpace {
    name: String,
    extent: DimExtent,
    subspaces: Vec<Subspace>,
    subspace_names: FxHashMap<String, SubspaceId>,
}

impl VectorSpace {
    /// Name under which the space was registered.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total extent of the space.
    #[must_use]
    pub fn extent(&self) -> DimExtent {
        self.extent
    }
}

/// A contiguous range `[lower, upper]` of basis vectors within a space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subspace {
    name: String,
    lower: u64,
    upper: u64,
}

impl Subspace {
    /// Name under which the subspace was registered.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Inclusive bounds of the subspace.
    #[must_use]
    pub fn bounds(&self) -> (u64, u64) {
        (self.lower, self.upper)
    }

    /// Number of basis vectors in the subspace.
    #[must_use]
    pub fn extent(&self) -> DimExtent {
        self.upper - self.lower + 1
    }
}

/// Reader-writer locked arena of all registered spaces.
#[derive(Debug, Default)]
pub struct SpaceRegistry {
    inner: RwLock<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    spaces: Vec<VectorSpace>,
    space_names: FxHashMap<String, SpaceId>,
}

impl SpaceRegistry {
    /// Creates an empty registry. The anonymous space (id 0) always exists
    /// implicitly and is not stored.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a named space of the given extent and returns its id (> 0).
    /// The full subspace (id 0) is registered automatically.
    pub fn create_space(&self, name: &str, extent: DimExtent) -> Result<SpaceId, TneError> {
        assert!(extent > 0, "space extent must be positive");
        let mut inner = self.inner.write().unwrap();
        if inner.space_names.contains_key(name) {
            return Err(TneError::SpaceExists(name.to_string()));
        }
        let id = (inner.spaces.len() + 1) as SpaceId;
        inner.spaces.push(VectorSpace {
            name: name.to_string(),
            extent,
            subspaces: vec![Subspace {
                name: String::new(),
                lower: 0,
                upper: extent - 1,
            }],
            subspace_names: FxHashMap::default(),
        });
        inner.space_names.insert(name.to_string(), id);
        Ok(id)
    }

    /// Registers a named subspace `[lower, upper]` of a registered space and
    /// returns its id within that space.
    pub fn create_subspace(
        &self,
        space: SpaceId,
        name: &str,
        lower: u64,
        upper: u64,
    ) -> Result<SubspaceId, TneError> {
        assert!(space != SOME_SPACE, "cannot subspace the anonymous space");
        assert!(lower <= upper, "subspace bounds out of order");
        let mut inner = self.inner.write().unwrap();
        let entry = inner
            .spaces
            .get_mut(space as usize - 1)
            .ok_or(TneError::UnknownSpace(space))?;
        if upper >= entry.extent {
            return Err(TneError::SubspaceOutOfRange {
                space: entry.name.clone(),
                upper,
                extent: entry.extent,
            });
        }
        if entry.subspace_names.contains_key(name) {
            return Err(TneError::SpaceExists(name.to_string()));
        }
        let id = entry.subspaces.len() as SubspaceId;
        entry.subspaces.push(Subspace {
            name: name.to_string(),
            lower,
            upper,
        });
        entry.subspace_names.insert(name.to_string(), id);
        Ok(id)
    }

    /// Looks up a space id by name.
    pub fn space_id(&self, name: &str) -> Option<SpaceId> {
        self.inner.read().unwrap().space_names.get(name).copied()
    }

    /// Looks up a subspace id by name within a space.
    pub fn subspace_id(&self, space: SpaceId, name: &str) -> Option<SubspaceId> {
        let inner = self.inner.read().unwrap();
        let entry = inner.spaces.get((space as usize).checked_sub(1)?)?;
        entry.subspace_names.get(name).copied()
    }

    /// Extent of the given `(space, subspace)` pair. For the anonymous space
    /// the subspace id is a base offset and the extent is unbounded.
    pub fn subspace_extent(
        &self,
        space: SpaceId,
        subspace: SubspaceId,
    ) -> Result<DimExtent, TneError> {
        if space == SOME_SPACE {
            return Ok(MAX_SPACE_DIM);
        }
        let inner = self.inner.read().unwrap();
        let entry = inner
            .spaces
            .get(space as usize - 1)
            .ok_or(TneError::UnknownSpace(space))?;
        entry
            .subspaces
            .get(subspace as usize)
            .map(Subspace::extent)
            .ok_or(TneError::UnknownSubspace { space, subspace })
    }

    /// Base offset of the given `(space, subspace)` pair. For the anonymous
    /// space the subspace id itself is the offset.
    pub fn subspace_offset(
        &self,
        space: SpaceId,
        subspace: SubspaceId,
    ) -> Result<u64, TneError> {
        if space == SOME_SPACE {
            return Ok(subspace);
        }
        let inner = self.inner.read().unwrap();
        let entry = inner
            .spaces
            .get(space as usize - 1)
            .ok_or(TneError::UnknownSpace(space))?;
        entry
            .subspaces
            .get(subspace as usize)
            .map(|s| s.lower)
            .ok_or(TneError::UnknownSubspace { space, subspace })
    }

    /// Number of registered (non-anonymous) spaces.
    #[must_use]
    pub fn num_spaces(&self) -> usize {
        self.inner.read().unwrap().spaces.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_space() {
        let registry = SpaceRegistry::new();
        assert_eq!(
            registry.subspace_extent(SOME_SPACE, 123).unwrap(),
            MAX_SPACE_DIM
        );
        assert_eq!(registry.subspace_offset(SOME_SPACE, 123).unwrap(), 123);
    }

    #[test]
    fn test_space_registration() {
        let registry = SpaceRegistry::new();
        let space = registry.create_space("orbitals", 64).unwrap();
        assert!(space > 0);
        assert_eq!(registry.space_id("orbitals"), Some(space));
        // The full subspace is registered automatically.
        assert_eq!(registry.subspace_extent(space, FULL_SUBSPACE).unwrap(), 64);
        assert_eq!(registry.subspace_offset(space, FULL_SUBSPACE).unwrap(), 0);
    }

    #[test]
    fn test_subspace_registration() {
        let registry = SpaceRegistry::new();
        let space = registry.create_space("orbitals", 64).unwrap();
        let occ = registry.create_subspace(space, "occupied", 0, 31).unwrap();
        let vir = registry.create_subspace(space, "virtual", 32, 63).unwrap();
        assert_ne!(occ, vir);
        assert_eq!(registry.subspace_id(space, "occupied"), Some(occ));
        assert_eq!(registry.subspace_extent(space, vir).unwrap(), 32);
        assert_eq!(registry.subspace_offset(space, vir).unwrap(), 32);
    }

    #[test]
    fn test_duplicate_space_rejected() {
        let registry = SpaceRegistry::new();
        registry.create_space("s", 8).unwrap();
        assert!(matches!(
            registry.create_space("s", 8),
            Err(TneError::SpaceExists(_))
        ));
    }

    #[test]
    fn test_subspace_out_of_range() {
        let registry = SpaceRegistry::new();
        let space = registry.create_space("s", 8).unwrap();
        assert!(matches!(
            registry.create_subspace(space, "bad", 4, 8),
            Err(TneError::SubspaceOutOfRange { .. })
        ));
    }
}
