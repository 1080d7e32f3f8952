//! Compiled unit lookup tables.
//!
//! [`CompiledUnitRegistry`] is a plain path-to-unit map. [`UnitCatalog`] ties
//! the primary registry and the per-kind extension overlays together into a
//! single snapshot that readers can use without blocking a rebuild.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use super::compiler::{normalize_path, CompiledUnit};
use crate::db::ExtensionKind;

/// Compiled units keyed by normalised virtual path.
#[derive(Debug, Clone, Default)]
pub struct CompiledUnitRegistry {
    units: HashMap<String, Arc<CompiledUnit>>,
}

impl CompiledUnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a unit. The path is normalised first, so any spelling works.
    pub fn get(&self, path: &str) -> Option<Arc<CompiledUnit>> {
        self.units.get(&normalize_path(path)).cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.units.contains_key(&normalize_path(path))
    }

    /// Insert a unit, replacing any unit already stored under its path.
    pub fn insert(&mut self, unit: Arc<CompiledUnit>) -> Option<Arc<CompiledUnit>> {
        self.units.insert(unit.path.clone(), unit)
    }

    /// Merge another registry into this one. Units from `other` win.
    pub fn merge(&mut self, other: CompiledUnitRegistry) {
        self.units.extend(other.units);
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// All paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.units.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<CompiledUnit>> {
        self.units.values()
    }
}

/// One immutable view of every compiled unit.
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    pub primary: CompiledUnitRegistry,
    pub page_overlay: CompiledUnitRegistry,
    pub widget_overlay: CompiledUnitRegistry,
    /// Bumped on every swap.
    pub generation: u64,
}

impl CatalogSnapshot {
    /// Resolve a path: the overlay of the path's kind first, then the primary
    /// registry.
    pub fn resolve(&self, path: &str) -> Option<Arc<CompiledUnit>> {
        ExtensionKind::of_path(&normalize_path(path))
            .and_then(|kind| self.overlay(kind).get(path))
            .or_else(|| self.primary.get(path))
    }

    pub fn overlay(&self, kind: ExtensionKind) -> &CompiledUnitRegistry {
        match kind {
            ExtensionKind::Page => &self.page_overlay,
            ExtensionKind::Widget => &self.widget_overlay,
        }
    }

    /// Whether `unit` is still what this snapshot resolves its path to.
    pub fn is_current(&self, unit: &Arc<CompiledUnit>) -> bool {
        self.resolve(&unit.path)
            .is_some_and(|current| Arc::ptr_eq(&current, unit))
    }
}

/// Double-buffered catalog of compiled units.
///
/// Readers clone the current snapshot `Arc` and never wait on a rebuild.
/// Rebuilds are serialised by a separate lock, prepare the new snapshot
/// without holding the read lock, and swap it in at the end.
pub struct UnitCatalog {
    current: RwLock<Arc<CatalogSnapshot>>,
    rebuild: Mutex<()>,
}

impl UnitCatalog {
    pub fn new(primary: CompiledUnitRegistry) -> Self {
        Self {
            current: RwLock::new(Arc::new(CatalogSnapshot {
                primary,
                ..CatalogSnapshot::default()
            })),
            rebuild: Mutex::new(()),
        }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn resolve(&self, path: &str) -> Option<Arc<CompiledUnit>> {
        self.snapshot().resolve(path)
    }

    pub fn generation(&self) -> u64 {
        self.snapshot().generation
    }

    /// Take the rebuild lock. Held for the whole resolve-and-swap sequence.
    pub fn rebuild_lock(&self) -> MutexGuard<'_, ()> {
        self.rebuild.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Swap in a new overlay for one kind and return the new snapshot.
    ///
    /// Callers should hold [`rebuild_lock`](Self::rebuild_lock) so two
    /// rebuilds cannot interleave.
    pub fn replace_overlay(
        &self,
        kind: ExtensionKind,
        overlay: CompiledUnitRegistry,
    ) -> Arc<CatalogSnapshot> {
        let old = self.snapshot();
        let (page_overlay, widget_overlay) = match kind {
            ExtensionKind::Page => (overlay, old.widget_overlay.clone()),
            ExtensionKind::Widget => (old.page_overlay.clone(), overlay),
        };
        let next = Arc::new(CatalogSnapshot {
            primary: old.primary.clone(),
            page_overlay,
            widget_overlay,
            generation: old.generation + 1,
        });

        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&next);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn unit(path: &str, digest: &str) -> Arc<CompiledUnit> {
        Arc::new(CompiledUnit {
            path: path.to_string(),
            source_path: PathBuf::from(path),
            bytecode: Vec::new(),
            digest: digest.to_string(),
        })
    }

    fn registry(units: &[Arc<CompiledUnit>]) -> CompiledUnitRegistry {
        let mut r = CompiledUnitRegistry::new();
        for u in units {
            r.insert(Arc::clone(u));
        }
        r
    }

    #[test]
    fn test_case_insensitive_get() {
        let r = registry(&[unit("pages/index.lua", "a")]);
        let a = r.get("pages/index.lua").unwrap();
        let b = r.get("Pages/INDEX.lua").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(r.contains("./PAGES/index.lua"));
    }

    #[test]
    fn test_merge_later_wins() {
        let mut r = registry(&[unit("pages/a.lua", "old"), unit("pages/b.lua", "b")]);
        r.merge(registry(&[unit("pages/a.lua", "new")]));
        assert_eq!(r.len(), 2);
        assert_eq!(r.get("pages/a.lua").unwrap().digest, "new");
    }

    #[test]
    fn test_overlay_shadows_primary() {
        let primary = unit("pages/index.lua", "primary");
        let catalog = UnitCatalog::new(registry(&[
            Arc::clone(&primary),
            unit("widgets/top.lua", "w"),
        ]));
        assert_eq!(catalog.generation(), 0);

        let override_unit = unit("pages/index.lua", "extension");
        {
            let _guard = catalog.rebuild_lock();
            catalog.replace_overlay(ExtensionKind::Page, registry(&[Arc::clone(&override_unit)]));
        }

        let resolved = catalog.resolve("Pages/Index.lua").unwrap();
        assert!(Arc::ptr_eq(&resolved, &override_unit));
        assert_eq!(catalog.resolve("widgets/top.lua").unwrap().digest, "w");
        assert_eq!(catalog.generation(), 1);

        let snapshot = catalog.snapshot();
        assert!(!snapshot.is_current(&primary));
        assert!(snapshot.is_current(&override_unit));
    }

    #[test]
    fn test_old_snapshot_survives_swap() {
        let catalog = UnitCatalog::new(registry(&[unit("pages/a.lua", "a")]));
        let before = catalog.snapshot();
        catalog.replace_overlay(ExtensionKind::Widget, registry(&[unit("widgets/x.lua", "x")]));

        assert!(before.resolve("widgets/x.lua").is_none());
        assert!(catalog.resolve("widgets/x.lua").is_some());
        assert!(catalog.resolve("pages/a.lua").is_some());
    }

    #[test]
    fn test_unknown_prefix_uses_primary_only() {
        let catalog = UnitCatalog::new(registry(&[unit("misc/a.lua", "a")]));
        assert!(catalog.resolve("misc/a.lua").is_some());
        assert!(catalog.resolve("misc/b.lua").is_none());
    }
}
