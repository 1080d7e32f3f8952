//! Long-lived script runtime.
//!
//! Owns everything a dispatch needs: the unit catalog, the interpreter pool,
//! the widget list and the extension resolver. There are no process-wide
//! globals; callers hold an `Arc<Runtime>` and pass it to the dispatcher.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use super::api::ScriptServices;
use super::compiler::ProtoCompiler;
use super::engine::{InterpreterFactory, ResourceLimits};
use super::extension::{ExtensionResolver, WidgetList};
use super::pool::StatePool;
use super::registry::{CompiledUnitRegistry, UnitCatalog};
use crate::config::Config;
use crate::db::{DataLayer, ExtensionKind};
use crate::world::World;
use crate::Result;

pub struct Runtime {
    catalog: Arc<UnitCatalog>,
    pool: StatePool,
    widgets: Arc<WidgetList>,
    resolver: ExtensionResolver,
    services: ScriptServices,
}

impl Runtime {
    /// Compile the primary trees, then resolve page and widget extensions.
    ///
    /// Any compile failure in the primary trees or in a page extension is
    /// returned. Blocks on the data layer, so call it off the async runtime.
    pub fn bootstrap(config: &Config, data: Arc<dyn DataLayer>) -> Result<Self> {
        let scripts = &config.scripts;
        let compiler = ProtoCompiler::new();
        let pages_dir = Path::new(&scripts.pages_dir);
        let widgets_dir = Path::new(&scripts.widgets_dir);

        let mut primary = CompiledUnitRegistry::new();
        primary.merge(compile_primary(&compiler, pages_dir, ExtensionKind::Page)?);
        primary.merge(compile_primary(&compiler, widgets_dir, ExtensionKind::Widget)?);

        let widgets = Arc::new(WidgetList::new());
        if widgets_dir.is_dir() {
            widgets.load_primary(widgets_dir)?;
        }

        let world = Arc::new(World::from(config.world.clone()));
        let services = ScriptServices::new(Arc::clone(&data), world);
        let factory = Arc::new(InterpreterFactory::new(
            services.clone(),
            ResourceLimits::from(&config.limits),
        ));
        let catalog = Arc::new(UnitCatalog::new(primary));
        let pool = StatePool::new(Arc::clone(&catalog), Arc::clone(&factory), &config.pool);
        let resolver = ExtensionResolver::new(&scripts.extensions_dir, data, factory);

        let runtime = Self {
            catalog,
            pool,
            widgets,
            resolver,
            services,
        };
        runtime.reload_extensions(ExtensionKind::Page)?;
        runtime.reload_extensions(ExtensionKind::Widget)?;

        info!(
            "Script runtime ready: {} primary units, {} widgets",
            runtime.catalog.snapshot().primary.len(),
            runtime.widgets.list().len()
        );
        Ok(runtime)
    }

    /// Rebuild the overlay of one extension kind and swap it in.
    ///
    /// On failure the catalog and the widget list are left as they were. On
    /// success, idle interpreters built from replaced units are purged, the
    /// widget list follows the new overlay and the widget interpreters warmed
    /// during resolution seed the pool.
    pub fn reload_extensions(&self, kind: ExtensionKind) -> Result<usize> {
        let _guard = self.catalog.rebuild_lock();

        let outcome = self.resolver.resolve(kind)?;
        let units = outcome.overlay.len();
        let snapshot = self.catalog.replace_overlay(kind, outcome.overlay);
        let purged = self.pool.purge_stale();

        if kind == ExtensionKind::Widget {
            self.widgets
                .replace_extensions(outcome.widgets, outcome.unloaded);
        }

        for interpreter in outcome.warm {
            let path = interpreter.path().to_string();
            self.pool.checkin(interpreter, &path);
        }

        info!(
            "Swapped {} overlay: {} units from {} extensions (generation {}, {} idle purged)",
            kind,
            units,
            outcome.loaded.len(),
            snapshot.generation,
            purged
        );
        Ok(units)
    }

    pub fn catalog(&self) -> &Arc<UnitCatalog> {
        &self.catalog
    }

    pub fn pool(&self) -> &StatePool {
        &self.pool
    }

    pub fn widgets(&self) -> &Arc<WidgetList> {
        &self.widgets
    }

    pub fn services(&self) -> &ScriptServices {
        &self.services
    }
}

/// Compile one primary tree. A missing directory is an empty tree.
fn compile_primary(
    compiler: &ProtoCompiler,
    dir: &Path,
    kind: ExtensionKind,
) -> Result<CompiledUnitRegistry> {
    if !dir.is_dir() {
        warn!("Primary {} directory {} not found", kind.dir_name(), dir.display());
        return Ok(CompiledUnitRegistry::new());
    }
    compiler.compile_tree(dir, kind.dir_name())
}
