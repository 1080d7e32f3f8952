//! Extension overlays.
//!
//! Enabled extensions contribute extra pages and widgets from
//! `extensions/<id>/pages` and `extensions/<id>/widgets`. Their units are
//! merged into an overlay that shadows the primary tree.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{error, info, warn};

use super::compiler::{scan_directory, ProtoCompiler};
use super::engine::{Interpreter, InterpreterFactory};
use super::registry::CompiledUnitRegistry;
use crate::db::DataLayer;
pub use crate::db::ExtensionKind;
use crate::Result;

/// An active widget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Widget {
    pub name: String,
    /// Extension providing the widget, `None` for the primary tree.
    pub extension_id: Option<String>,
}

/// The externally visible list of active widgets.
///
/// Primary widgets and extension widgets are kept apart, so replacing or
/// clearing the extension set never loses a primary widget it had shadowed.
#[derive(Debug, Default)]
pub struct WidgetList {
    state: Mutex<WidgetState>,
}

#[derive(Debug, Default)]
struct WidgetState {
    /// Stems found in the primary widgets directory, sorted.
    primary: Vec<String>,
    /// Extension widgets, unique by name.
    extension: Vec<Widget>,
    /// Names hidden because an extension widget of that name failed to load.
    unloaded: Vec<String>,
}

impl WidgetState {
    fn visible(&self) -> Vec<Widget> {
        let mut list: Vec<Widget> = self
            .primary
            .iter()
            .map(|name| {
                self.extension
                    .iter()
                    .find(|w| &w.name == name)
                    .cloned()
                    .unwrap_or_else(|| Widget {
                        name: name.clone(),
                        extension_id: None,
                    })
            })
            .collect();
        list.extend(
            self.extension
                .iter()
                .filter(|w| !self.primary.contains(&w.name))
                .cloned(),
        );
        list.retain(|w| !self.unloaded.contains(&w.name));
        list
    }
}

impl WidgetList {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, WidgetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the primary widgets with the `*.lua` stems found in `dir`.
    /// Extension widgets are kept.
    pub fn load_primary(&self, dir: &Path) -> Result<usize> {
        let mut names: Vec<String> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "lua"))
            .filter_map(|path| widget_name(&path))
            .collect();
        names.sort();
        names.dedup();

        let count = names.len();
        self.lock().primary = names;
        Ok(count)
    }

    /// Register a widget provided by an extension. It shadows any widget of
    /// the same name.
    pub fn register_extension_widget(&self, name: &str, extension_id: &str) {
        let mut guard = self.lock();
        let state = &mut *guard;
        register_in(&mut state.extension, &mut state.unloaded, name, extension_id);
    }

    /// Hide a widget by name. Returns whether it was listed.
    pub fn unload_extension_widget(&self, name: &str) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;
        let listed = state.visible().iter().any(|w| w.name == name);
        unload_in(&mut state.extension, &mut state.unloaded, name);
        listed
    }

    /// Forget every extension widget. Shadowed primary widgets reappear.
    pub fn clear_extensions(&self) {
        self.replace_extensions(Vec::new(), Vec::new());
    }

    /// Swap in a whole extension widget set in one step.
    pub fn replace_extensions(&self, widgets: Vec<Widget>, unloaded: Vec<String>) {
        let mut state = self.lock();
        state.extension = widgets;
        state.unloaded = unloaded;
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().visible().iter().any(|w| w.name == name)
    }

    pub fn list(&self) -> Vec<Widget> {
        self.lock().visible()
    }

    pub fn names(&self) -> Vec<String> {
        self.list().into_iter().map(|w| w.name).collect()
    }
}

fn register_in(
    widgets: &mut Vec<Widget>,
    unloaded: &mut Vec<String>,
    name: &str,
    extension_id: &str,
) {
    widgets.retain(|w| w.name != name);
    widgets.push(Widget {
        name: name.to_string(),
        extension_id: Some(extension_id.to_string()),
    });
    unloaded.retain(|n| n != name);
}

fn unload_in(widgets: &mut Vec<Widget>, unloaded: &mut Vec<String>, name: &str) {
    widgets.retain(|w| w.name != name);
    if !unloaded.iter().any(|n| n == name) {
        unloaded.push(name.to_string());
    }
}

fn widget_name(path: &Path) -> Option<String> {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_lowercase())
}

/// Result of resolving one extension kind.
///
/// Nothing shared is touched while resolving. The caller applies the outcome
/// once the new overlay is in place.
pub struct ResolveOutcome {
    pub kind: ExtensionKind,
    /// Merged overlay, later extensions winning.
    pub overlay: CompiledUnitRegistry,
    /// Extensions that contributed to the overlay, in merge order.
    pub loaded: Vec<String>,
    /// Interpreters built while validating widgets, ready to seed the pool.
    pub warm: Vec<Interpreter>,
    /// Extension widgets that loaded, for [`WidgetList::replace_extensions`].
    pub widgets: Vec<Widget>,
    /// Widget names that failed to load and must be hidden.
    pub unloaded: Vec<String>,
}

/// Builds extension overlays from the persisted extension registry.
pub struct ExtensionResolver {
    extensions_dir: PathBuf,
    data: Arc<dyn DataLayer>,
    factory: Arc<InterpreterFactory>,
}

impl ExtensionResolver {
    pub fn new(
        extensions_dir: impl Into<PathBuf>,
        data: Arc<dyn DataLayer>,
        factory: Arc<InterpreterFactory>,
    ) -> Self {
        Self {
            extensions_dir: extensions_dir.into(),
            data,
            factory,
        }
    }

    /// Compile the enabled extensions of `kind` into an overlay.
    ///
    /// A page that fails to compile fails the whole resolve. A widget that
    /// fails to compile or load is logged, recorded as unloaded and skipped.
    pub fn resolve(&self, kind: ExtensionKind) -> Result<ResolveOutcome> {
        let records = self.data.enabled_extensions(kind)?;
        let compiler = ProtoCompiler::new();
        let mut outcome = ResolveOutcome {
            kind,
            overlay: CompiledUnitRegistry::new(),
            loaded: Vec::new(),
            warm: Vec::new(),
            widgets: Vec::new(),
            unloaded: Vec::new(),
        };

        for record in records {
            let dir = self
                .extensions_dir
                .join(&record.extension_id)
                .join(kind.dir_name());
            if !dir.is_dir() {
                warn!(
                    "Missing {} directory in extension {}",
                    kind.dir_name(),
                    record.extension_id
                );
                continue;
            }

            match kind {
                ExtensionKind::Page => {
                    let units = compiler
                        .compile_tree(&dir, kind.dir_name())
                        .map_err(|e| e.in_extension(&record.extension_id))?;
                    outcome.overlay.merge(units);
                }
                ExtensionKind::Widget => {
                    self.resolve_widgets(&compiler, &dir, &record.extension_id, &mut outcome)
                        .map_err(|e| e.in_extension(&record.extension_id))?;
                }
            }
            outcome.loaded.push(record.extension_id);
        }

        info!(
            "Resolved {} {} extensions ({} units)",
            outcome.loaded.len(),
            kind,
            outcome.overlay.len()
        );
        Ok(outcome)
    }

    /// Compile and warm each widget of one extension on its own.
    fn resolve_widgets(
        &self,
        compiler: &ProtoCompiler,
        dir: &Path,
        extension_id: &str,
        outcome: &mut ResolveOutcome,
    ) -> Result<()> {
        let mut files = Vec::new();
        scan_directory(dir, &mut files)?;

        for file in files {
            let Some(name) = widget_name(&file) else {
                continue;
            };
            let relative = file.strip_prefix(dir).unwrap_or(&file);
            let virtual_path = format!(
                "{}/{}",
                ExtensionKind::Widget.dir_name(),
                relative.to_string_lossy()
            );

            let warmed = compiler
                .compile_one(&file, &virtual_path)
                .and_then(|unit| self.factory.build(Arc::new(unit)));
            match warmed {
                Ok(interpreter) => {
                    outcome.overlay.insert(Arc::clone(interpreter.unit()));
                    register_in(&mut outcome.widgets, &mut outcome.unloaded, &name, extension_id);
                    outcome.warm.push(interpreter);
                }
                Err(e) => {
                    error!("Cannot load widget {} in extension {}: {}", name, extension_id, e);
                    unload_in(&mut outcome.widgets, &mut outcome.unloaded, &name);
                }
            }
        }
        Ok(())
    }
}
