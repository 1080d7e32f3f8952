//! Lua script engine.
//!
//! Every page route and widget is a Lua script. Sources are compiled once
//! into bytecode units, interpreters are pooled per path, enabled extensions
//! overlay the primary tree, and scripts reach players and accounts through
//! bound handles.

pub mod api;
pub mod bridge;
pub mod compiler;
pub mod context;
pub mod dispatcher;
pub mod engine;
pub mod extension;
pub mod pool;
pub mod registry;
pub mod runtime;

pub use api::ScriptServices;
pub use bridge::{bind_account, bind_player, BindingError, EntityRef, FieldExport};
pub use compiler::{normalize_path, CompiledUnit, ProtoCompiler};
pub use context::{RequestContext, Response};
pub use dispatcher::Dispatcher;
pub use engine::{DbSession, Interpreter, InterpreterFactory, ResourceLimits};
pub use extension::{ExtensionKind, ExtensionResolver, ResolveOutcome, Widget, WidgetList};
pub use pool::{PoolStats, StatePool};
pub use registry::{CatalogSnapshot, CompiledUnitRegistry, UnitCatalog};
pub use runtime::Runtime;
