//! Lua interpreters bound to a compiled unit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mlua::{ChunkMode, HookTriggers, Lua, Result as LuaResult, VmState};
use tracing::debug;
use uuid::Uuid;

use super::api::{self, ScriptServices};
use super::compiler::CompiledUnit;
use crate::config::LimitsConfig;
use crate::db::Statement;
use crate::{CastroError, Result};

/// Instructions between two limit checks.
const HOOK_GRANULARITY: u32 = 10_000;

/// Resource limits for script execution.
#[derive(Debug, Clone, Default)]
pub struct ResourceLimits {
    /// Maximum number of instructions per top-level call (0 = unlimited).
    pub max_instructions: u64,
    /// Maximum memory in bytes (0 = unlimited).
    pub max_memory: usize,
}

impl From<&LimitsConfig> for ResourceLimits {
    fn from(config: &LimitsConfig) -> Self {
        Self {
            max_instructions: config.max_instructions,
            max_memory: config.max_memory,
        }
    }
}

/// Per-interpreter database session state.
///
/// While a transaction is open, statements issued through `db:execute` are
/// queued here and only applied on `db:commit`.
#[derive(Debug, Default)]
pub struct DbSession {
    pending: Option<Vec<Statement>>,
}

impl DbSession {
    pub fn in_transaction(&self) -> bool {
        self.pending.is_some()
    }

    /// Open a transaction. Returns false if one is already open.
    pub fn begin(&mut self) -> bool {
        if self.pending.is_some() {
            return false;
        }
        self.pending = Some(Vec::new());
        true
    }

    /// Queue a statement. Returns it back if no transaction is open.
    pub fn queue(&mut self, statement: Statement) -> std::result::Result<(), Statement> {
        match self.pending.as_mut() {
            Some(pending) => {
                pending.push(statement);
                Ok(())
            }
            None => Err(statement),
        }
    }

    /// Close the transaction and hand out its statements.
    pub fn finish(&mut self) -> Option<Vec<Statement>> {
        self.pending.take()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.as_ref().map_or(0, Vec::len)
    }
}

/// One Lua state with a compiled unit executed in it.
///
/// Interpreters are owned by exactly one worker at a time. The pool hands
/// them out by value and takes them back on checkin.
pub struct Interpreter {
    id: Uuid,
    lua: Lua,
    unit: Arc<CompiledUnit>,
    instruction_count: Arc<AtomicU64>,
    limits: ResourceLimits,
}

impl Interpreter {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    pub fn unit(&self) -> &Arc<CompiledUnit> {
        &self.unit
    }

    /// Virtual path of the unit this interpreter runs.
    pub fn path(&self) -> &str {
        &self.unit.path
    }

    /// Whether this interpreter was built from exactly `unit`.
    pub fn built_from(&self, unit: &Arc<CompiledUnit>) -> bool {
        Arc::ptr_eq(&self.unit, unit)
    }

    /// Whether a script left a database transaction open.
    pub fn in_transaction(&self) -> bool {
        self.lua
            .app_data_ref::<DbSession>()
            .is_some_and(|session| session.in_transaction())
    }

    /// Drop any open transaction and its queued statements.
    pub fn reset_session(&self) {
        if let Some(mut session) = self.lua.app_data_mut::<DbSession>() {
            if let Some(pending) = session.finish() {
                if !pending.is_empty() {
                    debug!(
                        "Discarding {} uncommitted statements in {}",
                        pending.len(),
                        self.unit.path
                    );
                }
            }
        }
    }

    /// Run `f` with the instruction limit armed.
    pub fn guarded<R>(&self, f: impl FnOnce(&Lua) -> LuaResult<R>) -> LuaResult<R> {
        self.instruction_count.store(0, Ordering::SeqCst);

        if self.limits.max_instructions > 0 {
            let count = Arc::clone(&self.instruction_count);
            let limit = self.limits.max_instructions;

            self.lua.set_hook(
                HookTriggers::new().every_nth_instruction(HOOK_GRANULARITY),
                move |_lua, _debug| {
                    let current = count.fetch_add(HOOK_GRANULARITY as u64, Ordering::SeqCst)
                        + HOOK_GRANULARITY as u64;
                    if current > limit {
                        Err(mlua::Error::runtime("script exceeded instruction limit"))
                    } else {
                        Ok(VmState::Continue)
                    }
                },
            );
        }

        let result = f(&self.lua);

        if self.limits.max_instructions > 0 {
            self.lua.remove_hook();
        }

        result
    }

    /// Instructions executed by the last guarded call, at hook granularity.
    pub fn instruction_count(&self) -> u64 {
        self.instruction_count.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("id", &self.id)
            .field("path", &self.unit.path)
            .finish()
    }
}

/// Builds ready-to-run interpreters.
///
/// A fresh interpreter gets the script API registered, then runs its unit's
/// top-level chunk once so the entry point functions are defined.
pub struct InterpreterFactory {
    services: ScriptServices,
    limits: ResourceLimits,
}

impl InterpreterFactory {
    pub fn new(services: ScriptServices, limits: ResourceLimits) -> Self {
        Self { services, limits }
    }

    pub fn services(&self) -> &ScriptServices {
        &self.services
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Build an interpreter for `unit`.
    pub fn build(&self, unit: Arc<CompiledUnit>) -> Result<Interpreter> {
        let path = unit.path.clone();
        let interpreter = self.try_build(unit).map_err(|e| CastroError::ColdStart {
            path: path.clone(),
            message: e.to_string(),
        })?;
        debug!("Built interpreter {} for {}", interpreter.id, path);
        Ok(interpreter)
    }

    fn try_build(&self, unit: Arc<CompiledUnit>) -> LuaResult<Interpreter> {
        let lua = Lua::new();
        api::register(&lua, &self.services)?;
        lua.set_app_data(DbSession::default());

        if self.limits.max_memory > 0 {
            lua.set_memory_limit(self.limits.max_memory)?;
        }

        let interpreter = Interpreter {
            id: Uuid::new_v4(),
            lua,
            unit,
            instruction_count: Arc::new(AtomicU64::new(0)),
            limits: self.limits.clone(),
        };

        interpreter.guarded(|lua| {
            lua.load(&interpreter.unit.bytecode[..])
                .set_name(format!("@{}", interpreter.unit.path))
                .set_mode(ChunkMode::Binary)
                .exec()
        })?;

        Ok(interpreter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::Fixture;
    use crate::script::compiler::ProtoCompiler;
    use crate::world::World;
    use tempfile::TempDir;

    fn compile(source: &str) -> (TempDir, Arc<CompiledUnit>) {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("test.lua");
        std::fs::write(&file, source).unwrap();
        let unit = ProtoCompiler::new()
            .compile_one(&file, "pages/test.lua")
            .unwrap();
        (tmp, Arc::new(unit))
    }

    fn factory(fx: &Fixture, limits: ResourceLimits) -> InterpreterFactory {
        let services = ScriptServices::new(fx.data.clone(), Arc::new(World::default()));
        InterpreterFactory::new(services, limits)
    }

    #[test]
    fn test_build_runs_top_level_chunk() {
        let fx = Fixture::new();
        let (_tmp, unit) = compile("loaded = true\nfunction get(ctx) return 1 end");

        let interpreter = factory(&fx, ResourceLimits::default())
            .build(Arc::clone(&unit))
            .unwrap();
        let loaded: bool = interpreter.lua().globals().get("loaded").unwrap();
        assert!(loaded);
        assert!(interpreter.built_from(&unit));
        assert_eq!(interpreter.path(), "pages/test.lua");
        assert!(!interpreter.in_transaction());
    }

    #[test]
    fn test_api_globals_registered() {
        let fx = Fixture::new();
        let (_tmp, unit) = compile(
            "has_api = type(Player) == 'function' and type(Account) == 'function' and type(db) == 'table' and type(world) == 'table'",
        );
        let interpreter = factory(&fx, ResourceLimits::default()).build(unit).unwrap();
        let has_api: bool = interpreter.lua().globals().get("has_api").unwrap();
        assert!(has_api);
    }

    #[test]
    fn test_top_level_error_is_cold_start() {
        let fx = Fixture::new();
        let (_tmp, unit) = compile("error('broken widget')");

        let err = factory(&fx, ResourceLimits::default()).build(unit).unwrap_err();
        match err {
            CastroError::ColdStart { path, message } => {
                assert_eq!(path, "pages/test.lua");
                assert!(message.contains("broken widget"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_instruction_limit() {
        let fx = Fixture::new();
        let (_tmp, unit) = compile("function spin() while true do end end");
        let limits = ResourceLimits {
            max_instructions: 1000,
            max_memory: 0,
        };
        let interpreter = factory(&fx, limits).build(unit).unwrap();

        let result = interpreter.guarded(|lua| {
            let spin: mlua::Function = lua.globals().get("spin")?;
            spin.call::<()>(())
        });
        let err = result.unwrap_err().to_string();
        assert!(err.contains("instruction limit"));
    }

    #[test]
    fn test_memory_limit() {
        let fx = Fixture::new();
        let (_tmp, unit) = compile(
            r#"
            function hog()
                local t = {}
                for i = 1, 100000 do
                    t[i] = string.rep("x", 1000)
                end
            end
            "#,
        );
        let limits = ResourceLimits {
            max_instructions: 0,
            max_memory: 2 * 1024 * 1024,
        };
        let interpreter = factory(&fx, limits).build(unit).unwrap();

        let result = interpreter.guarded(|lua| {
            let hog: mlua::Function = lua.globals().get("hog")?;
            hog.call::<()>(())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_db_session_queue() {
        let mut session = DbSession::default();
        assert!(!session.in_transaction());
        assert!(session.queue(Statement::new("SELECT 1", vec![])).is_err());

        assert!(session.begin());
        assert!(!session.begin());
        session.queue(Statement::new("SELECT 1", vec![])).unwrap();
        assert_eq!(session.pending_len(), 1);

        assert_eq!(session.finish().unwrap().len(), 1);
        assert!(!session.in_transaction());
    }

    #[test]
    fn test_reset_session_clears_marker() {
        let fx = Fixture::new();
        let (_tmp, unit) = compile("function get(ctx) db:begin() end");
        let interpreter = factory(&fx, ResourceLimits::default()).build(unit).unwrap();

        interpreter
            .guarded(|lua| {
                let get: mlua::Function = lua.globals().get("get")?;
                get.call::<()>(())
            })
            .unwrap();
        assert!(interpreter.in_transaction());

        interpreter.reset_session();
        assert!(!interpreter.in_transaction());
    }

    #[test]
    fn test_each_interpreter_has_own_id() {
        let fx = Fixture::new();
        let (_tmp, unit) = compile("x = 1");
        let factory = factory(&fx, ResourceLimits::default());
        let a = factory.build(Arc::clone(&unit)).unwrap();
        let b = factory.build(unit).unwrap();
        assert_ne!(a.id(), b.id());
    }
}
