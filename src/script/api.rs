//! Castro API for Lua scripts.
//!
//! Registers the globals every interpreter gets: the `Player` and `Account`
//! constructors, the `db` table and the `world` table.

use std::sync::Arc;

use mlua::{Lua, LuaSerdeExt, MultiValue, Result as LuaResult, Table, Value, Variadic};

use super::bridge::{self, BindingError};
use super::engine::DbSession;
use crate::db::{DataLayer, SqlRow, SqlValue, Statement};
use crate::world::World;

/// Host services reachable from script callbacks.
#[derive(Clone)]
pub struct ScriptServices {
    pub data: Arc<dyn DataLayer>,
    pub world: Arc<World>,
}

impl ScriptServices {
    pub fn new(data: Arc<dyn DataLayer>, world: Arc<World>) -> Self {
        Self { data, world }
    }
}

/// Register the Castro API with the Lua environment.
pub fn register(lua: &Lua, services: &ScriptServices) -> LuaResult<()> {
    register_constructors(lua, services)?;
    register_db(lua, services)?;
    register_world(lua, services)?;
    Ok(())
}

/// `Player(idOrName)` and `Account(idOrName)`.
///
/// A missing entity is reported Lua style as `nil, message`; any other
/// failure is raised.
fn register_constructors(lua: &Lua, services: &ScriptServices) -> LuaResult<()> {
    let player_services = services.clone();
    let player_fn = lua.create_function(move |lua, key: Value| {
        not_found_as_nil(lua, bridge::bind_player(lua, &player_services, key))
    })?;
    lua.globals().set("Player", player_fn)?;

    let account_services = services.clone();
    let account_fn = lua.create_function(move |lua, key: Value| {
        not_found_as_nil(lua, bridge::bind_account(lua, &account_services, key))
    })?;
    lua.globals().set("Account", account_fn)?;

    Ok(())
}

fn not_found_as_nil(
    lua: &Lua,
    result: std::result::Result<Table, BindingError>,
) -> LuaResult<MultiValue> {
    match result {
        Ok(handle) => Ok(MultiValue::from_iter([Value::Table(handle)])),
        Err(BindingError::NotFound(what)) => Ok(MultiValue::from_iter([
            Value::Nil,
            Value::String(lua.create_string(format!("{what} not found"))?),
        ])),
        Err(e) => Err(e.into()),
    }
}

/// The `db` table.
fn register_db(lua: &Lua, services: &ScriptServices) -> LuaResult<()> {
    let db = lua.create_table()?;

    // db:query(sql, ...) - all rows
    let data = Arc::clone(&services.data);
    let query_fn = lua.create_function(move |lua, (_this, sql, args): (Table, String, Variadic<Value>)| {
        let params = lua_params(&args)?;
        let rows = data.query(&sql, &params).map_err(mlua::Error::external)?;
        let result = lua.create_table()?;
        for (i, row) in rows.iter().enumerate() {
            result.raw_set(i + 1, row_to_table(lua, row)?)?;
        }
        Ok(result)
    })?;
    db.set("query", query_fn)?;

    // db:singleQuery(sql, ...) - first row or nil
    let data = Arc::clone(&services.data);
    let single_fn = lua.create_function(move |lua, (_this, sql, args): (Table, String, Variadic<Value>)| {
        let params = lua_params(&args)?;
        let rows = data.query(&sql, &params).map_err(mlua::Error::external)?;
        match rows.first() {
            Some(row) => Ok(Value::Table(row_to_table(lua, row)?)),
            None => Ok(Value::Nil),
        }
    })?;
    db.set("singleQuery", single_fn)?;

    // db:execute(sql, ...) - affected rows, or queued inside a transaction
    let data = Arc::clone(&services.data);
    let execute_fn = lua.create_function(move |lua, (_this, sql, args): (Table, String, Variadic<Value>)| {
        let statement = Statement::new(sql, lua_params(&args)?);
        let queued = match lua.app_data_mut::<DbSession>() {
            Some(mut session) => session.queue(statement),
            None => Err(statement),
        };
        match queued {
            Ok(()) => Ok(0),
            Err(statement) => data
                .execute(&statement.sql, &statement.params)
                .map_err(mlua::Error::external),
        }
    })?;
    db.set("execute", execute_fn)?;

    let begin_fn = lua.create_function(|lua, _this: Table| {
        let mut session = session_mut(lua)?;
        if !session.begin() {
            return Err(mlua::Error::runtime("a transaction is already open"));
        }
        Ok(())
    })?;
    db.set("begin", begin_fn)?;

    let data = Arc::clone(&services.data);
    let commit_fn = lua.create_function(move |lua, _this: Table| {
        let pending = session_mut(lua)?
            .finish()
            .ok_or_else(|| mlua::Error::runtime("no transaction is open"))?;
        data.execute_batch(&pending).map_err(mlua::Error::external)
    })?;
    db.set("commit", commit_fn)?;

    let rollback_fn = lua.create_function(|lua, _this: Table| {
        Ok(session_mut(lua)?.finish().is_some())
    })?;
    db.set("rollback", rollback_fn)?;

    let in_tx_fn = lua.create_function(|lua, _this: Table| {
        Ok(lua
            .app_data_ref::<DbSession>()
            .is_some_and(|session| session.in_transaction()))
    })?;
    db.set("inTransaction", in_tx_fn)?;

    lua.globals().set("db", db)?;
    Ok(())
}

fn session_mut(lua: &Lua) -> LuaResult<mlua::AppDataRefMut<'_, DbSession>> {
    lua.app_data_mut::<DbSession>()
        .ok_or_else(|| mlua::Error::runtime("database session unavailable"))
}

/// The `world` table: `world.vocations` and `world.towns`.
fn register_world(lua: &Lua, services: &ScriptServices) -> LuaResult<()> {
    let world = lua.create_table()?;
    world.set("vocations", lua.to_value(&services.world.vocations)?)?;
    world.set("towns", lua.to_value(&services.world.towns)?)?;
    lua.globals().set("world", world)?;
    Ok(())
}

/// Convert script arguments into SQL parameters.
pub(crate) fn lua_params(args: &[Value]) -> LuaResult<Vec<SqlValue>> {
    args.iter().map(lua_to_sql).collect()
}

pub(crate) fn lua_to_sql(value: &Value) -> LuaResult<SqlValue> {
    match value {
        Value::Nil => Ok(SqlValue::Null),
        Value::Boolean(b) => Ok(SqlValue::Bool(*b)),
        Value::Integer(i) => Ok(SqlValue::Integer(*i)),
        Value::Number(n) => Ok(SqlValue::Real(*n)),
        Value::String(s) => Ok(SqlValue::Text(s.to_str()?.to_string())),
        other => Err(mlua::Error::runtime(format!(
            "cannot use a {} as a SQL value",
            other.type_name()
        ))),
    }
}

pub(crate) fn sql_to_lua(lua: &Lua, value: &SqlValue) -> LuaResult<Value> {
    Ok(match value {
        SqlValue::Null => Value::Nil,
        SqlValue::Integer(i) => Value::Integer(*i),
        SqlValue::Real(f) => Value::Number(*f),
        SqlValue::Text(s) => Value::String(lua.create_string(s)?),
        SqlValue::Bool(b) => Value::Boolean(*b),
    })
}

fn row_to_table(lua: &Lua, row: &SqlRow) -> LuaResult<Table> {
    let table = lua.create_table()?;
    for (column, value) in row {
        table.set(column.as_str(), sql_to_lua(lua, value)?)?;
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::Fixture;
    use crate::world::{Town, Vocation};

    fn lua_with_api(fx: &Fixture) -> Lua {
        let world = World::new(
            vec![Vocation {
                id: 1,
                name: "Sorcerer".into(),
                description: "a sorcerer".into(),
            }],
            vec![Town {
                id: 2,
                name: "Thais".into(),
            }],
        );
        let lua = Lua::new();
        register(&lua, &ScriptServices::new(fx.data.clone(), Arc::new(world))).unwrap();
        lua.set_app_data(DbSession::default());
        lua
    }

    #[test]
    fn test_db_query_and_single_query() {
        let fx = Fixture::new();
        let lua = lua_with_api(&fx);

        let (count, name, missing): (i64, String, bool) = lua
            .load(
                r#"
                local rows = db:query("SELECT id, name FROM players WHERE level >= $1", 10)
                local one = db:singleQuery("SELECT name FROM players WHERE name = $1", "Alice")
                local none = db:singleQuery("SELECT name FROM players WHERE name = $1", "Nobody")
                return #rows, one.name, none == nil
                "#,
            )
            .eval()
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(name, "Alice");
        assert!(missing);
    }

    #[test]
    fn test_db_execute_outside_transaction() {
        let fx = Fixture::new();
        let lua = lua_with_api(&fx);

        let affected: i64 = lua
            .load(r#"return db:execute("UPDATE players SET level = $1 WHERE name = $2", 30, "Alice")"#)
            .eval()
            .unwrap();
        assert_eq!(affected, 1);
        assert_eq!(fx.data.player_by_id(fx.alice_id).unwrap().unwrap().level, 30);
    }

    #[test]
    fn test_db_transaction_commit_and_rollback() {
        let fx = Fixture::new();
        let lua = lua_with_api(&fx);

        lua.load(
            r#"
            db:begin()
            assert(db:inTransaction())
            db:execute("UPDATE players SET level = $1 WHERE name = $2", 50, "Alice")
            db:rollback()
            assert(not db:inTransaction())
            "#,
        )
        .exec()
        .unwrap();
        assert_eq!(fx.data.player_by_id(fx.alice_id).unwrap().unwrap().level, 20);

        let affected: i64 = lua
            .load(
                r#"
                db:begin()
                db:execute("UPDATE players SET level = $1 WHERE name = $2", 60, "Alice")
                db:execute("UPDATE players SET balance = $1 WHERE name = $2", 5, "Alice")
                return db:commit()
                "#,
            )
            .eval()
            .unwrap();
        assert_eq!(affected, 2);
        let alice = fx.data.player_by_id(fx.alice_id).unwrap().unwrap();
        assert_eq!(alice.level, 60);
        assert_eq!(alice.balance, 5);
    }

    #[test]
    fn test_db_commit_without_begin_fails() {
        let fx = Fixture::new();
        let lua = lua_with_api(&fx);
        assert!(lua.load("db:commit()").exec().is_err());
        assert!(lua.load("db:begin(); db:begin()").exec().is_err());
    }

    #[test]
    fn test_world_tables() {
        let fx = Fixture::new();
        let lua = lua_with_api(&fx);

        let (vocation, town): (String, String) = lua
            .load("return world.vocations[1].name, world.towns[1].name")
            .eval()
            .unwrap();
        assert_eq!(vocation, "Sorcerer");
        assert_eq!(town, "Thais");
    }

    #[test]
    fn test_constructor_not_found_returns_nil_and_message() {
        let fx = Fixture::new();
        let lua = lua_with_api(&fx);

        let (is_nil, message): (bool, String) = lua
            .load(
                r#"
                local p, err = Player("Nobody")
                return p == nil, err
                "#,
            )
            .eval()
            .unwrap();
        assert!(is_nil);
        assert_eq!(message, "player Nobody not found");
    }

    #[test]
    fn test_lua_to_sql_rejects_tables() {
        let lua = Lua::new();
        let table = Value::Table(lua.create_table().unwrap());
        assert!(lua_to_sql(&table).is_err());
        assert_eq!(lua_to_sql(&Value::Integer(3)).unwrap(), SqlValue::Integer(3));
        assert_eq!(lua_to_sql(&Value::Nil).unwrap(), SqlValue::Null);
    }
}
