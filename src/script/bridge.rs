//! Player and account handles for scripts.
//!
//! A handle is a plain Lua table. It carries a hidden reference to the live
//! entity, a snapshot of the entity's exported fields, and a shared metatable
//! whose `__index` holds the bound methods. Methods always go back to the
//! data layer by id, so they never act on stale data; mutators re-project the
//! snapshot once they succeed.

use mlua::{AnyUserData, Lua, LuaSerdeExt, Result as LuaResult, Table, UserData, Value};
use thiserror::Error;

use super::api::{lua_to_sql, sql_to_lua, ScriptServices};
use crate::db::{Account, Player, SqlValue};
use crate::CastroError;

/// Explicit list of fields an entity exposes to scripts.
pub trait FieldExport {
    fn export_fields(&self) -> Vec<(&'static str, SqlValue)>;
}

impl FieldExport for Player {
    fn export_fields(&self) -> Vec<(&'static str, SqlValue)> {
        vec![
            ("id", self.id.into()),
            ("name", self.name.clone().into()),
            ("account_id", self.account_id.into()),
            ("level", self.level.into()),
            ("vocation", self.vocation.into()),
            ("sex", self.sex.into()),
            ("town_id", self.town_id.into()),
            ("experience", self.experience.into()),
            ("cap", self.cap.into()),
            ("balance", self.balance.into()),
            ("lastlogin", self.lastlogin.into()),
        ]
    }
}

impl FieldExport for Account {
    fn export_fields(&self) -> Vec<(&'static str, SqlValue)> {
        vec![
            ("id", self.id.into()),
            ("name", self.name.clone().into()),
            ("email", self.email.clone().into()),
            ("premium_ends_at", self.premium_ends_at.into()),
            ("creation", self.creation.into()),
        ]
    }
}

/// Failures of the bound surface. Raised into Lua as error values.
#[derive(Error, Debug)]
pub enum BindingError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("data access failed: {0}")]
    DataAccess(String),

    #[error("bad argument #{position} to '{function}' ({expected} expected, got {got})")]
    ArgumentType {
        function: &'static str,
        position: usize,
        expected: &'static str,
        got: String,
    },

    #[error("field '{field}' is not a column of {table}")]
    FieldNotAllowed { table: &'static str, field: String },

    #[error(transparent)]
    Lua(#[from] mlua::Error),
}

impl From<CastroError> for BindingError {
    fn from(e: CastroError) -> Self {
        match e {
            CastroError::NotFound(what) => BindingError::NotFound(what),
            other => BindingError::DataAccess(other.to_string()),
        }
    }
}

impl From<BindingError> for mlua::Error {
    fn from(e: BindingError) -> Self {
        match e {
            BindingError::Lua(inner) => inner,
            other => mlua::Error::external(other),
        }
    }
}

/// Hidden reference from a handle to its entity.
pub struct EntityRef {
    pub id: i64,
    services: ScriptServices,
}

impl UserData for EntityRef {}

/// Where an entity kind lives and how its handles are laid out.
struct EntityKind {
    label: &'static str,
    table: &'static str,
    ref_field: &'static str,
    metatable_key: &'static str,
}

const PLAYER: EntityKind = EntityKind {
    label: "player",
    table: "players",
    ref_field: "__player",
    metatable_key: "castro.player",
};

const ACCOUNT: EntityKind = EntityKind {
    label: "account",
    table: "accounts",
    ref_field: "__account",
    metatable_key: "castro.account",
};

enum EntityKey {
    Id(i64),
    Name(String),
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKey::Id(id) => write!(f, "{id}"),
            EntityKey::Name(name) => write!(f, "{name}"),
        }
    }
}

fn entity_key(function: &'static str, key: &Value) -> Result<EntityKey, BindingError> {
    match key {
        Value::String(s) => Ok(EntityKey::Name(s.to_str()?.to_string())),
        other => expect_integer(function, 1, other)
            .map(EntityKey::Id)
            .map_err(|_| BindingError::ArgumentType {
                function,
                position: 1,
                expected: "number or string",
                got: other.type_name().to_string(),
            }),
    }
}

fn expect_integer(
    function: &'static str,
    position: usize,
    value: &Value,
) -> Result<i64, BindingError> {
    match value {
        Value::Integer(i) => Ok(*i),
        // i64::MAX as f64 rounds up to 2^63, so the upper bound is exclusive.
        Value::Number(n)
            if n.fract() == 0.0 && *n >= i64::MIN as f64 && *n < i64::MAX as f64 =>
        {
            Ok(*n as i64)
        }
        other => Err(BindingError::ArgumentType {
            function,
            position,
            expected: "integer",
            got: other.type_name().to_string(),
        }),
    }
}

fn expect_string(
    function: &'static str,
    position: usize,
    value: &Value,
) -> Result<String, BindingError> {
    match value {
        Value::String(s) => Ok(s.to_str()?.to_string()),
        other => Err(BindingError::ArgumentType {
            function,
            position,
            expected: "string",
            got: other.type_name().to_string(),
        }),
    }
}

/// Bind a player by id or name.
pub fn bind_player(
    lua: &Lua,
    services: &ScriptServices,
    key: Value,
) -> Result<Table, BindingError> {
    let key = entity_key("Player", &key)?;
    let player = match &key {
        EntityKey::Id(id) => services.data.player_by_id(*id)?,
        EntityKey::Name(name) => services.data.player_by_name(name)?,
    }
    .ok_or_else(|| BindingError::NotFound(format!("{} {}", PLAYER.label, key)))?;

    let handle = new_handle(lua, services, &PLAYER, player.id, player_metatable)?;
    project(lua, &handle, &player)?;
    Ok(handle)
}

/// Bind an account by id or name.
pub fn bind_account(
    lua: &Lua,
    services: &ScriptServices,
    key: Value,
) -> Result<Table, BindingError> {
    let key = entity_key("Account", &key)?;
    let account = match &key {
        EntityKey::Id(id) => services.data.account_by_id(*id)?,
        EntityKey::Name(name) => services.data.account_by_name(name)?,
    }
    .ok_or_else(|| BindingError::NotFound(format!("{} {}", ACCOUNT.label, key)))?;

    let handle = new_handle(lua, services, &ACCOUNT, account.id, account_metatable)?;
    project(lua, &handle, &account)?;
    Ok(handle)
}

fn new_handle(
    lua: &Lua,
    services: &ScriptServices,
    kind: &EntityKind,
    id: i64,
    metatable: fn(&Lua) -> LuaResult<Table>,
) -> LuaResult<Table> {
    let handle = lua.create_table()?;
    let entity = lua.create_userdata(EntityRef {
        id,
        services: services.clone(),
    })?;
    handle.raw_set(kind.ref_field, entity)?;
    handle.set_metatable(Some(metatable(lua)?));
    Ok(handle)
}

/// Copy the exported fields of `entity` into the handle.
fn project(lua: &Lua, handle: &Table, entity: &impl FieldExport) -> LuaResult<()> {
    for (name, value) in entity.export_fields() {
        handle.raw_set(name, sql_to_lua(lua, &value)?)?;
    }
    Ok(())
}

fn entity_ref(this: &Table, kind: &EntityKind) -> LuaResult<(i64, ScriptServices)> {
    let ud: AnyUserData = this.raw_get(kind.ref_field)?;
    let entity = ud.borrow::<EntityRef>()?;
    Ok((entity.id, entity.services.clone()))
}

fn live_player(this: &Table) -> LuaResult<(Player, ScriptServices)> {
    let (id, services) = entity_ref(this, &PLAYER)?;
    let player = services
        .data
        .player_by_id(id)
        .map_err(BindingError::from)?
        .ok_or_else(|| BindingError::NotFound(format!("player {id}")))?;
    Ok((player, services))
}

fn live_account(this: &Table) -> LuaResult<(Account, ScriptServices)> {
    let (id, services) = entity_ref(this, &ACCOUNT)?;
    let account = services
        .data
        .account_by_id(id)
        .map_err(BindingError::from)?
        .ok_or_else(|| BindingError::NotFound(format!("account {id}")))?;
    Ok((account, services))
}

/// Remaining premium seconds.
fn premium_time(ends_at: i64, now: i64) -> i64 {
    ends_at.saturating_sub(now).max(0)
}

/// Remaining premium days, counting a started day as a full one.
fn premium_days(ends_at: i64, now: i64) -> i64 {
    let seconds = premium_time(ends_at, now);
    seconds / 86_400 + i64::from(seconds % 86_400 != 0)
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn get_custom_field(
    lua: &Lua,
    this: &Table,
    kind: &EntityKind,
    field: &Value,
) -> LuaResult<Value> {
    let name = expect_string("getCustomField", 1, field)?;
    let (id, services) = entity_ref(this, kind)?;
    let catalog = services
        .data
        .table_columns(kind.table)
        .map_err(BindingError::from)?;
    let column = catalog
        .allow(&name)
        .ok_or_else(|| BindingError::FieldNotAllowed {
            table: kind.table,
            field: name,
        })?;
    match services
        .data
        .custom_field(&column, id)
        .map_err(BindingError::from)?
    {
        Some(value) => Ok(Value::String(lua.create_string(value)?)),
        None => Ok(Value::Nil),
    }
}

/// Validate and write a custom field. Returns the entity id.
fn set_custom_field(
    this: &Table,
    kind: &EntityKind,
    field: &Value,
    value: &Value,
) -> LuaResult<i64> {
    let name = expect_string("setCustomField", 1, field)?;
    let value = lua_to_sql(value)?;
    let (id, services) = entity_ref(this, kind)?;
    let catalog = services
        .data
        .table_columns(kind.table)
        .map_err(BindingError::from)?;
    let column = catalog
        .allow(&name)
        .ok_or_else(|| BindingError::FieldNotAllowed {
            table: kind.table,
            field: name,
        })?;
    services
        .data
        .set_custom_field(&column, id, &value)
        .map_err(BindingError::from)?;
    Ok(id)
}

fn cached_metatable(
    lua: &Lua,
    key: &str,
    register: fn(&Lua, &Table) -> LuaResult<()>,
) -> LuaResult<Table> {
    if let Some(meta) = lua.named_registry_value::<Option<Table>>(key)? {
        return Ok(meta);
    }
    let methods = lua.create_table()?;
    register(lua, &methods)?;
    let meta = lua.create_table()?;
    meta.set("__index", methods)?;
    lua.set_named_registry_value(key, meta.clone())?;
    Ok(meta)
}

fn player_metatable(lua: &Lua) -> LuaResult<Table> {
    cached_metatable(lua, PLAYER.metatable_key, register_player_methods)
}

fn account_metatable(lua: &Lua) -> LuaResult<Table> {
    cached_metatable(lua, ACCOUNT.metatable_key, register_account_methods)
}

fn refresh_player(lua: &Lua, this: &Table) -> LuaResult<()> {
    let (player, _) = live_player(this)?;
    project(lua, this, &player)
}

fn refresh_account(lua: &Lua, this: &Table) -> LuaResult<()> {
    let (account, _) = live_account(this)?;
    project(lua, this, &account)
}

fn register_player_methods(lua: &Lua, methods: &Table) -> LuaResult<()> {
    methods.set(
        "getGuild",
        lua.create_function(|lua, this: Table| {
            let (player, services) = live_player(&this)?;
            match services
                .data
                .player_guild(player.id)
                .map_err(BindingError::from)?
            {
                Some(guild) => {
                    let t = lua.create_table()?;
                    t.set("id", guild.id)?;
                    t.set("name", guild.name)?;
                    t.set("ownerid", guild.ownerid)?;
                    t.set("rank", guild.rank)?;
                    Ok(Value::Table(t))
                }
                None => Ok(Value::Nil),
            }
        })?,
    )?;

    methods.set(
        "getAccountId",
        lua.create_function(|_, this: Table| Ok(live_player(&this)?.0.account_id))?,
    )?;

    methods.set(
        "getBankBalance",
        lua.create_function(|_, this: Table| Ok(live_player(&this)?.0.balance))?,
    )?;

    methods.set(
        "setBankBalance",
        lua.create_function(|lua, (this, balance): (Table, Value)| {
            let balance = expect_integer("setBankBalance", 1, &balance)?;
            let (id, services) = entity_ref(&this, &PLAYER)?;
            services
                .data
                .set_bank_balance(id, balance)
                .map_err(BindingError::from)?;
            refresh_player(lua, &this)
        })?,
    )?;

    methods.set(
        "isOnline",
        lua.create_function(|_, this: Table| {
            let (id, services) = entity_ref(&this, &PLAYER)?;
            Ok(services.data.is_online(id).map_err(BindingError::from)?)
        })?,
    )?;

    methods.set(
        "getStorageValue",
        lua.create_function(|_, (this, key): (Table, Value)| {
            let key = expect_integer("getStorageValue", 1, &key)?;
            let (id, services) = entity_ref(&this, &PLAYER)?;
            let value = services
                .data
                .storage_value(id, key)
                .map_err(BindingError::from)?;
            Ok(value.map(|v| v.value))
        })?,
    )?;

    methods.set(
        "setStorageValue",
        lua.create_function(|lua, (this, key, value): (Table, Value, Value)| {
            let key = expect_integer("setStorageValue", 1, &key)?;
            let value = expect_integer("setStorageValue", 2, &value)?;
            let (id, services) = entity_ref(&this, &PLAYER)?;
            services
                .data
                .set_storage_value(id, key, value)
                .map_err(BindingError::from)?;
            refresh_player(lua, &this)
        })?,
    )?;

    methods.set(
        "getVocation",
        lua.create_function(|lua, this: Table| {
            let (player, services) = live_player(&this)?;
            let vocation = services.world.vocation(player.vocation).ok_or_else(|| {
                BindingError::NotFound(format!("vocation {}", player.vocation))
            })?;
            lua.to_value(vocation)
        })?,
    )?;

    methods.set(
        "getGender",
        lua.create_function(|_, this: Table| Ok(live_player(&this)?.0.sex))?,
    )?;

    methods.set(
        "getPremiumDays",
        lua.create_function(|_, this: Table| {
            let ends_at = player_premium_ends_at(&this)?;
            Ok(premium_days(ends_at, now()))
        })?,
    )?;

    methods.set(
        "getPremiumTime",
        lua.create_function(|_, this: Table| {
            let ends_at = player_premium_ends_at(&this)?;
            Ok(premium_time(ends_at, now()))
        })?,
    )?;

    methods.set(
        "getPremiumEndsAt",
        lua.create_function(|_, this: Table| player_premium_ends_at(&this))?,
    )?;

    methods.set(
        "getTown",
        lua.create_function(|lua, this: Table| {
            let (player, services) = live_player(&this)?;
            let town = services
                .world
                .town(player.town_id)
                .ok_or_else(|| BindingError::NotFound(format!("town {}", player.town_id)))?;
            lua.to_value(town)
        })?,
    )?;

    methods.set(
        "getLevel",
        lua.create_function(|_, this: Table| Ok(live_player(&this)?.0.level))?,
    )?;

    methods.set(
        "getName",
        lua.create_function(|_, this: Table| Ok(live_player(&this)?.0.name))?,
    )?;

    methods.set(
        "getExperience",
        lua.create_function(|_, this: Table| Ok(live_player(&this)?.0.experience))?,
    )?;

    methods.set(
        "getCapacity",
        lua.create_function(|_, this: Table| Ok(live_player(&this)?.0.cap))?,
    )?;

    methods.set(
        "getCustomField",
        lua.create_function(|lua, (this, field): (Table, Value)| {
            get_custom_field(lua, &this, &PLAYER, &field)
        })?,
    )?;

    methods.set(
        "setCustomField",
        lua.create_function(|lua, (this, field, value): (Table, Value, Value)| {
            set_custom_field(&this, &PLAYER, &field, &value)?;
            refresh_player(lua, &this)
        })?,
    )?;

    methods.set(
        "refresh",
        lua.create_function(|lua, this: Table| {
            refresh_player(lua, &this)?;
            Ok(this)
        })?,
    )?;

    Ok(())
}

fn player_premium_ends_at(this: &Table) -> LuaResult<i64> {
    let (player, services) = live_player(this)?;
    let account = services
        .data
        .account_by_id(player.account_id)
        .map_err(BindingError::from)?
        .ok_or_else(|| BindingError::NotFound(format!("account {}", player.account_id)))?;
    Ok(account.premium_ends_at)
}

fn register_account_methods(lua: &Lua, methods: &Table) -> LuaResult<()> {
    methods.set(
        "getId",
        lua.create_function(|_, this: Table| Ok(entity_ref(&this, &ACCOUNT)?.0))?,
    )?;

    methods.set(
        "getName",
        lua.create_function(|_, this: Table| Ok(live_account(&this)?.0.name))?,
    )?;

    methods.set(
        "getEmail",
        lua.create_function(|_, this: Table| Ok(live_account(&this)?.0.email))?,
    )?;

    methods.set(
        "getCreation",
        lua.create_function(|_, this: Table| Ok(live_account(&this)?.0.creation))?,
    )?;

    methods.set(
        "getPremiumDays",
        lua.create_function(|_, this: Table| {
            Ok(premium_days(live_account(&this)?.0.premium_ends_at, now()))
        })?,
    )?;

    methods.set(
        "getPremiumTime",
        lua.create_function(|_, this: Table| {
            Ok(premium_time(live_account(&this)?.0.premium_ends_at, now()))
        })?,
    )?;

    methods.set(
        "getPremiumEndsAt",
        lua.create_function(|_, this: Table| Ok(live_account(&this)?.0.premium_ends_at))?,
    )?;

    methods.set(
        "getPlayers",
        lua.create_function(|_, this: Table| {
            let (id, services) = entity_ref(&this, &ACCOUNT)?;
            Ok(services
                .data
                .account_player_names(id)
                .map_err(BindingError::from)?)
        })?,
    )?;

    methods.set(
        "getCustomField",
        lua.create_function(|lua, (this, field): (Table, Value)| {
            get_custom_field(lua, &this, &ACCOUNT, &field)
        })?,
    )?;

    methods.set(
        "setCustomField",
        lua.create_function(|lua, (this, field, value): (Table, Value, Value)| {
            set_custom_field(&this, &ACCOUNT, &field, &value)?;
            refresh_account(lua, &this)
        })?,
    )?;

    methods.set(
        "refresh",
        lua.create_function(|lua, this: Table| {
            refresh_account(lua, &this)?;
            Ok(this)
        })?,
    )?;

    Ok(())
}
