//! Castro - embedded Lua script engine for game server community sites.
//!
//! Pages and widgets are Lua scripts compiled once, run on pooled
//! interpreters and extended by database-registered extensions.

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod script;
pub mod world;

pub use config::Config;
pub use db::{DataLayer, Database, SqlDataLayer};
pub use error::{CastroError, Result};
pub use script::{Dispatcher, RequestContext, Response, Runtime};
pub use world::World;
