//! Blocking [`DataLayer`] over the async repositories.

use std::future::Future;

use tokio::runtime::Handle;

use super::{
    Account, AccountRepository, AllowedColumn, CatalogRepository, ColumnCatalog, DataLayer,
    DbPool, ExtensionKind, ExtensionRecord, ExtensionRepository, Guild, Player,
    PlayerRepository, QueryRepository, SqlRow, SqlValue, Statement, StorageValue,
};
use crate::Result;

/// Data layer backed by a sqlx pool.
///
/// Every call blocks the current thread on the given runtime handle. It must
/// therefore be used from a thread that is not driving that runtime, such as
/// a `spawn_blocking` worker or a plain OS thread.
#[derive(Clone)]
pub struct SqlDataLayer {
    pool: DbPool,
    handle: Handle,
    table_prefix: String,
}

impl SqlDataLayer {
    pub fn new(pool: DbPool, handle: Handle, table_prefix: impl Into<String>) -> Self {
        Self {
            pool,
            handle,
            table_prefix: table_prefix.into(),
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    fn block<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }
}

impl DataLayer for SqlDataLayer {
    fn enabled_extensions(&self, kind: ExtensionKind) -> Result<Vec<ExtensionRecord>> {
        self.block(ExtensionRepository::new(&self.pool, &self.table_prefix).list_enabled(kind))
    }

    fn player_by_id(&self, id: i64) -> Result<Option<Player>> {
        self.block(PlayerRepository::new(&self.pool).get_by_id(id))
    }

    fn player_by_name(&self, name: &str) -> Result<Option<Player>> {
        self.block(PlayerRepository::new(&self.pool).get_by_name(name))
    }

    fn account_by_id(&self, id: i64) -> Result<Option<Account>> {
        self.block(AccountRepository::new(&self.pool).get_by_id(id))
    }

    fn account_by_name(&self, name: &str) -> Result<Option<Account>> {
        self.block(AccountRepository::new(&self.pool).get_by_name(name))
    }

    fn account_player_names(&self, account_id: i64) -> Result<Vec<String>> {
        self.block(AccountRepository::new(&self.pool).player_names(account_id))
    }

    fn player_guild(&self, player_id: i64) -> Result<Option<Guild>> {
        self.block(PlayerRepository::new(&self.pool).guild(player_id))
    }

    fn set_bank_balance(&self, player_id: i64, balance: i64) -> Result<()> {
        self.block(PlayerRepository::new(&self.pool).set_balance(player_id, balance))
    }

    fn is_online(&self, player_id: i64) -> Result<bool> {
        self.block(PlayerRepository::new(&self.pool).is_online(player_id))
    }

    fn storage_value(&self, player_id: i64, key: i64) -> Result<Option<StorageValue>> {
        self.block(PlayerRepository::new(&self.pool).storage_value(player_id, key))
    }

    fn set_storage_value(&self, player_id: i64, key: i64, value: i64) -> Result<()> {
        self.block(PlayerRepository::new(&self.pool).set_storage_value(player_id, key, value))
    }

    fn table_columns(&self, table: &'static str) -> Result<ColumnCatalog> {
        self.block(CatalogRepository::new(&self.pool).columns(table))
    }

    fn custom_field(&self, column: &AllowedColumn, id: i64) -> Result<Option<String>> {
        self.block(CatalogRepository::new(&self.pool).read_field(column, id))
    }

    fn set_custom_field(&self, column: &AllowedColumn, id: i64, value: &SqlValue) -> Result<u64> {
        self.block(CatalogRepository::new(&self.pool).write_field(column, id, value))
    }

    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>> {
        self.block(QueryRepository::new(&self.pool).query(sql, params))
    }

    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        self.block(QueryRepository::new(&self.pool).execute(sql, params))
    }

    fn execute_batch(&self, statements: &[Statement]) -> Result<u64> {
        self.block(QueryRepository::new(&self.pool).execute_batch(statements))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::Fixture;

    #[test]
    fn test_blocking_lookups() {
        let fx = Fixture::new();

        let alice = fx.data.player_by_name("Alice").unwrap().unwrap();
        assert_eq!(alice.id, fx.alice_id);
        assert_eq!(alice.account_id, fx.account_id);
        assert!(fx.data.player_by_name("alice-not-here").unwrap().is_none());

        let account = fx.data.account_by_id(fx.account_id).unwrap().unwrap();
        assert_eq!(account.name, "acc1");
        assert_eq!(
            fx.data.account_player_names(fx.account_id).unwrap(),
            vec!["Alice".to_string()]
        );
    }

    #[test]
    fn test_blocking_mutations() {
        let fx = Fixture::new();

        fx.data.set_bank_balance(fx.alice_id, 1500).unwrap();
        assert_eq!(fx.data.player_by_id(fx.alice_id).unwrap().unwrap().balance, 1500);

        fx.data.set_storage_value(fx.alice_id, 9, 3).unwrap();
        assert_eq!(fx.data.storage_value(fx.alice_id, 9).unwrap().unwrap().value, 3);
    }

    #[test]
    fn test_enabled_extensions_empty() {
        let fx = Fixture::new();
        assert!(fx
            .data
            .enabled_extensions(ExtensionKind::Page)
            .unwrap()
            .is_empty());
    }
}
