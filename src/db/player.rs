//! Game entities read by scripts: accounts, players and what hangs off them.

use super::DbPool;
use crate::{CastroError, Result};

/// Account entity.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub email: String,
    /// Unix timestamp at which premium time runs out (0 = never had any).
    pub premium_ends_at: i64,
    /// Unix timestamp of account creation.
    pub creation: i64,
}

/// Player (character) entity.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Player {
    pub id: i64,
    pub name: String,
    pub account_id: i64,
    pub level: i64,
    pub vocation: i64,
    pub sex: i64,
    pub town_id: i64,
    pub experience: i64,
    pub cap: i64,
    pub balance: i64,
    pub lastlogin: i64,
}

/// Guild a player belongs to, with the player's rank.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Guild {
    pub id: i64,
    pub name: String,
    pub ownerid: i64,
    pub rank: String,
}

/// A single storage key/value pair of a player.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct StorageValue {
    pub key: i64,
    pub value: i64,
}

/// New account for creation.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub name: String,
    pub email: String,
    pub premium_ends_at: i64,
}

impl NewAccount {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: String::new(),
            premium_ends_at: 0,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = email.into();
        self
    }

    pub fn with_premium_ends_at(mut self, ends_at: i64) -> Self {
        self.premium_ends_at = ends_at;
        self
    }
}

/// New player for creation.
#[derive(Debug, Clone)]
pub struct NewPlayer {
    pub name: String,
    pub account_id: i64,
    pub level: i64,
    pub vocation: i64,
    pub sex: i64,
    pub town_id: i64,
}

impl NewPlayer {
    pub fn new(name: impl Into<String>, account_id: i64) -> Self {
        Self {
            name: name.into(),
            account_id,
            level: 1,
            vocation: 0,
            sex: 0,
            town_id: 1,
        }
    }

    pub fn with_level(mut self, level: i64) -> Self {
        self.level = level;
        self
    }

    pub fn with_vocation(mut self, vocation: i64) -> Self {
        self.vocation = vocation;
        self
    }

    pub fn with_town(mut self, town_id: i64) -> Self {
        self.town_id = town_id;
        self
    }
}

const ACCOUNT_COLUMNS: &str = "id, name, email, premium_ends_at, creation";
const PLAYER_COLUMNS: &str =
    "id, name, account_id, level, vocation, sex, town_id, experience, cap, balance, lastlogin";

/// Repository for account operations.
pub struct AccountRepository<'a> {
    pool: &'a DbPool,
}

impl<'a> AccountRepository<'a> {
    /// Create a new repository instance.
    pub fn new(pool: &'a DbPool) -> Self {
        Self { pool }
    }

    /// Create a new account.
    pub async fn create(&self, new_account: &NewAccount) -> Result<Account> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO accounts (name, email, premium_ends_at, creation)
             VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(&new_account.name)
        .bind(&new_account.email)
        .bind(new_account.premium_ends_at)
        .bind(chrono::Utc::now().timestamp())
        .fetch_one(self.pool)
        .await?;

        self.get_by_id(id)
            .await?
            .ok_or_else(|| CastroError::NotFound(format!("account {id}")))
    }

    /// Get an account by ID.
    pub async fn get_by_id(&self, id: i64) -> Result<Option<Account>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1");
        Ok(sqlx::query_as::<_, Account>(&sql)
            .bind(id)
            .fetch_optional(self.pool)
            .await?)
    }

    /// Get an account by name.
    pub async fn get_by_name(&self, name: &str) -> Result<Option<Account>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE name = $1");
        Ok(sqlx::query_as::<_, Account>(&sql)
            .bind(name)
            .fetch_optional(self.pool)
            .await?)
    }

    /// Names of all players on an account, ordered by name.
    pub async fn player_names(&self, account_id: i64) -> Result<Vec<String>> {
        Ok(
            sqlx::query_scalar("SELECT name FROM players WHERE account_id = $1 ORDER BY name")
                .bind(account_id)
                .fetch_all(self.pool)
                .await?,
        )
    }
}

/// Repository for player operations.
pub struct PlayerRepository<'a> {
    pool: &'a DbPool,
}

impl<'a> PlayerRepository<'a> {
    /// Create a new repository instance.
    pub fn new(pool: &'a DbPool) -> Self {
        Self { pool }
    }

    /// Create a new player.
    pub async fn create(&self, new_player: &NewPlayer) -> Result<Player> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO players (name, account_id, level, vocation, sex, town_id)
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
        )
        .bind(&new_player.name)
        .bind(new_player.account_id)
        .bind(new_player.level)
        .bind(new_player.vocation)
        .bind(new_player.sex)
        .bind(new_player.town_id)
        .fetch_one(self.pool)
        .await?;

        self.get_by_id(id)
            .await?
            .ok_or_else(|| CastroError::NotFound(format!("player {id}")))
    }

    /// Get a player by ID.
    pub async fn get_by_id(&self, id: i64) -> Result<Option<Player>> {
        let sql = format!("SELECT {PLAYER_COLUMNS} FROM players WHERE id = $1");
        Ok(sqlx::query_as::<_, Player>(&sql)
            .bind(id)
            .fetch_optional(self.pool)
            .await?)
    }

    /// Get a player by name.
    pub async fn get_by_name(&self, name: &str) -> Result<Option<Player>> {
        let sql = format!("SELECT {PLAYER_COLUMNS} FROM players WHERE name = $1");
        Ok(sqlx::query_as::<_, Player>(&sql)
            .bind(name)
            .fetch_optional(self.pool)
            .await?)
    }

    /// Set the bank balance of a player.
    pub async fn set_balance(&self, id: i64, balance: i64) -> Result<()> {
        let result = sqlx::query("UPDATE players SET balance = $1 WHERE id = $2")
            .bind(balance)
            .bind(id)
            .execute(self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CastroError::NotFound(format!("player {id}")));
        }
        Ok(())
    }

    /// Check whether a player appears in the online list.
    pub async fn is_online(&self, id: i64) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM players_online WHERE player_id = $1")
                .bind(id)
                .fetch_one(self.pool)
                .await?;
        Ok(count > 0)
    }

    /// Mark a player online or offline.
    pub async fn set_online(&self, id: i64, online: bool) -> Result<()> {
        if online {
            sqlx::query(
                "INSERT INTO players_online (player_id) VALUES ($1) ON CONFLICT DO NOTHING",
            )
            .bind(id)
            .execute(self.pool)
            .await?;
        } else {
            sqlx::query("DELETE FROM players_online WHERE player_id = $1")
                .bind(id)
                .execute(self.pool)
                .await?;
        }
        Ok(())
    }

    /// Get a storage value of a player.
    pub async fn storage_value(&self, id: i64, key: i64) -> Result<Option<StorageValue>> {
        Ok(sqlx::query_as::<_, StorageValue>(
            "SELECT key, value FROM player_storage WHERE player_id = $1 AND key = $2",
        )
        .bind(id)
        .bind(key)
        .fetch_optional(self.pool)
        .await?)
    }

    /// Insert or overwrite a storage value of a player.
    pub async fn set_storage_value(&self, id: i64, key: i64, value: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO player_storage (player_id, key, value) VALUES ($1, $2, $3)
             ON CONFLICT (player_id, key) DO UPDATE SET value = excluded.value",
        )
        .bind(id)
        .bind(key)
        .bind(value)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Get the guild of a player, if any.
    pub async fn guild(&self, id: i64) -> Result<Option<Guild>> {
        Ok(sqlx::query_as::<_, Guild>(
            "SELECT g.id, g.name, g.ownerid, m.rank
             FROM guild_membership m JOIN guilds g ON g.id = m.guild_id
             WHERE m.player_id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await?)
    }

    /// Create a guild and make the owner its first member.
    pub async fn create_guild(&self, name: &str, owner_id: i64) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let guild_id: i64 = sqlx::query_scalar(
            "INSERT INTO guilds (name, ownerid, creationdata) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(name)
        .bind(owner_id)
        .bind(chrono::Utc::now().timestamp())
        .fetch_one(&mut *tx)
        .await?;
        sqlx::query("INSERT INTO guild_membership (player_id, guild_id, rank) VALUES ($1, $2, $3)")
            .bind(owner_id)
            .bind(guild_id)
            .bind("Leader")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(guild_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn setup() -> (Database, Account) {
        let db = Database::open_in_memory().await.unwrap();
        let account = AccountRepository::new(db.pool())
            .create(&NewAccount::new("acc1").with_email("a@example.com"))
            .await
            .unwrap();
        (db, account)
    }

    #[tokio::test]
    async fn test_create_and_get_account() {
        let (db, account) = setup().await;
        let repo = AccountRepository::new(db.pool());

        assert_eq!(account.name, "acc1");
        assert_eq!(account.email, "a@example.com");
        assert!(account.creation > 0);

        let by_name = repo.get_by_name("acc1").await.unwrap().unwrap();
        assert_eq!(by_name.id, account.id);
        assert!(repo.get_by_name("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_and_get_player() {
        let (db, account) = setup().await;
        let repo = PlayerRepository::new(db.pool());

        let player = repo
            .create(&NewPlayer::new("Alice", account.id).with_level(8).with_vocation(1))
            .await
            .unwrap();
        assert_eq!(player.level, 8);
        assert_eq!(player.vocation, 1);
        assert_eq!(player.cap, 400);

        let by_name = repo.get_by_name("Alice").await.unwrap().unwrap();
        assert_eq!(by_name, player);

        let names = AccountRepository::new(db.pool())
            .player_names(account.id)
            .await
            .unwrap();
        assert_eq!(names, vec!["Alice".to_string()]);
    }

    #[tokio::test]
    async fn test_storage_values_upsert() {
        let (db, account) = setup().await;
        let repo = PlayerRepository::new(db.pool());
        let player = repo.create(&NewPlayer::new("Bob", account.id)).await.unwrap();

        assert!(repo.storage_value(player.id, 100).await.unwrap().is_none());

        repo.set_storage_value(player.id, 100, 1).await.unwrap();
        repo.set_storage_value(player.id, 100, 7).await.unwrap();

        let value = repo.storage_value(player.id, 100).await.unwrap().unwrap();
        assert_eq!(value, StorageValue { key: 100, value: 7 });
    }

    #[tokio::test]
    async fn test_online_and_guild() {
        let (db, account) = setup().await;
        let repo = PlayerRepository::new(db.pool());
        let player = repo.create(&NewPlayer::new("Carol", account.id)).await.unwrap();

        assert!(!repo.is_online(player.id).await.unwrap());
        repo.set_online(player.id, true).await.unwrap();
        repo.set_online(player.id, true).await.unwrap();
        assert!(repo.is_online(player.id).await.unwrap());
        repo.set_online(player.id, false).await.unwrap();
        assert!(!repo.is_online(player.id).await.unwrap());

        assert!(repo.guild(player.id).await.unwrap().is_none());
        let guild_id = repo.create_guild("Knights", player.id).await.unwrap();
        let guild = repo.guild(player.id).await.unwrap().unwrap();
        assert_eq!(guild.id, guild_id);
        assert_eq!(guild.rank, "Leader");
    }

    #[tokio::test]
    async fn test_set_balance_missing_player() {
        let (db, _) = setup().await;
        let repo = PlayerRepository::new(db.pool());
        let result = repo.set_balance(999, 10).await;
        assert!(matches!(result, Err(CastroError::NotFound(_))));
    }
}
