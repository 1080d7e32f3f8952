//! Database schema and migrations for Castro.
//!
//! The game tables mirror the layout of the game server's own database so a
//! site can point at a live server schema. Extension tables carry a
//! configurable prefix and are created separately by
//! [`extension_tables`].

/// Database migrations, applied in order.
///
/// The schema_version table tracks which migrations have been applied.
#[cfg(feature = "sqlite")]
pub const MIGRATIONS: &[&str] = &[
    // v1: accounts and players
    r#"
CREATE TABLE accounts (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    name            TEXT NOT NULL UNIQUE,
    password        TEXT NOT NULL DEFAULT '',
    email           TEXT NOT NULL DEFAULT '',
    premium_ends_at INTEGER NOT NULL DEFAULT 0,
    creation        INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE players (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL UNIQUE,
    account_id  INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    level       INTEGER NOT NULL DEFAULT 1,
    vocation    INTEGER NOT NULL DEFAULT 0,
    sex         INTEGER NOT NULL DEFAULT 0,
    town_id     INTEGER NOT NULL DEFAULT 1,
    experience  INTEGER NOT NULL DEFAULT 0,
    cap         INTEGER NOT NULL DEFAULT 400,
    balance     INTEGER NOT NULL DEFAULT 0,
    lastlogin   INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX idx_players_account_id ON players(account_id);
"#,
    // v2: storage values, guilds and the online list
    r#"
CREATE TABLE player_storage (
    player_id   INTEGER NOT NULL REFERENCES players(id) ON DELETE CASCADE,
    key         INTEGER NOT NULL,
    value       INTEGER NOT NULL,
    PRIMARY KEY (player_id, key)
);

CREATE TABLE guilds (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL UNIQUE,
    ownerid     INTEGER NOT NULL,
    creationdata INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE guild_membership (
    player_id   INTEGER PRIMARY KEY REFERENCES players(id) ON DELETE CASCADE,
    guild_id    INTEGER NOT NULL REFERENCES guilds(id) ON DELETE CASCADE,
    rank        TEXT NOT NULL DEFAULT 'Member'
);

CREATE TABLE players_online (
    player_id   INTEGER PRIMARY KEY REFERENCES players(id) ON DELETE CASCADE
);
"#,
];

#[cfg(feature = "postgres")]
pub const MIGRATIONS: &[&str] = &[
    // v1: accounts and players
    r#"
CREATE TABLE accounts (
    id              BIGSERIAL PRIMARY KEY,
    name            TEXT NOT NULL UNIQUE,
    password        TEXT NOT NULL DEFAULT '',
    email           TEXT NOT NULL DEFAULT '',
    premium_ends_at BIGINT NOT NULL DEFAULT 0,
    creation        BIGINT NOT NULL DEFAULT 0
);

CREATE TABLE players (
    id          BIGSERIAL PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE,
    account_id  BIGINT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    level       BIGINT NOT NULL DEFAULT 1,
    vocation    BIGINT NOT NULL DEFAULT 0,
    sex         BIGINT NOT NULL DEFAULT 0,
    town_id     BIGINT NOT NULL DEFAULT 1,
    experience  BIGINT NOT NULL DEFAULT 0,
    cap         BIGINT NOT NULL DEFAULT 400,
    balance     BIGINT NOT NULL DEFAULT 0,
    lastlogin   BIGINT NOT NULL DEFAULT 0
);

CREATE INDEX idx_players_account_id ON players(account_id);
"#,
    // v2: storage values, guilds and the online list
    r#"
CREATE TABLE player_storage (
    player_id   BIGINT NOT NULL REFERENCES players(id) ON DELETE CASCADE,
    key         BIGINT NOT NULL,
    value       BIGINT NOT NULL,
    PRIMARY KEY (player_id, key)
);

CREATE TABLE guilds (
    id          BIGSERIAL PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE,
    ownerid     BIGINT NOT NULL,
    creationdata BIGINT NOT NULL DEFAULT 0
);

CREATE TABLE guild_membership (
    player_id   BIGINT PRIMARY KEY REFERENCES players(id) ON DELETE CASCADE,
    guild_id    BIGINT NOT NULL REFERENCES guilds(id) ON DELETE CASCADE,
    rank        TEXT NOT NULL DEFAULT 'Member'
);

CREATE TABLE players_online (
    player_id   BIGINT PRIMARY KEY REFERENCES players(id) ON DELETE CASCADE
);
"#,
];

/// SQL creating the persisted extension registry for the given prefix.
///
/// The prefix must already be validated (see `Config::validate`).
pub fn extension_tables(prefix: &str) -> String {
    let mut sql = String::new();
    for kind in ["pages", "widgets"] {
        sql.push_str(&format!(
            "CREATE TABLE IF NOT EXISTS {prefix}_extension_{kind} (
    extension_id TEXT PRIMARY KEY,
    enabled      BOOLEAN NOT NULL DEFAULT TRUE,
    priority     BIGINT NOT NULL DEFAULT 0
);
"
        ));
    }
    sql
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_tables_use_prefix() {
        let sql = extension_tables("myot");
        assert!(sql.contains("myot_extension_pages"));
        assert!(sql.contains("myot_extension_widgets"));
        assert!(!sql.contains("castro_"));
    }
}
