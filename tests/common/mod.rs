//! Test helpers for integration tests.
//!
//! Provides a seeded in-memory database, a site directory builder and
//! helpers to bootstrap a runtime against them.

#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use tokio::runtime::Runtime as TokioRuntime;

use castro::db::{
    AccountRepository, ExtensionKind, ExtensionRecord, ExtensionRepository, NewAccount, NewPlayer,
    PlayerRepository,
};
use castro::{Config, Database, Dispatcher, Runtime, SqlDataLayer};

/// Table prefix used by every test.
pub const PREFIX: &str = "castro";

/// A tokio runtime, a seeded database and a site directory.
///
/// The engine blocks on the runtime handle, so tests call it from the test
/// thread and only use `rt.block_on` for async setup.
pub struct TestSite {
    pub dir: TempDir,
    pub data: Arc<SqlDataLayer>,
    pub db: Database,
    pub alice_id: i64,
    pub rt: TokioRuntime,
}

impl TestSite {
    /// Create an empty site with one account owning player "Alice".
    pub fn new() -> Self {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let (db, alice_id) = rt.block_on(async {
            let db = Database::open_in_memory().await.unwrap();
            db.ensure_extension_tables(PREFIX).await.unwrap();
            let account = AccountRepository::new(db.pool())
                .create(&NewAccount::new("acc1").with_email("acc1@example.com"))
                .await
                .unwrap();
            let alice = PlayerRepository::new(db.pool())
                .create(&NewPlayer::new("Alice", account.id).with_level(20))
                .await
                .unwrap();
            (db, alice.id)
        });
        let data = Arc::new(SqlDataLayer::new(
            db.pool().clone(),
            rt.handle().clone(),
            PREFIX,
        ));
        Self {
            dir: TempDir::new().unwrap(),
            data,
            db,
            alice_id,
            rt,
        }
    }

    /// Write a file relative to the site root.
    pub fn write(&self, rel: &str, content: &str) {
        let path = self.dir.path().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.scripts.pages_dir = self.root().join("pages").display().to_string();
        config.scripts.widgets_dir = self.root().join("widgets").display().to_string();
        config.scripts.extensions_dir = self.root().join("extensions").display().to_string();
        config.scripts.table_prefix = PREFIX.to_string();
        config
    }

    /// Register an extension record.
    pub fn install(&self, id: &str, kind: ExtensionKind, enabled: bool, priority: i64) {
        self.rt
            .block_on(
                ExtensionRepository::new(self.db.pool(), PREFIX).upsert(&ExtensionRecord {
                    extension_id: id.to_string(),
                    kind,
                    enabled,
                    priority,
                }),
            )
            .unwrap();
    }

    pub fn bootstrap(&self) -> castro::Result<Runtime> {
        Runtime::bootstrap(&self.config(), self.data.clone())
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(Arc::new(self.bootstrap().unwrap()))
    }
}
