//! Integration tests for pooled dispatch.
//!
//! These tests bootstrap a full runtime against a temporary site directory
//! and an in-memory database, then drive it through the dispatcher.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use castro::{CastroError, Dispatcher, RequestContext, Runtime};
use common::TestSite;

fn get(path: &str) -> RequestContext {
    RequestContext::new("GET", path)
}

/// Concurrent first requests for the same path each get their own
/// interpreter, and all of them end up idle in the pool.
#[test]
fn test_concurrent_cold_starts() {
    let site = TestSite::new();
    site.write(
        "pages/counter.lua",
        r#"
        calls = 0
        function get(ctx)
            calls = calls + 1
            return tostring(calls)
        end
        "#,
    );
    let dispatcher = site.dispatcher();

    thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                s.spawn(move || dispatcher.run("pages/counter.lua", get("/counter")))
            })
            .collect();
        for handle in handles {
            let response = handle.join().unwrap().unwrap();
            assert_eq!(response.status, 200);
        }
    });

    let stats = dispatcher.runtime().pool().stats();
    assert!(stats.created >= 1);
    assert_eq!(stats.created + stats.reused, 4);
    assert_eq!(stats.idle as u64, stats.created);
}

/// Global state survives between requests on the same interpreter, and
/// lookups ignore the case of the path.
#[test]
fn test_checkout_reuses_interpreter() {
    let site = TestSite::new();
    site.write(
        "pages/index.lua",
        r#"
        visits = 0
        function get(ctx)
            visits = visits + 1
            return "visit " .. visits
        end
        "#,
    );
    let dispatcher = site.dispatcher();

    let first = dispatcher.run("pages/index.lua", get("/")).unwrap();
    let second = dispatcher.run("PAGES/Index.lua", get("/")).unwrap();
    assert_eq!(first.body, "visit 1");
    assert_eq!(second.body, "visit 2");

    let stats = dispatcher.runtime().pool().stats();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.reused, 1);
}

/// A transaction left open by a failing script is rolled back on checkin
/// and its queued writes never reach the database.
#[test]
fn test_open_transaction_cleared_on_checkin() {
    let site = TestSite::new();
    site.write(
        "pages/tx.lua",
        r#"
        function get(ctx)
            db:begin()
            db:execute("UPDATE players SET level = $1 WHERE name = $2", 99, "Alice")
            error("aborted halfway")
        end
        "#,
    );
    site.write(
        "pages/level.lua",
        r#"
        function get(ctx)
            local row = db:singleQuery("SELECT level FROM players WHERE name = $1", "Alice")
            return tostring(row.level)
        end
        "#,
    );
    let dispatcher = site.dispatcher();

    let err = dispatcher.run("pages/tx.lua", get("/tx")).unwrap_err();
    assert!(err.to_string().contains("aborted halfway"));

    let interpreter = dispatcher.runtime().pool().checkout("pages/tx.lua").unwrap();
    assert!(!interpreter.in_transaction());
    dispatcher.runtime().pool().checkin(interpreter, "pages/tx.lua");

    let level = dispatcher.run("pages/level.lua", get("/level")).unwrap();
    assert_eq!(level.body, "20");
}

/// Committed transactions apply every queued statement.
#[test]
fn test_commit_applies_queued_statements() {
    let site = TestSite::new();
    site.write(
        "pages/promote.lua",
        r#"
        function post(ctx)
            db:begin()
            db:execute("UPDATE players SET level = level + 1 WHERE name = $1", "Alice")
            db:execute("UPDATE players SET level = level + 1 WHERE name = $1", "Alice")
            db:commit()
            local row = db:singleQuery("SELECT level FROM players WHERE name = $1", "Alice")
            return tostring(row.level)
        end
        "#,
    );
    let dispatcher = site.dispatcher();

    let response = dispatcher
        .run("pages/promote.lua", RequestContext::new("POST", "/promote"))
        .unwrap();
    assert_eq!(response.body, "22");
}

/// An abandoned dispatch has its interpreter discarded, never pooled.
#[test]
fn test_deadline_discards_interpreter() {
    let site = TestSite::new();
    site.write("pages/busy.lua", "function get(ctx) while true do end end");

    let mut config = site.config();
    // Ends the busy loop eventually so the worker thread can finish.
    config.limits.max_instructions = 200_000_000;
    let runtime = Runtime::bootstrap(&config, site.data.clone()).unwrap();
    let dispatcher = Dispatcher::new(Arc::new(runtime));

    let result = site.rt.block_on(dispatcher.run_with_deadline(
        "pages/busy.lua",
        get("/busy"),
        Duration::from_millis(20),
    ));
    assert!(matches!(result, Err(CastroError::Timeout(_))));

    let pool = dispatcher.runtime().pool();
    let started = Instant::now();
    while pool.stats().dropped == 0 {
        assert!(
            started.elapsed() < Duration::from_secs(30),
            "abandoned dispatch never finished"
        );
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(pool.idle_count("pages/busy.lua"), 0);
}

/// A dispatch that finishes in time behaves like a plain run.
#[test]
fn test_deadline_met() {
    let site = TestSite::new();
    site.write("pages/quick.lua", "function get(ctx) return 'done' end");
    let dispatcher = site.dispatcher();

    let response = site
        .rt
        .block_on(dispatcher.run_with_deadline(
            "pages/quick.lua",
            get("/quick"),
            Duration::from_secs(10),
        ))
        .unwrap();
    assert_eq!(response.body, "done");
    assert_eq!(dispatcher.runtime().pool().idle_count("pages/quick.lua"), 1);
}

/// Player and Account constructors report missing entities as
/// `nil, message` instead of raising.
#[test]
fn test_bind_not_found() {
    let site = TestSite::new();
    site.write(
        "pages/lookup.lua",
        r#"
        function get(ctx)
            local p, perr = Player("Nobody")
            local a, aerr = Account(123456)
            assert(p == nil and a == nil)
            return perr .. "|" .. aerr
        end
        "#,
    );
    let dispatcher = site.dispatcher();

    let response = dispatcher.run("pages/lookup.lua", get("/lookup")).unwrap();
    assert_eq!(response.body, "player Nobody not found|account 123456 not found");
}

/// Custom fields must name a live column of the entity table.
#[test]
fn test_custom_field_rejection() {
    let site = TestSite::new();
    site.write(
        "pages/fields.lua",
        r#"
        function get(ctx)
            local p = Player("Alice")
            p:setCustomField("lastlogin", 1234)
            local stored = p:getCustomField("lastlogin")
            local ok, err = pcall(function() p:setCustomField("password; --", 1) end)
            assert(not ok)
            return stored .. "|" .. tostring(err)
        end
        "#,
    );
    let dispatcher = site.dispatcher();

    let response = dispatcher.run("pages/fields.lua", get("/fields")).unwrap();
    let (stored, err) = response.body.split_once('|').unwrap();
    assert_eq!(stored, "1234");
    assert!(err.contains("is not a column of players"), "{err}");
}

/// Unknown paths are reported as not found.
#[test]
fn test_unknown_path() {
    let site = TestSite::new();
    site.write("pages/index.lua", "function get(ctx) return 'ok' end");
    let dispatcher = site.dispatcher();

    let err = dispatcher.run("pages/missing.lua", get("/missing")).unwrap_err();
    assert!(matches!(err, CastroError::NotFound(_)));
}
