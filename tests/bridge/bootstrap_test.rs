use std::sync::Arc;

use repobridge::config::{ClientSettings, EngineSettings, FailurePolicy, Settings};
use repobridge::engine::{builtin_migrations, Bootstrap, Migration};
use repobridge::protocol::{Descriptor, Operation};
use repobridge::{transport, BridgeError, Client, Dispatcher, Registry};
use rusqlite::Connection;
use serde_json::json;

fn connect(dispatcher: Dispatcher) -> Client {
    let (client_end, dispatcher_end) = transport::in_memory(8);
    tokio::spawn(Arc::new(dispatcher).run(dispatcher_end));
    Client::new(&ClientSettings::default(), client_end)
}

fn with_migrations(policy: FailurePolicy, migrations: Vec<Migration>) -> Client {
    let bootstrap = Bootstrap::sqlite(
        EngineSettings::default(),
        policy,
        Registry::default(),
        migrations,
    );
    connect(Dispatcher::new(Registry::default(), bootstrap).with_auto_start(true))
}

fn broken() -> Vec<Migration> {
    let mut migrations = builtin_migrations();
    migrations.push(Migration::new(3, "broken", "ALTER TABLE nowhere ADD COLUMN x"));
    migrations
}

#[tokio::test]
async fn test_failed_bootstrap_fails_closed() {
    let client = with_migrations(FailurePolicy::FailClosed, broken());

    let err = client
        .call(Operation::Count, "Session", &Descriptor::empty())
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::EngineNotInitialized(ref m) if m.contains("broken")));

    // init reports the same failure instead of hanging
    let err = client.init().await.unwrap_err();
    assert!(matches!(err, BridgeError::EngineNotInitialized(_)));
}

#[tokio::test]
async fn test_degrade_policy_opens_gate() {
    let client = with_migrations(FailurePolicy::Degrade, broken());

    client.init().await.unwrap();
    let count = client
        .call(Operation::Count, "Session", &Descriptor::empty())
        .await
        .unwrap();
    assert_eq!(count, json!(0));

    let ledger = client
        .raw_query("SELECT version FROM _migrations ORDER BY version", &[])
        .await
        .unwrap();
    assert_eq!(ledger, json!([{"version": 1}, {"version": 2}]));
}

#[tokio::test]
async fn test_file_database_is_synced_and_migrated_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.db");

    // An older build's table, missing most columns
    {
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            r#"CREATE TABLE "settings" ("key" TEXT PRIMARY KEY NOT NULL);
               INSERT INTO "settings" ("key") VALUES ('theme');"#,
        )
        .unwrap();
    }

    let mut settings = Settings::default();
    settings.engine.path = Some(path.to_string_lossy().into_owned());

    {
        let client = Client::in_process(&settings);
        client.init().await.unwrap();

        let setting = client
            .call(
                Operation::FindOne,
                "Setting",
                &Descriptor::map([("where", Descriptor::map([("key", "theme")]))]),
            )
            .await
            .unwrap();
        assert_eq!(setting, json!({"key": "theme", "value": null}));

        client
            .call(
                Operation::Save,
                "Setting",
                &Descriptor::map([("key", "theme"), ("value", "dark")]),
            )
            .await
            .unwrap();
    }

    // Second start: nothing new to apply, data survives
    let client = Client::in_process(&settings);
    client.init().await.unwrap();
    let ledger = client
        .raw_query("SELECT COUNT(*) AS n FROM _migrations", &[])
        .await
        .unwrap();
    assert_eq!(ledger, json!([{"n": 2}]));

    let value = client
        .raw_query("SELECT value FROM settings WHERE key = 'theme'", &[])
        .await
        .unwrap();
    assert_eq!(value, json!([{"value": "\"dark\""}]));
}
