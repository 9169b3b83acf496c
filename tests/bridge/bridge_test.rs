use std::sync::Arc;
use std::time::Duration;

use repobridge::config::{ClientSettings, Settings};
use repobridge::protocol::{Descriptor, FindOperator, Operation, Scalar};
use repobridge::{transport, BridgeError, Client};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct Session {
    id: String,
    title: String,
    status: String,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    archived: bool,
    #[serde(default)]
    created_at: Option<i64>,
    #[serde(default)]
    updated_at: Option<i64>,
}

fn session(id: &str, status: &str, created_at: i64) -> Session {
    Session {
        id: id.to_string(),
        title: format!("session {}", id),
        status: status.to_string(),
        tags: None,
        archived: false,
        created_at: Some(created_at),
        updated_at: None,
    }
}

async fn seeded_client() -> Client {
    let client = Client::in_process(&Settings::default());
    client.init().await.unwrap();
    client
        .repository("Session")
        .save_many(&[
            session("s1", "started", 1),
            session("s2", "done", 2),
            session("s3", "failed", 3),
        ])
        .await
        .unwrap();
    client
}

fn where_(conditions: Descriptor) -> Descriptor {
    Descriptor::map([("where", conditions)])
}

#[tokio::test]
async fn test_find_sessions_by_status_in() {
    let client = seeded_client().await;

    let descriptor = where_(Descriptor::map([(
        "status",
        FindOperator::is_in(["started", "done"]),
    )]));
    assert_eq!(
        descriptor.serialize()["where"]["status"],
        json!({"$operator": "in", "value": ["started", "done"], "multi": true})
    );

    let mut found: Vec<Session> = client.repository("Session").find(&descriptor).await.unwrap();
    found.sort_by(|a, b| a.id.cmp(&b.id));
    assert_eq!(found, vec![session("s1", "started", 1), session("s2", "done", 2)]);
}

#[tokio::test]
async fn test_repository_round_trip() {
    let client = seeded_client().await;
    let sessions = client.repository("Session");

    let mut renamed = session("s2", "done", 2);
    renamed.title = "renamed".into();
    renamed.tags = Some(vec!["rust".into()]);
    let saved = sessions.save(&renamed).await.unwrap();
    assert_eq!(saved, renamed);

    let one: Option<Session> = sessions
        .find_one(&where_(Descriptor::map([(
            "tags",
            FindOperator::array_contains(["rust"]),
        )])))
        .await
        .unwrap();
    assert_eq!(one.map(|s| s.id), Some("s2".to_string()));

    let affected = sessions
        .update(
            Descriptor::map([("createdAt", FindOperator::more_than(1))]),
            Descriptor::map([("archived", true)]),
        )
        .await
        .unwrap();
    assert_eq!(affected, 2);

    let archived = sessions
        .count(&where_(Descriptor::map([("archived", true)])))
        .await
        .unwrap();
    assert_eq!(archived, 2);

    let deleted = sessions
        .delete(Descriptor::map([("status", FindOperator::not_equal("started"))]))
        .await
        .unwrap();
    assert_eq!(deleted, 2);
    assert_eq!(sessions.count(&Descriptor::empty()).await.unwrap(), 1);
}

#[tokio::test]
async fn test_find_options_paging_and_order() {
    let client = seeded_client().await;

    let descriptor = Descriptor::map([
        ("select", Descriptor::list(["id"])),
        ("order", Descriptor::map([("createdAt", "DESC")])),
        ("skip", Descriptor::from(1)),
        ("take", Descriptor::from(1)),
    ]);
    let rows = client
        .call(Operation::Find, "Session", &descriptor)
        .await
        .unwrap();
    assert_eq!(rows, json!([{"id": "s2"}]));
}

#[tokio::test]
async fn test_save_generates_missing_key() {
    let client = Client::in_process(&Settings::default());
    let saved = client
        .call(
            Operation::Save,
            "Message",
            &Descriptor::map([
                ("sessionId", "s1"),
                ("role", "user"),
                ("content", "hello"),
            ]),
        )
        .await
        .unwrap();

    let id = saved["id"].as_str().unwrap();
    assert_eq!(id.len(), 36);
    assert_eq!(saved["tokens"], Value::Null);
}

#[tokio::test]
async fn test_unknown_entity() {
    let client = Client::in_process(&Settings::default());
    let err = tokio::time::timeout(
        Duration::from_secs(5),
        client.call(Operation::Find, "NotARealCollection", &Descriptor::empty()),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert_eq!(err, BridgeError::UnknownEntity("NotARealCollection".into()));
}

#[tokio::test]
async fn test_unsupported_operator_from_hand_crafted_frame() {
    let settings = Settings::default();
    let (mut caller, dispatcher_end) = transport::in_memory(8);
    let dispatcher = Arc::new(repobridge::Dispatcher::from_settings(&settings));
    tokio::spawn(dispatcher.run(dispatcher_end));

    caller
        .outbound
        .send(json!({
            "id": "hand-1",
            "type": "repositoryExecute",
            "payload": ["Session", "find", {"where": {"status": {"$operator": "soundsLike", "value": "x"}}}]
        }))
        .await
        .unwrap();

    let reply = caller.inbound.recv().await.unwrap();
    assert_eq!(reply["id"], "hand-1");
    assert_eq!(reply["error"]["kind"], "UnsupportedOperator");
    assert!(reply.get("result").is_none());
}

#[tokio::test]
async fn test_engine_failure_is_isolated() {
    let client = Arc::new(seeded_client().await);

    let bad = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.raw_query("SELECT * FROM no_such_table", &[]).await })
    };
    let good = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .raw_query(
                    "SELECT id FROM sessions WHERE status = ?",
                    &[Some(Scalar::from("done"))],
                )
                .await
        })
    };

    let err = bad.await.unwrap().unwrap_err();
    assert!(matches!(err, BridgeError::EngineExecution(ref m) if m.contains("no_such_table")));
    assert_eq!(good.await.unwrap().unwrap(), json!([{"id": "s2"}]));
}

#[tokio::test]
async fn test_concurrent_calls_do_not_cross() {
    let client = Arc::new(seeded_client().await);

    let mut handles = Vec::new();
    for i in 0..30 {
        let client = Arc::clone(&client);
        handles.push(tokio::spawn(async move {
            let id = format!("s{}", i % 3 + 1);
            let row = client
                .call(
                    Operation::FindOne,
                    "Session",
                    &where_(Descriptor::map([("id", id.as_str())])),
                )
                .await
                .unwrap();
            (id, row["id"].as_str().map(str::to_string))
        }));
    }

    for handle in handles {
        let (asked, got) = handle.await.unwrap();
        assert_eq!(Some(asked), got);
    }
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_out_of_order_replies_reach_their_callers() {
    let (client_end, mut peer) = transport::in_memory(8);
    let client = Arc::new(Client::new(&ClientSettings::default(), client_end));

    let calls: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|name| {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                client
                    .call(Operation::Count, name, &Descriptor::empty())
                    .await
                    .map(|v| (name, v))
            })
        })
        .collect();

    let mut frames = Vec::new();
    for _ in 0..3 {
        frames.push(peer.inbound.recv().await.unwrap());
    }
    // Reply in reverse arrival order, echoing the collection name
    for frame in frames.into_iter().rev() {
        peer.outbound
            .send(json!({"id": frame["id"], "result": frame["payload"][0]}))
            .await
            .unwrap();
    }

    for call in calls {
        let (name, value) = call.await.unwrap().unwrap();
        assert_eq!(value, json!(name));
    }
}

#[tokio::test]
async fn test_call_before_ready_resolves_after_init() {
    let mut settings = Settings::default();
    settings.bootstrap.auto_start = false;
    let client = Arc::new(Client::in_process(&settings));

    let early = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.call(Operation::Count, "Session", &Descriptor::empty()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!early.is_finished());

    client.init().await.unwrap();
    assert_eq!(early.await.unwrap().unwrap(), json!(0));
}

#[tokio::test]
async fn test_malformed_update_is_rejected_before_engine() {
    let client = seeded_client().await;
    let err = client
        .call(
            Operation::Update,
            "Session",
            &Descriptor::map([("set", Descriptor::map([("archived", true)]))]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::MalformedDescriptor(_)));
    assert_eq!(
        client
            .repository("Session")
            .count(&where_(Descriptor::map([("archived", true)])))
            .await
            .unwrap(),
        0
    );
}
