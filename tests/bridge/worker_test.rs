use repobridge::config::ClientSettings;
use repobridge::protocol::{Descriptor, FindOperator, Operation};
use repobridge::{BridgeError, Client};
use serde_json::json;

async fn spawn() -> Client {
    Client::spawn_worker(env!("CARGO_BIN_EXE_repobridge"), &ClientSettings::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_worker_process_round_trip() {
    let client = spawn().await;
    client.init().await.unwrap();

    client
        .call(
            Operation::Save,
            "Session",
            &Descriptor::list([
                Descriptor::map([("id", "w1"), ("title", "one"), ("status", "started")]),
                Descriptor::map([("id", "w2"), ("title", "two"), ("status", "done")]),
            ]),
        )
        .await
        .unwrap();

    let rows = client
        .call(
            Operation::Find,
            "Session",
            &Descriptor::map([
                (
                    "where",
                    Descriptor::map([("title", FindOperator::like("t%"))]),
                ),
                ("select", Descriptor::list(["id", "status"])),
            ]),
        )
        .await
        .unwrap();
    assert_eq!(rows, json!([{"id": "w2", "status": "done"}]));
}

#[tokio::test]
async fn test_worker_errors_keep_their_kind() {
    let client = spawn().await;

    let err = client
        .call(Operation::Find, "NotARealCollection", &Descriptor::empty())
        .await
        .unwrap_err();
    assert_eq!(err, BridgeError::UnknownEntity("NotARealCollection".into()));

    let err = client.raw_query("SELEC 1", &[]).await.unwrap_err();
    assert!(matches!(err, BridgeError::EngineExecution(_)));
}

#[tokio::test]
async fn test_missing_worker_binary() {
    let err = Client::spawn_worker("/definitely/not/here/repobridge", &ClientSettings::default())
        .await
        .err()
        .unwrap();
    assert!(err.is_channel_closed());
}
