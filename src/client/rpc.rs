//! Async client for calling the engine across the channel.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::pending::PendingTable;
use super::repository::Repository;
use crate::config::{ClientSettings, Settings};
use crate::dispatcher::Dispatcher;
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{Descriptor, Operation, RequestEnvelope, RequestKind, ResponseEnvelope, Scalar};
use crate::transport::{self, Endpoint, NdjsonPumps};

/// Caller-side facade over the request channel.
///
/// Every call gets a fresh id, is registered in the correlation table, sent,
/// and resolved by the background reader when the matching response arrives.
/// Any number of calls may be in flight at once.
///
/// # Example
///
/// ```ignore
/// use repobridge::{Client, Descriptor, FindOperator, Settings};
///
/// let client = Client::in_process(&Settings::default());
/// let rows = client
///     .repository("Session")
///     .find::<serde_json::Value>(&Descriptor::map([(
///         "where",
///         Descriptor::map([("status", FindOperator::is_in(["started", "done"]))]),
///     )]))
///     .await?;
/// ```
pub struct Client {
    outbound: mpsc::Sender<Value>,
    pending: Arc<PendingTable>,
    closed: Arc<AtomicBool>,
    timeout: Option<Duration>,
    reader: JoinHandle<()>,
    /// Tasks and processes owned by this client, torn down on drop.
    attached: Attached,
}

#[derive(Default)]
struct Attached {
    tasks: Vec<JoinHandle<()>>,
    pumps: Option<NdjsonPumps>,
    child: Option<Child>,
}

impl Client {
    /// Attach a client to an endpoint whose peer is a dispatcher.
    pub fn new(settings: &ClientSettings, endpoint: Endpoint) -> Self {
        let (outbound, inbound) = endpoint.split();
        let pending = Arc::new(PendingTable::new());
        let closed = Arc::new(AtomicBool::new(false));
        let reader = spawn_reader(inbound, Arc::clone(&pending), Arc::clone(&closed));

        Self {
            outbound,
            pending,
            closed,
            timeout: settings.request_timeout(),
            reader,
            attached: Attached::default(),
        }
    }

    /// Run a dispatcher in this process and connect a client to it.
    pub fn in_process(settings: &Settings) -> Self {
        let (client_end, dispatcher_end) = transport::in_memory(settings.client.channel_capacity);
        let dispatcher = Arc::new(Dispatcher::from_settings(settings));
        let task = tokio::spawn(dispatcher.run(dispatcher_end));

        let mut client = Self::new(&settings.client, client_end);
        client.attached.tasks.push(task);
        client
    }

    /// Start `<path> serve` as a child process and talk to it over stdio.
    ///
    /// The child inherits the environment, so it resolves its own settings
    /// the usual way. It is killed when the client is dropped.
    pub async fn spawn_worker<P: AsRef<Path>>(path: P, settings: &ClientSettings) -> BridgeResult<Self> {
        let mut child = Command::new(path.as_ref())
            .arg("serve")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BridgeError::Channel(format!("failed to spawn worker: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Channel("worker stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Channel("worker stdout not captured".to_string()))?;

        let (endpoint, pumps) = transport::ndjson(stdout, stdin, settings.channel_capacity);
        let mut client = Self::new(settings, endpoint);
        client.attached.pumps = Some(pumps);
        client.attached.child = Some(child);
        Ok(client)
    }

    /// Execute a repository operation with the default deadline.
    pub async fn call(
        &self,
        operation: Operation,
        collection: &str,
        descriptor: &Descriptor,
    ) -> BridgeResult<Value> {
        self.request(
            RequestKind::RepositoryExecute,
            repository_payload(operation, collection, descriptor)?,
            self.timeout,
        )
        .await
    }

    /// Execute a repository operation with an explicit deadline.
    pub async fn call_with_timeout(
        &self,
        operation: Operation,
        collection: &str,
        descriptor: &Descriptor,
        timeout: Duration,
    ) -> BridgeResult<Value> {
        self.request(
            RequestKind::RepositoryExecute,
            repository_payload(operation, collection, descriptor)?,
            Some(timeout),
        )
        .await
    }

    /// Start engine bootstrap (if needed) and wait until it is ready.
    pub async fn init(&self) -> BridgeResult<()> {
        self.request(RequestKind::Init, Value::Null, self.timeout)
            .await
            .map(|_| ())
    }

    /// Run SQL text with positional parameters.
    ///
    /// Returns the rows for statements that produce columns, otherwise
    /// `{"affected": n}`.
    pub async fn raw_query(&self, sql: &str, params: &[Option<Scalar>]) -> BridgeResult<Value> {
        if params.iter().flatten().any(|p| !p.is_finite()) {
            return Err(BridgeError::MalformedDescriptor(
                "NaN and infinite numbers cannot be sent".to_string(),
            ));
        }
        let params: Vec<Value> = params
            .iter()
            .map(|p| p.as_ref().map_or(Value::Null, Scalar::to_json))
            .collect();
        self.request(RequestKind::RawQueryExecute, json!([sql, params]), self.timeout)
            .await
    }

    /// Typed facade for one collection.
    pub fn repository(&self, name: impl Into<String>) -> Repository<'_> {
        Repository::new(self, name.into())
    }

    /// Number of calls waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether the response side of the channel has closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn request(
        &self,
        kind: RequestKind,
        payload: Value,
        timeout: Option<Duration>,
    ) -> BridgeResult<Value> {
        let (id, rx) = self.pending.register();
        let _entry = EntryGuard {
            pending: &self.pending,
            id: id.clone(),
        };

        // Checked after registering so a concurrent close either sees this
        // entry in fail_all or is seen here.
        if self.is_closed() {
            return Err(BridgeError::Channel("channel closed".to_string()));
        }

        let frame = serde_json::to_value(RequestEnvelope::new(id.clone(), kind, payload))
            .map_err(|e| BridgeError::MalformedDescriptor(e.to_string()))?;

        // One deadline covers waiting for channel capacity and for the reply
        let exchange = async {
            tracing::debug!(id = %id, kind = kind.as_str(), "sending request");
            self.outbound
                .send(frame)
                .await
                .map_err(|_| BridgeError::Channel("request channel closed".to_string()))?;
            rx.await?
        };

        match timeout {
            Some(deadline) => match tokio::time::timeout(deadline, exchange).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::warn!(id = %id, deadline_ms = deadline.as_millis() as u64, "request timed out");
                    Err(BridgeError::timeout(deadline))
                }
            },
            None => exchange.await,
        }
    }
}

/// Removes a request's correlation entry when its call ends, whether it was
/// answered, failed, timed out or dropped. A late response is then stale.
struct EntryGuard<'a> {
    pending: &'a PendingTable,
    id: String,
}

impl Drop for EntryGuard<'_> {
    fn drop(&mut self) {
        // No-op once the response has settled the entry
        self.pending.remove(&self.id);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
        for task in &self.attached.tasks {
            task.abort();
        }
        if let Some(pumps) = &self.attached.pumps {
            pumps.abort();
        }
    }
}

fn repository_payload(
    operation: Operation,
    collection: &str,
    descriptor: &Descriptor,
) -> BridgeResult<Value> {
    Ok(json!([collection, operation.as_str(), descriptor.encode()?]))
}

/// Spawn the task that routes responses to their waiters.
fn spawn_reader(
    mut inbound: mpsc::Receiver<Value>,
    pending: Arc<PendingTable>,
    closed: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = inbound.recv().await {
            let id = frame.get("id").and_then(Value::as_str).map(str::to_string);
            match serde_json::from_value::<ResponseEnvelope>(frame) {
                Ok(response) => {
                    let id = response.id.clone();
                    if !pending.settle(response) {
                        tracing::warn!(id = %id, "dropping response for unknown request");
                    }
                }
                // The caller is still identifiable; fail it instead of letting it wait
                Err(e) => match id {
                    Some(id)
                        if pending.reject(
                            &id,
                            BridgeError::Channel(format!("malformed response: {}", e)),
                        ) =>
                    {
                        tracing::warn!(id = %id, error = %e, "rejected malformed response");
                    }
                    _ => tracing::warn!(error = %e, "dropping malformed response"),
                },
            }
        }

        // Channel closed - reject everything still waiting
        closed.store(true, Ordering::SeqCst);
        let failed = pending.fail_all(&BridgeError::Channel("channel closed".to_string()));
        if failed > 0 {
            tracing::warn!(pending = failed, "channel closed with requests in flight");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FindOperator;

    fn settings(timeout_ms: u64) -> ClientSettings {
        ClientSettings {
            request_timeout_ms: timeout_ms,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_request_frame_shape() {
        let (client_end, mut peer) = transport::in_memory(4);
        let client = Client::new(&settings(0), client_end);

        let descriptor = Descriptor::map([(
            "where",
            Descriptor::map([("status", FindOperator::is_in(["started", "done"]))]),
        )]);
        let call = client.call(Operation::Find, "Session", &descriptor);
        let serve = async {
            let frame = peer.inbound.recv().await.unwrap();
            assert_eq!(frame["type"], "repositoryExecute");
            assert_eq!(
                frame["payload"],
                json!(["Session", "find", {"where": {"status": {
                    "$operator": "in", "value": ["started", "done"], "multi": true
                }}}])
            );
            let id = frame["id"].as_str().unwrap().to_string();
            peer.outbound
                .send(json!({"id": id, "result": [{"id": "s1"}]}))
                .await
                .unwrap();
        };

        let (result, ()) = tokio::join!(call, serve);
        assert_eq!(result.unwrap(), json!([{"id": "s1"}]));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_removes_entry() {
        let (client_end, mut peer) = transport::in_memory(4);
        let client = Client::new(&settings(0), client_end);

        let err = client
            .call_with_timeout(
                Operation::Count,
                "Session",
                &Descriptor::empty(),
                Duration::from_millis(20),
            )
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::Timeout(20));
        assert_eq!(client.pending_count(), 0);

        // The late response is dropped as stale.
        let frame = peer.inbound.recv().await.unwrap();
        peer.outbound
            .send(json!({"id": frame["id"], "result": 3}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_deadline_covers_full_channel() {
        // Nobody reads from the peer, so the one-slot channel stays full
        let (client_end, _peer) = transport::in_memory(1);
        let client = Client::new(&settings(0), client_end);

        for _ in 0..2 {
            let descriptor = Descriptor::empty();
            let call = client.call_with_timeout(
                Operation::Count,
                "Session",
                &descriptor,
                Duration::from_millis(20),
            );
            let err = tokio::time::timeout(Duration::from_secs(2), call)
                .await
                .expect("deadline did not fire")
                .unwrap_err();
            assert_eq!(err, BridgeError::Timeout(20));
            assert_eq!(client.pending_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_dropped_call_releases_entry() {
        let (client_end, mut peer) = transport::in_memory(4);
        let client = Client::new(&settings(0), client_end);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            client.call(Operation::Find, "Session", &Descriptor::empty()),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(client.pending_count(), 0);

        // The reply that shows up afterwards has nobody to go to
        let frame = peer.inbound.recv().await.unwrap();
        peer.outbound
            .send(json!({"id": frame["id"], "result": []}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_response_fails_its_call() {
        let (client_end, mut peer) = transport::in_memory(4);
        let client = Client::new(&settings(0), client_end);

        let descriptor = Descriptor::empty();
        let call = client.call(Operation::Count, "Session", &descriptor);
        let serve = async {
            let frame = peer.inbound.recv().await.unwrap();
            peer.outbound
                .send(json!({"id": frame["id"], "error": "boom"}))
                .await
                .unwrap();
        };

        let (result, ()) = tokio::join!(call, serve);
        assert!(matches!(
            result,
            Err(BridgeError::Channel(ref m)) if m.contains("malformed response")
        ));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_non_finite_numbers_are_not_sent() {
        let (client_end, mut peer) = transport::in_memory(4);
        let client = Client::new(&settings(0), client_end);

        let descriptor = Descriptor::map([(
            "where",
            Descriptor::map([("createdAt", FindOperator::more_than(f64::NAN))]),
        )]);
        let err = client
            .call(Operation::Find, "Session", &descriptor)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::MalformedDescriptor(_)));

        let err = client
            .raw_query("SELECT ?", &[Some(Scalar::Real(f64::INFINITY))])
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::MalformedDescriptor(_)));

        assert_eq!(client.pending_count(), 0);
        assert!(peer.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_rejects_pending_and_later_calls() {
        let (client_end, peer) = transport::in_memory(4);
        let client = Arc::new(Client::new(&settings(0), client_end));

        let waiting = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.call(Operation::Find, "Session", &Descriptor::empty()).await })
        };
        while client.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        drop(peer);

        let err = waiting.await.unwrap().unwrap_err();
        assert!(err.is_channel_closed());

        let err = client.init().await.unwrap_err();
        assert!(err.is_channel_closed());

        tokio::time::timeout(Duration::from_secs(1), async {
            while !client.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
