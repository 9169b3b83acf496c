//! Channels that carry envelopes between the client and the dispatcher.
//!
//! Frames are untyped JSON values; each side decodes what it receives. The
//! in-memory pair joins a client and a dispatcher inside one process. The
//! NDJSON pumps bridge an [`Endpoint`] onto a byte stream (a child process's
//! stdio, or our own stdin/stdout in `serve` mode).

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One side of a bidirectional frame channel.
#[derive(Debug)]
pub struct Endpoint {
    pub outbound: mpsc::Sender<Value>,
    pub inbound: mpsc::Receiver<Value>,
}

impl Endpoint {
    pub fn split(self) -> (mpsc::Sender<Value>, mpsc::Receiver<Value>) {
        (self.outbound, self.inbound)
    }
}

/// Two connected endpoints: what one sends, the other receives.
pub fn in_memory(capacity: usize) -> (Endpoint, Endpoint) {
    let (a_tx, b_rx) = mpsc::channel(capacity.max(1));
    let (b_tx, a_rx) = mpsc::channel(capacity.max(1));
    (
        Endpoint {
            outbound: a_tx,
            inbound: a_rx,
        },
        Endpoint {
            outbound: b_tx,
            inbound: b_rx,
        },
    )
}

/// Background tasks moving frames between an endpoint and a byte stream.
pub struct NdjsonPumps {
    pub reader: JoinHandle<()>,
    pub writer: JoinHandle<()>,
}

impl NdjsonPumps {
    pub fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Connect a byte stream to a new endpoint.
///
/// Each line read from `input` becomes one inbound frame; unparsable lines are
/// logged and skipped. Each outbound frame is written to `output` as one line.
/// The endpoint's inbound side closes when `input` reaches EOF.
pub fn ndjson<R, W>(input: R, output: W, capacity: usize) -> (Endpoint, NdjsonPumps)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity.max(1));
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity.max(1));

    let pumps = NdjsonPumps {
        reader: tokio::spawn(read_lines(input, inbound_tx)),
        writer: tokio::spawn(write_lines(output, outbound_rx)),
    };

    (
        Endpoint {
            outbound: outbound_tx,
            inbound: inbound_rx,
        },
        pumps,
    )
}

async fn read_lines<R>(input: R, frames: mpsc::Sender<Value>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(input);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(text) {
                    Ok(frame) => {
                        if frames.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "skipping unparsable frame"),
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "transport read failed");
                break;
            }
        }
    }

    tracing::debug!("transport input closed");
}

async fn write_lines<W>(output: W, mut frames: mpsc::Receiver<Value>)
where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(output);

    while let Some(frame) = frames.recv().await {
        let mut line = frame.to_string();
        line.push('\n');
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        };
        if let Err(e) = written.await {
            tracing::error!(error = %e, "transport write failed");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_in_memory_pair_is_crossed() {
        let (mut a, mut b) = in_memory(4);
        a.outbound.send(json!({"from": "a"})).await.unwrap();
        b.outbound.send(json!({"from": "b"})).await.unwrap();

        assert_eq!(b.inbound.recv().await.unwrap(), json!({"from": "a"}));
        assert_eq!(a.inbound.recv().await.unwrap(), json!({"from": "b"}));
    }

    #[tokio::test]
    async fn test_ndjson_skips_garbage_and_closes_on_eof() {
        let input: &[u8] = b"{\"id\":\"1\"}\nnot json\n\n{\"id\":\"2\"}\n";
        let (mut endpoint, _pumps) = ndjson(input, tokio::io::sink(), 4);

        assert_eq!(endpoint.inbound.recv().await.unwrap(), json!({"id": "1"}));
        assert_eq!(endpoint.inbound.recv().await.unwrap(), json!({"id": "2"}));
        assert!(endpoint.inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_ndjson_writes_one_line_per_frame() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let (read_half, write_half) = tokio::io::split(client_io);
        let (endpoint, _pumps) = ndjson(read_half, write_half, 4);

        endpoint.outbound.send(json!({"id": "a"})).await.unwrap();
        endpoint.outbound.send(json!({"id": "b"})).await.unwrap();

        let mut lines = BufReader::new(server_io).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), r#"{"id":"a"}"#);
        assert_eq!(lines.next_line().await.unwrap().unwrap(), r#"{"id":"b"}"#);
    }
}
