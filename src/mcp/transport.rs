//! Read → decode → dispatch → write loop over an arbitrary byte stream.
//!
//! Every complete frame in a chunk is dispatched before the next read.
//! Request handlers run as separate tasks, so their responses may leave in a
//! different order than the requests arrived; clients correlate by `id`.

use std::{future::Future, io, time::Duration};

use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    task::JoinSet,
};
use tracing::{debug, info, warn};

use crate::mcp::{
    dispatcher::{DispatchOutcome, Dispatcher},
    framing::{encode_frame, FrameDecoder},
    rpc::Response,
};

const READ_CHUNK_BYTES: usize = 16 * 1024;

/// Serves framed JSON-RPC until end-of-input or until `shutdown` resolves.
///
/// At end-of-input, in-flight requests get up to `grace` to finish and have
/// their responses written. On `shutdown` they are abandoned. Abandoned
/// handlers are cancelled and never finish in the background.
pub async fn serve<R, W, S>(
    mut reader: R,
    writer: W,
    dispatcher: Dispatcher,
    shutdown: S,
    grace: Duration,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    S: Future<Output = ()>,
{
    let (outbound, queue) = mpsc::unbounded_channel::<Response>();
    let writer_task = tokio::spawn(write_frames(writer, queue));
    let mut in_flight = JoinSet::new();
    let mut decoder = FrameDecoder::new();
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    tokio::pin!(shutdown);

    let interrupted = loop {
        let read = tokio::select! {
            _ = &mut shutdown => break true,
            read = reader.read(&mut chunk) => read?,
        };
        if read == 0 {
            break false;
        }

        decoder.extend(&chunk[..read]);
        while let Some(frame) = decoder.next_frame() {
            let message = match frame {
                Ok(message) => message,
                Err(err) => {
                    warn!(error = %err, "dropping malformed frame");
                    let _ = outbound.send(Response::from_error(Value::Null, err));
                    continue;
                }
            };

            match dispatcher.dispatch(message) {
                DispatchOutcome::Notified => {}
                DispatchOutcome::Respond(response) => {
                    let _ = outbound.send(response);
                }
                DispatchOutcome::Invoke(pending) => {
                    debug!(id = %pending.id(), "request dispatched");
                    let outbound = outbound.clone();
                    in_flight.spawn(async move {
                        let _ = outbound.send(pending.respond().await);
                    });
                }
            }
        }

        while in_flight.try_join_next().is_some() {}
    };

    if interrupted {
        info!(pending = in_flight.len(), "shutdown requested");
        in_flight.abort_all();
    } else {
        info!(pending = in_flight.len(), "input closed");
        let drained = tokio::time::timeout(grace, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                abandoned = in_flight.len(),
                "requests still running after shutdown grace period"
            );
            in_flight.abort_all();
        }
    }
    while in_flight.join_next().await.is_some() {}

    drop(outbound);
    writer_task
        .await
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?
}

async fn write_frames<W>(mut writer: W, mut queue: mpsc::UnboundedReceiver<Response>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = queue.recv().await {
        let frame = encode_frame(&response)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use serde_json::json;
    use tokio::io::{duplex, DuplexStream};

    use super::*;
    use crate::{errors::AppError, mcp::dispatcher::HandlerRegistry};

    fn frame(payload: &str) -> Vec<u8> {
        format!("Content-Length: {}\r\n\r\n{payload}", payload.len()).into_bytes()
    }

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry
            .on_request("ping", |_| async { Ok(json!({})) })
            .on_request("slow", |_| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(json!("slow"))
            })
            .on_request("fast", |_| async { Ok(json!("fast")) })
            .on_request("never", |_| async {
                std::future::pending::<()>().await;
                Ok(Value::Null)
            });
        registry
    }

    /// Feeds `chunks` to a running server, closes input and collects every
    /// response frame written back.
    async fn exchange(chunks: Vec<Vec<u8>>) -> Vec<Value> {
        let (mut client_in, server_in) = duplex(64 * 1024);
        let (server_out, client_out) = duplex(64 * 1024);
        let dispatcher = Dispatcher::new(Arc::new(registry()));

        let server = tokio::spawn(serve(
            server_in,
            server_out,
            dispatcher,
            std::future::pending(),
            Duration::from_secs(1),
        ));

        for chunk in chunks {
            client_in.write_all(&chunk).await.expect("write chunk");
        }
        drop(client_in);

        let output = read_all(client_out).await;
        server.await.expect("join").expect("serve");
        decode_all(&output)
    }

    async fn read_all(mut stream: DuplexStream) -> Vec<u8> {
        let mut output = Vec::new();
        stream.read_to_end(&mut output).await.expect("read output");
        output
    }

    fn decode_all(bytes: &[u8]) -> Vec<Value> {
        let mut decoder = FrameDecoder::new();
        decoder.extend(bytes);
        let messages = std::iter::from_fn(|| decoder.next_frame())
            .map(|frame| frame.expect("server writes valid frames"))
            .collect::<Vec<_>>();
        assert_eq!(decoder.buffered_len(), 0, "no trailing bytes after frames");
        messages
    }

    #[tokio::test]
    async fn answers_request_with_framed_response() {
        let responses = exchange(vec![frame(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#)]).await;

        assert_eq!(responses, vec![json!({ "jsonrpc": "2.0", "id": 1, "result": {} })]);
    }

    #[tokio::test]
    async fn split_frame_is_dispatched_once() {
        let bytes = frame(r#"{"jsonrpc":"2.0","id":7,"method":"ping"}"#);
        let (head, tail) = bytes.split_at(bytes.len() - 5);

        let responses = exchange(vec![head.to_vec(), tail.to_vec()]).await;

        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["id"], 7);
    }

    #[tokio::test]
    async fn unknown_method_and_notification_scenario() {
        let responses = exchange(vec![
            frame("{}"),
            frame(r#"{"jsonrpc":"2.0","method":"x"}"#),
            frame(r#"{"jsonrpc":"2.0","id":"q1","method":"x"}"#),
        ])
        .await;

        assert_eq!(
            responses,
            vec![json!({
                "jsonrpc": "2.0",
                "id": "q1",
                "error": { "code": -32601, "message": "Method not found", "data": { "method": "x" } }
            })]
        );
    }

    #[tokio::test]
    async fn parse_errors_do_not_stop_processing() {
        let mut chunk = frame("{oops");
        chunk.extend(frame(r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#));

        let responses = exchange(vec![chunk]).await;

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["id"], Value::Null);
        assert_eq!(responses[0]["error"]["code"], -32700);
        assert_eq!(responses[1]["id"], 2);
        assert_eq!(responses[1]["result"], json!({}));
    }

    #[tokio::test(start_paused = true)]
    async fn responses_correlate_by_id_not_order() {
        let mut chunk = frame(r#"{"jsonrpc":"2.0","id":1,"method":"slow"}"#);
        chunk.extend(frame(r#"{"jsonrpc":"2.0","id":2,"method":"fast"}"#));

        let responses = exchange(vec![chunk]).await;

        let ids = responses
            .iter()
            .map(|response| response["id"].clone())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![json!(2), json!(1)]);
        assert_eq!(responses[0]["result"], "fast");
        assert_eq!(responses[1]["result"], "slow");
    }

    #[tokio::test(start_paused = true)]
    async fn many_concurrent_requests_each_get_one_response() {
        let chunk = (0..25)
            .flat_map(|id| {
                let method = if id % 2 == 0 { "slow" } else { "fast" };
                frame(&format!(r#"{{"jsonrpc":"2.0","id":{id},"method":"{method}"}}"#))
            })
            .collect::<Vec<_>>();

        let responses = exchange(vec![chunk]).await;

        let mut ids = responses
            .iter()
            .map(|response| response["id"].as_i64().expect("integer id"))
            .collect::<Vec<_>>();
        ids.sort_unstable();
        assert_eq!(ids, (0..25).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_handler_does_not_block_others() {
        let mut chunk = frame(r#"{"jsonrpc":"2.0","id":"stuck","method":"never"}"#);
        chunk.extend(frame(r#"{"jsonrpc":"2.0","id":"ok","method":"ping"}"#));

        let responses = exchange(vec![chunk]).await;

        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["id"], "ok");
    }

    #[tokio::test]
    async fn panicking_notification_handler_keeps_serving() {
        let (mut client_in, server_in) = duplex(1024);
        let (server_out, client_out) = duplex(1024);
        let mut registry = registry();
        registry.on_notification("boom", |_| panic!("notification bug"));

        let server = tokio::spawn(serve(
            server_in,
            server_out,
            Dispatcher::new(Arc::new(registry)),
            std::future::pending(),
            Duration::from_secs(1),
        ));
        let mut chunk = frame(r#"{"jsonrpc":"2.0","method":"boom"}"#);
        chunk.extend(frame(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#));
        client_in.write_all(&chunk).await.expect("write");
        drop(client_in);

        let responses = decode_all(&read_all(client_out).await);
        server.await.expect("join").expect("serve");

        assert_eq!(responses, vec![json!({ "jsonrpc": "2.0", "id": 1, "result": {} })]);
    }

    #[tokio::test(start_paused = true)]
    async fn handlers_past_the_grace_period_are_cancelled() {
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = finished.clone();
        let mut registry = HandlerRegistry::new();
        registry.on_request("lingering", move |_| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        });
        let (mut client_in, server_in) = duplex(1024);
        let (server_out, client_out) = duplex(1024);

        let server = tokio::spawn(serve(
            server_in,
            server_out,
            Dispatcher::new(Arc::new(registry)),
            std::future::pending(),
            Duration::from_secs(1),
        ));
        client_in
            .write_all(&frame(r#"{"jsonrpc":"2.0","id":1,"method":"lingering"}"#))
            .await
            .expect("write");
        drop(client_in);

        let responses = decode_all(&read_all(client_out).await);
        server.await.expect("join").expect("serve");
        tokio::time::sleep(Duration::from_secs(20)).await;

        assert!(responses.is_empty());
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shutdown_signal_stops_serving() {
        let (_client_in, server_in) = duplex(1024);
        let (server_out, client_out) = duplex(1024);
        let dispatcher = Dispatcher::new(Arc::new(registry()));

        serve(
            server_in,
            server_out,
            dispatcher,
            async {},
            Duration::from_secs(1),
        )
        .await
        .expect("clean shutdown");

        assert!(read_all(client_out).await.is_empty());
    }

    #[tokio::test]
    async fn handler_errors_are_framed_like_any_response() {
        let (mut client_in, server_in) = duplex(1024);
        let (server_out, client_out) = duplex(1024);
        let mut registry = HandlerRegistry::new();
        registry.on_request("fail", |_| async { Err(AppError::validation("bad input")) });

        let server = tokio::spawn(serve(
            server_in,
            server_out,
            Dispatcher::new(Arc::new(registry)),
            std::future::pending(),
            Duration::from_secs(1),
        ));
        client_in
            .write_all(&frame(r#"{"jsonrpc":"2.0","id":1,"method":"fail"}"#))
            .await
            .expect("write");
        drop(client_in);

        let responses = decode_all(&read_all(client_out).await);
        server.await.expect("join").expect("serve");

        assert_eq!(responses[0]["error"]["code"], -32000);
        assert_eq!(responses[0]["error"]["data"]["code"], "VALIDATION_ERROR");
    }
}
