//! Per-client socket plumbing.
//!
//! Each accepted connection is split in two:
//! - a reader that turns every successful read into a `NewMessage` event
//!   and reports `Disconnected` once the stream ends
//! - a writer task that drains the connection's [`Outbox`]
//!
//! There is no framing. Whatever bytes one read returns are one message.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::event::{ClientHandle, Event, Outbox, Outgoing};

/// Maximum queued writes coalesced before a flush.
const MAX_WRITE_BATCH: usize = 64;

/// How long queued text may keep a closed connection open.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Serve a plain TCP connection until it ends.
///
/// The caller must already have delivered `Connected` for `handle`.
pub async fn serve(
    stream: TcpStream,
    handle: ClientHandle,
    outbox: Outbox,
    events: mpsc::Sender<Event>,
    read_buffer: usize,
) {
    let (reader, writer) = stream.into_split();
    serve_io(reader, writer, handle, outbox, events, read_buffer).await
}

/// Serve any split stream (used directly by tests with in-memory pipes).
pub async fn serve_io<R, W>(
    reader: R,
    writer: W,
    handle: ClientHandle,
    outbox: Outbox,
    events: mpsc::Sender<Event>,
    read_buffer: usize,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let write_handle = tokio::spawn(write_loop(writer, outbox, handle.clone()));
    read_loop(reader, handle, events, read_buffer).await;
    if let Err(e) = write_handle.await {
        tracing::warn!("Writer task failed: {e}");
    }
}

/// Forward reads as events until EOF, a read error, or the server closing
/// the connection. Always finishes with `Disconnected`.
pub async fn read_loop<R>(
    mut reader: R,
    handle: ClientHandle,
    events: mpsc::Sender<Event>,
    read_buffer: usize,
) where
    R: AsyncRead + Unpin,
{
    let address = handle.address().clone();
    let conn_id = handle.id();
    let mut buf = vec![0u8; read_buffer];

    loop {
        let read = tokio::select! {
            read = reader.read(&mut buf) => read,
            _ = handle.closed() => {
                tracing::debug!(%address, %conn_id, "Closed by server");
                break;
            }
        };

        match read {
            Ok(0) => {
                tracing::debug!(%address, %conn_id, "End of stream");
                break;
            }
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                let event = Event::NewMessage {
                    handle: handle.clone(),
                    text,
                };
                if events.send(event).await.is_err() {
                    tracing::debug!(%address, %conn_id, "Authority gone, dropping reader");
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(%address, %conn_id, "Error reading client message: {e}");
                break;
            }
        }
    }

    let _ = events.send(Event::Disconnected(handle)).await;
}

/// Drain the outbox onto the socket, batching queued writes, until the
/// connection is closed or a write fails. Shuts the write half down on
/// exit.
///
/// After a close, queued text still goes out, but only for `CLOSE_GRACE`:
/// a peer that stopped reading cannot hold the connection open.
pub async fn write_loop<W>(mut writer: W, mut outbox: Outbox, handle: ClientHandle)
where
    W: AsyncWrite + Unpin,
{
    let address = handle.address().clone();
    let conn_id = handle.id();
    // The writer must not keep the connection alive on its own.
    drop(handle);

    match pump(&mut writer, &mut outbox).await {
        Ok(()) => {}
        Err(Stop::Io(e)) => tracing::warn!(%address, %conn_id, "Write error: {e}"),
        Err(Stop::Closed) => {
            tracing::debug!(%address, %conn_id, "Peer not reading after close, dropping queued text")
        }
    }

    let _ = tokio::time::timeout(CLOSE_GRACE, writer.shutdown()).await;
}

/// Why [`pump`] gave up.
enum Stop {
    Io(std::io::Error),
    /// Close requested and the grace period ran out mid-write.
    Closed,
}

async fn pump<W>(writer: &mut W, outbox: &mut Outbox) -> Result<(), Stop>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match outbox.next().await {
            Outgoing::Text(text) => text,
            Outgoing::Close | Outgoing::Done => return Ok(()),
        };
        bounded(writer.write_all(first.as_bytes()), outbox).await?;

        let mut batch_count = 0;
        while batch_count < MAX_WRITE_BATCH {
            let Some(queued) = outbox.try_recv() else {
                break;
            };
            bounded(writer.write_all(queued.as_bytes()), outbox).await?;
            batch_count += 1;
        }
        bounded(writer.flush(), outbox).await?;
    }
}

/// Run one socket operation, abandoning it once a close has been pending
/// for `CLOSE_GRACE`.
async fn bounded<F>(io: F, outbox: &mut Outbox) -> Result<(), Stop>
where
    F: Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        result = io => result.map_err(Stop::Io),
        _ = outbox.close_expired(CLOSE_GRACE) => Err(Stop::Closed),
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::io::duplex;
    use tokio::time::timeout;

    use super::*;
    use crate::config::IdentityMode;

    fn handle() -> (ClientHandle, Outbox) {
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        ClientHandle::new(peer, IdentityMode::Endpoint, 16)
    }

    #[tokio::test]
    async fn reads_become_messages_then_disconnect() {
        let (handle, _outbox) = handle();
        let (mut client, server) = duplex(1024);
        let (tx, mut rx) = mpsc::channel(8);

        let reader = tokio::spawn(read_loop(server, handle.clone(), tx, 256));
        client.write_all(b"hello").await.unwrap();

        match rx.recv().await.unwrap() {
            Event::NewMessage { handle: h, text } => {
                assert_eq!(h.id(), handle.id());
                assert_eq!(text, "hello");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        drop(client);
        assert!(matches!(rx.recv().await.unwrap(), Event::Disconnected(h) if h.id() == handle.id()));
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn long_input_is_split_at_buffer_size() {
        let (handle, _outbox) = handle();
        let (mut client, server) = duplex(1024);
        let (tx, mut rx) = mpsc::channel(8);

        tokio::spawn(read_loop(server, handle, tx, 4));
        client.write_all(b"abcdefgh").await.unwrap();
        drop(client);

        let mut texts = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                Event::NewMessage { text, .. } => texts.push(text),
                Event::Disconnected(_) => break,
                Event::Connected(_) => unreachable!(),
            }
        }
        assert!(texts.iter().all(|t| t.len() <= 4));
        assert_eq!(texts.concat(), "abcdefgh");
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced() {
        let (handle, _outbox) = handle();
        let (mut client, server) = duplex(64);
        let (tx, mut rx) = mpsc::channel(8);

        tokio::spawn(read_loop(server, handle, tx, 64));
        client.write_all(&[b'o', b'k', 0xff]).await.unwrap();
        match rx.recv().await.unwrap() {
            Event::NewMessage { text, .. } => assert_eq!(text, "ok\u{fffd}"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_close_flushes_then_ends_both_halves() {
        let (handle, outbox) = handle();
        let (client, server) = duplex(1024);
        let (server_read, server_write) = tokio::io::split(server);
        let (mut client_read, _client_write) = tokio::io::split(client);
        let (tx, mut rx) = mpsc::channel(8);

        let task = tokio::spawn(serve_io(server_read, server_write, handle.clone(), outbox, tx, 256));

        handle.write("you are banned. bye bye");
        handle.close();

        let mut received = String::new();
        client_read.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "you are banned. bye bye");

        assert!(matches!(rx.recv().await.unwrap(), Event::Disconnected(_)));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn writer_batches_queued_text_in_order() {
        let (handle, outbox) = handle();
        let (client, server) = duplex(4096);
        let (mut client_read, _client_write) = tokio::io::split(client);

        for i in 0..10 {
            handle.write(format!("{i},"));
        }
        handle.close();
        write_loop(server, outbox, handle).await;

        let mut received = String::new();
        client_read.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "0,1,2,3,4,5,6,7,8,9,");
    }

    #[tokio::test]
    async fn close_ends_connection_even_if_peer_stops_reading() {
        let (handle, outbox) = handle();
        // Tiny pipe, and the client side never reads from it.
        let (_client, server) = duplex(16);
        let (server_read, server_write) = tokio::io::split(server);
        let (tx, mut rx) = mpsc::channel(8);

        let task = tokio::spawn(serve_io(server_read, server_write, handle.clone(), outbox, tx, 256));

        for i in 0..10 {
            handle.write(format!("broadcast number {i} that nobody reads"));
        }
        handle.close();

        assert!(matches!(rx.recv().await.unwrap(), Event::Disconnected(_)));
        timeout(Duration::from_secs(5), task)
            .await
            .expect("connection stayed open after close")
            .unwrap();
    }
}
