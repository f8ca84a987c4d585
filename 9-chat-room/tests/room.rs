use std::{
    io,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use axum::{body::Body, http::Request};
use chat_room::{
    hub::{Hub, HubHandle},
    participant::Message as RoomMessage,
    server::{AppState, ChatServer, RoomConfig, router},
    trace::{WriterTracer, off},
};
use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tower::ServiceExt;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const READ_TIMEOUT: Duration = Duration::from_secs(2);

struct RunningRoom {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<Result<()>>,
}

async fn start_room() -> Result<RunningRoom> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server = ChatServer::new(listener, RoomConfig::default(), off());
    let addr = server.local_addr()?;

    let (shutdown, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(server.run_until(async move {
        let _ = shutdown_rx.await;
    }));

    Ok(RunningRoom {
        addr,
        shutdown,
        server,
    })
}

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("buffer lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SharedBuffer {
    fn count_lines_starting_with(&self, prefix: &str) -> usize {
        let bytes = self.0.lock().expect("buffer lock").clone();
        String::from_utf8_lossy(&bytes)
            .lines()
            .filter(|line| line.starts_with(prefix))
            .count()
    }
}

/// A room served by the router alone, with the hub handle and trace output
/// kept by the test.
struct ObservedRoom {
    addr: SocketAddr,
    hub: HubHandle,
    trace: SharedBuffer,
}

async fn start_observed_room(config: RoomConfig) -> Result<ObservedRoom> {
    let trace = SharedBuffer::default();
    let (hub, handle) = Hub::new(Arc::new(WriterTracer::new(trace.clone())));
    tokio::spawn(hub.run());

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = router(AppState::new(handle.clone(), config));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Ok(ObservedRoom {
        addr,
        hub: handle,
        trace,
    })
}

async fn wait_for_members(hub: &HubHandle, expected: usize) -> Result<()> {
    timeout(READ_TIMEOUT, poll_members(hub, expected))
        .await
        .with_context(|| format!("room never reached {expected} members"))?
}

async fn poll_members(hub: &HubHandle, expected: usize) -> Result<()> {
    while hub.member_count().await? != expected {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

async fn wait_for_trace(trace: &SharedBuffer, prefix: &str) -> Result<()> {
    timeout(READ_TIMEOUT, async {
        while trace.count_lines_starting_with(prefix) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .with_context(|| format!("no trace line starting with '{prefix}'"))
}

/// Connects and waits until the hub has registered the new participant, which
/// is proven by the participant's own greeting coming back to it.
async fn connect_and_join(addr: SocketAddr, greeting: &str) -> Result<Client> {
    let (mut client, _) = connect_async(format!("ws://{addr}/room")).await?;
    send(&mut client, greeting).await?;
    assert_eq!(next_text(&mut client).await?, greeting);
    Ok(client)
}

async fn send(client: &mut Client, text: &str) -> Result<()> {
    client.send(Message::text(text.to_string())).await?;
    Ok(())
}

async fn next_text(client: &mut Client) -> Result<String> {
    loop {
        let frame = timeout(READ_TIMEOUT, client.next())
            .await
            .context("timed out waiting for a message")?
            .context("connection ended")??;
        match frame {
            Message::Text(text) => return Ok(text.to_string()),
            Message::Close(_) => bail!("connection closed by server"),
            _ => continue,
        }
    }
}

async fn expect_closed(client: &mut Client) -> Result<()> {
    loop {
        let frame = timeout(READ_TIMEOUT, client.next())
            .await
            .context("timed out waiting for the connection to close")?;
        match frame {
            None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return Ok(()),
            Some(Ok(_)) => continue,
        }
    }
}

#[tokio::test]
async fn clients_receive_broadcasts_including_their_own() -> Result<()> {
    let room = start_room().await?;

    let mut alice = connect_and_join(room.addr, "alice is here").await?;
    let mut bob = connect_and_join(room.addr, "bob is here").await?;
    assert_eq!(next_text(&mut alice).await?, "bob is here");

    send(&mut alice, "hello bob").await?;
    assert_eq!(next_text(&mut bob).await?, "hello bob");
    assert_eq!(next_text(&mut alice).await?, "hello bob");

    send(&mut bob, "hi alice").await?;
    assert_eq!(next_text(&mut alice).await?, "hi alice");
    assert_eq!(next_text(&mut bob).await?, "hi alice");

    let _ = room.shutdown.send(());
    room.server.await??;
    Ok(())
}

#[tokio::test]
async fn messages_from_one_sender_arrive_in_order() -> Result<()> {
    let room = start_room().await?;

    let mut alice = connect_and_join(room.addr, "alice is here").await?;
    let mut bob = connect_and_join(room.addr, "bob is here").await?;
    assert_eq!(next_text(&mut alice).await?, "bob is here");

    for n in 0..20 {
        send(&mut alice, &format!("message {n}")).await?;
    }
    for n in 0..20 {
        assert_eq!(next_text(&mut bob).await?, format!("message {n}"));
    }

    let _ = room.shutdown.send(());
    room.server.await??;
    Ok(())
}

#[tokio::test]
async fn departing_client_does_not_disturb_the_room() -> Result<()> {
    let room = start_room().await?;

    let mut alice = connect_and_join(room.addr, "alice is here").await?;
    let mut bob = connect_and_join(room.addr, "bob is here").await?;
    assert_eq!(next_text(&mut alice).await?, "bob is here");

    alice.close(None).await?;
    drop(alice);

    send(&mut bob, "anyone left?").await?;
    assert_eq!(next_text(&mut bob).await?, "anyone left?");

    let mut carol = connect_and_join(room.addr, "carol is here").await?;
    assert_eq!(next_text(&mut bob).await?, "carol is here");
    send(&mut carol, "welcome me").await?;
    assert_eq!(next_text(&mut bob).await?, "welcome me");

    let _ = room.shutdown.send(());
    room.server.await??;
    Ok(())
}

#[tokio::test]
async fn shutdown_disconnects_participants() -> Result<()> {
    let room = start_room().await?;
    let mut alice = connect_and_join(room.addr, "alice is here").await?;

    let _ = room.shutdown.send(());
    expect_closed(&mut alice).await?;
    timeout(READ_TIMEOUT, room.server).await???;
    Ok(())
}

#[tokio::test]
async fn plain_request_is_rejected_without_stopping_the_hub() -> Result<()> {
    let (hub, handle) = Hub::new(off());
    tokio::spawn(hub.run());
    let app = router(AppState::new(handle.clone(), RoomConfig::default()));

    let response = app
        .oneshot(Request::get("/room").body(Body::empty())?)
        .await?;
    assert!(
        response.status().is_client_error(),
        "unexpected status {}",
        response.status()
    );

    assert_eq!(handle.member_count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn each_disconnect_leaves_the_room_once() -> Result<()> {
    let room = start_observed_room(RoomConfig::default()).await?;

    let mut alice = connect_and_join(room.addr, "alice is here").await?;
    let bob = connect_and_join(room.addr, "bob is here").await?;
    assert_eq!(next_text(&mut alice).await?, "bob is here");
    assert_eq!(room.hub.member_count().await?, 2);

    alice.close(None).await?;
    wait_for_members(&room.hub, 1).await?;

    // No close frame: the socket just goes away.
    drop(bob);
    wait_for_members(&room.hub, 0).await?;

    assert_eq!(room.trace.count_lines_starting_with("participant joined"), 2);
    assert_eq!(room.trace.count_lines_starting_with("participant left"), 2);
    assert_eq!(room.trace.count_lines_starting_with("leave ignored"), 0);
    Ok(())
}

#[tokio::test]
async fn stalled_reader_is_evicted_and_its_connection_ends() -> Result<()> {
    let room = start_observed_room(RoomConfig {
        queue_capacity: 1,
        write_timeout: Duration::from_millis(200),
        ..RoomConfig::default()
    })
    .await?;

    let mut stalled = connect_and_join(room.addr, "not reading").await?;
    assert_eq!(room.hub.member_count().await?, 1);

    // Keep broadcasting until the socket buffers fill and the queue overflows.
    let payload = RoomMessage::from("x".repeat(60 * 1024));
    let mut evicted = false;
    for _ in 0..5_000 {
        room.hub.forward(RoomMessage::clone(&payload))?;
        if room.hub.member_count().await? == 0 {
            evicted = true;
            break;
        }
    }
    assert!(evicted, "stalled reader was never evicted");

    // The evicted connection task gives up on its write, closes the socket
    // and sends a leave the hub no longer has a member for.
    expect_closed(&mut stalled).await?;
    wait_for_trace(&room.trace, "leave ignored").await?;
    assert_eq!(room.trace.count_lines_starting_with("participant left"), 0);
    assert_eq!(room.hub.member_count().await?, 0);

    let _newcomer = connect_and_join(room.addr, "fresh start").await?;
    assert_eq!(room.hub.member_count().await?, 1);
    Ok(())
}
