//! End-to-end tests over the in-memory transport, with the test body
//! playing the server.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use uuid::Uuid;

use erdlab_collab::connection::{
    cursors_topic, events_topic, join_dest, leave_dest, presence_topic, PERSONAL_QUEUE, PING_DEST,
    PONG_QUEUE,
};
use erdlab_collab::transport::{memory_pair, MemoryServer, ServerEnd};
use erdlab_collab::{
    ClientConfig, CollabClient, EventFilter, EventKind, Frame, FrameCommand, LocalUser,
    PresenceSnapshot, StaticToken, TokenProvider, UserPresence, WireEvent,
};
use erdlab_core::{Document, HistoryOpts, Table};

fn config() -> ClientConfig {
    let mut config = ClientConfig::new("mem://collab");
    config.handshake_timeout = Duration::from_millis(500);
    config.health_interval = Duration::from_millis(30);
    // keep ping traffic out of frame assertions by default
    config.probe_interval = Duration::from_secs(60);
    config.probe_timeout = Duration::from_secs(60);
    config
}

async fn spawn_client(
    config: ClientConfig,
    user: LocalUser,
) -> (Arc<CollabClient>, MemoryServer) {
    let (transport, server) = memory_pair();
    let client = CollabClient::with_transport(
        config,
        user,
        Arc::new(StaticToken("tok".into())),
        Arc::new(transport),
        Arc::new(RwLock::new(Document::new())),
    )
    .await;
    (client, server)
}

async fn handshake(server: &mut MemoryServer) -> ServerEnd {
    let mut end = server.accept().await.expect("client should dial");
    let connect = end.from_client.recv().await.expect("CONNECT frame");
    assert_eq!(connect.command, FrameCommand::Connect);
    assert_eq!(connect.body, "tok");
    end.to_client.send(Frame::connected()).await.unwrap();
    end
}

/// Consume the post-handshake subscription replay for a joined diagram.
async fn expect_session_setup(end: &mut ServerEnd, diagram: Uuid) {
    for expected in [
        PERSONAL_QUEUE.to_string(),
        PONG_QUEUE.to_string(),
        events_topic(diagram),
        presence_topic(diagram),
        cursors_topic(diagram),
    ] {
        let frame = end.from_client.recv().await.expect("subscribe frame");
        assert_eq!(frame.command, FrameCommand::Subscribe);
        assert_eq!(frame.destination, expected);
    }
    let join = end.from_client.recv().await.expect("join announce");
    assert_eq!(join.command, FrameCommand::Send);
    assert_eq!(join.destination, join_dest(diagram));
}

async fn joined_client(
    user: LocalUser,
) -> (Arc<CollabClient>, ServerEnd, Uuid) {
    let (client, mut server) = spawn_client(config(), user).await;
    let diagram = Uuid::new_v4();
    let join = {
        let client = client.clone();
        tokio::spawn(async move { client.join_diagram(diagram).await })
    };
    let mut end = handshake(&mut server).await;
    expect_session_setup(&mut end, diagram).await;
    join.await.unwrap().unwrap();
    (client, end, diagram)
}

async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn table_created(diagram: Uuid, user: Uuid, table: &Table) -> WireEvent {
    WireEvent::new(
        EventKind::TableCreated,
        diagram,
        user,
        serde_json::json!({ "table": table }),
    )
}

#[tokio::test]
async fn test_join_connects_on_demand() {
    let user = LocalUser::new(Uuid::new_v4());
    let (client, _end, diagram) = joined_client(user).await;
    assert!(client.is_connected());
    assert_eq!(client.current_diagram(), Some(diagram));
    client.shutdown().await;
}

#[tokio::test]
async fn test_missing_credential_fails_join() {
    struct NoToken;
    impl TokenProvider for NoToken {
        fn token(&self) -> Option<String> {
            None
        }
    }
    let (transport, _server) = memory_pair();
    let client = CollabClient::with_transport(
        config(),
        LocalUser::new(Uuid::new_v4()),
        Arc::new(NoToken),
        Arc::new(transport),
        Arc::new(RwLock::new(Document::new())),
    )
    .await;
    let result = client.join_diagram(Uuid::new_v4()).await;
    assert!(result.is_err());
    assert!(!client.is_connected());
    client.shutdown().await;
}

#[tokio::test]
async fn test_local_edit_publishes_typed_event() {
    let (client, mut end, diagram) = joined_client(LocalUser::new(Uuid::new_v4())).await;

    client
        .document()
        .write()
        .await
        .add_tables(vec![Table::new("orders")], HistoryOpts::record())
        .unwrap();

    let frame = end.from_client.recv().await.unwrap();
    assert_eq!(frame.command, FrameCommand::Send);
    assert_eq!(
        frame.destination,
        format!("/app/diagram/{diagram}/event")
    );
    let body: serde_json::Value = serde_json::from_str(&frame.body).unwrap();
    assert_eq!(body["type"], "TABLE_CREATED");
    assert_eq!(body["payload"]["table"]["name"], "orders");
    // the client never stamps identity; the server does
    assert!(body.get("userId").is_none());
    client.shutdown().await;
}

#[tokio::test]
async fn test_remote_event_applies_without_echo() {
    let (client, mut end, diagram) = joined_client(LocalUser::new(Uuid::new_v4())).await;

    let table = Table::new("remote_table");
    let table_id = table.id;
    let event = table_created(diagram, Uuid::new_v4(), &table);
    end.to_client
        .send(Frame::message(events_topic(diagram), event.encode().unwrap()))
        .await
        .unwrap();

    let document = client.document();
    wait_until(|| {
        document
            .try_read()
            .map(|doc| doc.table(table_id).is_some())
            .unwrap_or(false)
    })
    .await;
    // the apply skipped the undo log
    assert_eq!(document.read().await.history_len(), 0);

    // and nothing was published back
    let echoed = tokio::time::timeout(Duration::from_millis(150), end.from_client.recv()).await;
    assert!(echoed.is_err(), "remote apply must not be echoed");
    client.shutdown().await;
}

#[tokio::test]
async fn test_reflected_own_event_discarded() {
    let me = Uuid::new_v4();
    let (client, mut end, diagram) = joined_client(LocalUser::new(me)).await;

    // the events topic reflects our own publish back at us
    let table = Table::new("mine");
    let table_id = table.id;
    let event = table_created(diagram, me, &table);
    end.to_client
        .send(Frame::message(events_topic(diagram), event.encode().unwrap()))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(client.document().read().await.table(table_id).is_none());
    client.shutdown().await;
}

#[tokio::test]
async fn test_malformed_remote_event_is_contained() {
    let (client, mut end, diagram) = joined_client(LocalUser::new(Uuid::new_v4())).await;

    end.to_client
        .send(Frame::message(events_topic(diagram), "{{{garbage"))
        .await
        .unwrap();

    // a well-formed event right after still applies
    let table = Table::new("survivor");
    let table_id = table.id;
    let event = table_created(diagram, Uuid::new_v4(), &table);
    end.to_client
        .send(Frame::message(events_topic(diagram), event.encode().unwrap()))
        .await
        .unwrap();

    let document = client.document();
    wait_until(|| {
        document
            .try_read()
            .map(|doc| doc.table(table_id).is_some())
            .unwrap_or(false)
    })
    .await;
    assert!(client.is_connected());
    client.shutdown().await;
}

#[tokio::test]
async fn test_presence_roster_and_cursor_patch() {
    let (client, end, diagram) = joined_client(LocalUser::new(Uuid::new_v4())).await;
    let mut roster = client.watch_presence();

    let other = Uuid::new_v4();
    let snapshot = PresenceSnapshot {
        diagram_id: diagram,
        users: vec![UserPresence::new(other)],
    };
    end.to_client
        .send(Frame::message(
            presence_topic(diagram),
            serde_json::to_string(&snapshot).unwrap(),
        ))
        .await
        .unwrap();

    roster.changed().await.unwrap();
    assert_eq!(roster.borrow_and_update().len(), 1);

    // a cursor broadcast patches the known user
    let body = serde_json::json!({"userId": other, "x": 42.0, "y": 17.0});
    end.to_client
        .send(Frame::message(cursors_topic(diagram), body.to_string()))
        .await
        .unwrap();

    roster.changed().await.unwrap();
    let users = roster.borrow_and_update().clone();
    assert_eq!(users[0].cursor_x, Some(42.0));
    assert_eq!(users[0].cursor_y, Some(17.0));
    client.shutdown().await;
}

#[tokio::test]
async fn test_departed_user_vanishes_on_next_roster() {
    let (client, end, diagram) = joined_client(LocalUser::new(Uuid::new_v4())).await;
    let mut roster = client.watch_presence();

    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    for users in [vec![a, b], vec![a]] {
        let snapshot = PresenceSnapshot {
            diagram_id: diagram,
            users: users.into_iter().map(UserPresence::new).collect(),
        };
        end.to_client
            .send(Frame::message(
                presence_topic(diagram),
                serde_json::to_string(&snapshot).unwrap(),
            ))
            .await
            .unwrap();
        roster.changed().await.unwrap();
    }
    let users = roster.borrow_and_update().clone();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].user_id, a);
    client.shutdown().await;
}

#[tokio::test]
async fn test_latency_probe_round_trip() {
    let mut cfg = config();
    cfg.probe_interval = Duration::from_millis(30);
    cfg.probe_timeout = Duration::from_millis(500);
    let (client, mut server) = spawn_client(cfg, LocalUser::new(Uuid::new_v4())).await;
    let diagram = Uuid::new_v4();
    let join = {
        let client = client.clone();
        tokio::spawn(async move { client.join_diagram(diagram).await })
    };
    let mut end = handshake(&mut server).await;
    expect_session_setup(&mut end, diagram).await;
    join.await.unwrap().unwrap();

    let mut latency = client.watch_latency();
    // answer pings until a sample lands
    let ping = loop {
        let frame = end.from_client.recv().await.unwrap();
        if frame.destination == PING_DEST {
            break frame;
        }
    };
    let body: serde_json::Value = serde_json::from_str(&ping.body).unwrap();
    end.to_client
        .send(Frame::message(
            PONG_QUEUE,
            serde_json::json!({"pingId": body["pingId"]}).to_string(),
        ))
        .await
        .unwrap();

    latency.changed().await.unwrap();
    assert!(latency.borrow_and_update().is_some());
    client.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_replays_diagram_session() {
    let (client, mut server) = spawn_client(config(), LocalUser::new(Uuid::new_v4())).await;
    let diagram = Uuid::new_v4();
    let join = {
        let client = client.clone();
        tokio::spawn(async move { client.join_diagram(diagram).await })
    };
    let mut end = handshake(&mut server).await;
    expect_session_setup(&mut end, diagram).await;
    join.await.unwrap().unwrap();

    let mut state = client.watch_connection_state();
    drop(end); // link dies

    // health loop redials; the whole session replays without a new join call
    let mut end = handshake(&mut server).await;
    expect_session_setup(&mut end, diagram).await;
    wait_until(|| client.is_connected()).await;
    let _ = state.borrow_and_update();
    assert_eq!(client.current_diagram(), Some(diagram));
    client.shutdown().await;
}

#[tokio::test]
async fn test_leave_diagram_tears_down_channels() {
    let (client, mut end, diagram) = joined_client(LocalUser::new(Uuid::new_v4())).await;

    client.leave_diagram().await.unwrap();
    let leave = end.from_client.recv().await.unwrap();
    assert_eq!(leave.destination, leave_dest(diagram));
    for topic in [
        events_topic(diagram),
        presence_topic(diagram),
        cursors_topic(diagram),
    ] {
        let frame = end.from_client.recv().await.unwrap();
        assert_eq!(frame.command, FrameCommand::Unsubscribe);
        assert_eq!(frame.destination, topic);
    }
    assert!(client.current_diagram().is_none());
    assert!(client.watch_presence().borrow().is_empty());

    // document edits after leaving stay local
    client
        .document()
        .write()
        .await
        .add_tables(vec![Table::new("local_only")], HistoryOpts::record())
        .unwrap();
    let published =
        tokio::time::timeout(Duration::from_millis(150), end.from_client.recv()).await;
    assert!(published.is_err(), "no diagram joined, nothing may publish");
    client.shutdown().await;
}

#[tokio::test]
async fn test_cursor_and_lock_publishing() {
    let me = Uuid::new_v4();
    let (client, mut end, diagram) = joined_client(LocalUser::new(me)).await;

    client.send_cursor_position(3.0, 4.0).await.unwrap();
    let frame = end.from_client.recv().await.unwrap();
    assert_eq!(frame.destination, format!("/app/diagram/{diagram}/cursor"));
    let body: serde_json::Value = serde_json::from_str(&frame.body).unwrap();
    assert_eq!(body["x"], 3.0);
    assert_eq!(body["userId"], serde_json::json!(me));

    let element = Uuid::new_v4();
    client.lock_element("table", element).await.unwrap();
    let frame = end.from_client.recv().await.unwrap();
    assert_eq!(frame.destination, format!("/app/diagram/{diagram}/lock"));

    client.unlock_element("table", element).await.unwrap();
    let frame = end.from_client.recv().await.unwrap();
    assert_eq!(frame.destination, format!("/app/diagram/{diagram}/unlock"));
    client.shutdown().await;
}

#[tokio::test]
async fn test_listener_receives_remote_events() {
    let (client, end, diagram) = joined_client(LocalUser::new(Uuid::new_v4())).await;

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    client
        .subscribe(EventFilter::Kind(EventKind::TableCreated), move |event| {
            sink.lock().unwrap().push(event.kind);
        })
        .unwrap();

    let event = table_created(diagram, Uuid::new_v4(), &Table::new("observed"));
    end.to_client
        .send(Frame::message(events_topic(diagram), event.encode().unwrap()))
        .await
        .unwrap();

    wait_until(|| !seen.lock().unwrap().is_empty()).await;
    assert_eq!(seen.lock().unwrap()[0], EventKind::TableCreated);
    client.shutdown().await;
}

#[tokio::test]
async fn test_two_clients_converge() {
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let (client_a, mut end_a, diagram) = joined_client(LocalUser::new(alice)).await;

    // second client joins the same diagram over its own transport
    let (client_b, mut server_b) = spawn_client(config(), LocalUser::new(bob)).await;
    let join = {
        let client = client_b.clone();
        tokio::spawn(async move { client.join_diagram(diagram).await })
    };
    let mut end_b = handshake(&mut server_b).await;
    expect_session_setup(&mut end_b, diagram).await;
    join.await.unwrap().unwrap();

    // alice edits; the test relays her publish to bob, stamped the way
    // the server would stamp it
    client_a
        .document()
        .write()
        .await
        .add_tables(vec![Table::new("shared")], HistoryOpts::record())
        .unwrap();
    let frame = end_a.from_client.recv().await.unwrap();
    let body: serde_json::Value = serde_json::from_str(&frame.body).unwrap();
    let relayed = WireEvent::new(
        EventKind::TableCreated,
        diagram,
        alice,
        body["payload"].clone(),
    );
    end_b
        .to_client
        .send(Frame::message(events_topic(diagram), relayed.encode().unwrap()))
        .await
        .unwrap();

    let doc_b = client_b.document();
    wait_until(|| {
        doc_b
            .try_read()
            .map(|doc| doc.tables().iter().any(|t| t.name == "shared"))
            .unwrap_or(false)
    })
    .await;

    // bob applied it without recording history and without echoing
    assert_eq!(doc_b.read().await.history_len(), 0);
    let echoed = tokio::time::timeout(Duration::from_millis(150), end_b.from_client.recv()).await;
    assert!(echoed.is_err());

    client_a.shutdown().await;
    client_b.shutdown().await;
}
