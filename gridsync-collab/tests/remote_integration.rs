//! Integration tests for the WebSocket authority.
//!
//! These tests start a real server and connect real clients, verifying the
//! full request/reply and change-feed pipeline.

use futures_util::StreamExt;
use gridsync_collab::{
    Authority, AuthorityServer, CellKey, CellWrite, CommitResult, ConnectionState,
    ConnectivityMonitor, MemoryStore, PresenceUpdate, RemoteAuthority, ServerConfig,
    SessionConfig, TableSession,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

/// Start a server on a free port, return it and its URL.
async fn start_test_server() -> (Arc<AuthorityServer>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(AuthorityServer::new(ServerConfig::for_testing()));
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (server, format!("ws://127.0.0.1:{port}"))
}

fn write(row: u32, col: u32, value: &str, insert_only: bool) -> CellWrite {
    CellWrite {
        row,
        col,
        value: value.to_string(),
        actor_id: Uuid::new_v4(),
        version: 2,
        timestamp: gridsync_collab::now_millis(),
        insert_only,
    }
}

#[tokio::test]
async fn test_client_round_trips_requests() {
    let (server, url) = start_test_server().await;
    let client = RemoteAuthority::new(&url);
    client.connect().await.unwrap();
    assert_eq!(client.connection_state().await, ConnectionState::Connected);

    let table_id = Uuid::new_v4();
    assert!(client.get_cell(table_id, 0, 0).await.unwrap().is_none());

    let stored = client.upsert_cell(table_id, &write(0, 0, "hi", true)).await.unwrap();
    assert_eq!(stored.value, "hi");
    assert_eq!(stored.version, 2);

    let err = client
        .upsert_cell(table_id, &write(0, 0, "again", true))
        .await
        .unwrap_err();
    assert!(err.is_duplicate_key());

    assert_eq!(client.list_cells(table_id).await.unwrap(), vec![stored.clone()]);
    assert_eq!(
        server.authority().get_cell(table_id, 0, 0).await.unwrap(),
        Some(stored)
    );

    let stats = server.stats().await;
    assert_eq!(stats.active_connections, 1);
    assert!(stats.total_requests >= 4);
}

#[tokio::test]
async fn test_change_feed_reaches_other_clients() {
    let (_server, url) = start_test_server().await;
    let writer = RemoteAuthority::new(&url);
    let reader = RemoteAuthority::new(&url);
    writer.connect().await.unwrap();
    reader.connect().await.unwrap();

    let table_id = Uuid::new_v4();
    let mut feed = reader.subscribe_changes(table_id).await.unwrap();
    writer.upsert_cell(table_id, &write(4, 2, "pushed", false)).await.unwrap();

    let event = timeout(Duration::from_secs(2), feed.next())
        .await
        .expect("change should arrive")
        .expect("feed should stay open");
    assert_eq!(event.key(), CellKey::new(4, 2));
    assert_eq!(event.value, "pushed");
    assert_eq!(event.table_id, table_id);
}

#[tokio::test]
async fn test_presence_and_history_over_the_wire() {
    let (_server, url) = start_test_server().await;
    let client = RemoteAuthority::new(&url);
    client.connect().await.unwrap();
    let table_id = Uuid::new_v4();
    let actor_id = Uuid::new_v4();

    client
        .upsert_presence(
            table_id,
            &PresenceUpdate {
                actor_id,
                username: "ana".into(),
                last_seen_at: gridsync_collab::now_millis(),
                cursor: Some(CellKey::new(1, 2)),
                has_pending_changes: true,
            },
        )
        .await
        .unwrap();
    let presence = client.list_presence(table_id).await.unwrap();
    assert_eq!(presence.len(), 1);
    assert_eq!(presence[0].selected_cell, Some(CellKey::new(1, 2)));

    client.upsert_cell(table_id, &write(0, 0, "a", false)).await.unwrap();
    client
        .append_history(
            table_id,
            &gridsync_collab::HistoryRecord {
                row: 0,
                col: 0,
                old_value: None,
                new_value: "a".into(),
                actor_id: Some(actor_id),
                timestamp: 1,
            },
        )
        .await
        .unwrap();
    assert_eq!(client.list_history(table_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_disconnect_fails_calls_and_goes_offline() {
    let (_server, url) = start_test_server().await;
    let connectivity = Arc::new(ConnectivityMonitor::new(false));
    let client = RemoteAuthority::with_connectivity(&url, connectivity.clone());

    client.connect().await.unwrap();
    assert!(connectivity.is_online());

    client.disconnect().await;
    assert!(!connectivity.is_online());
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    assert!(client.list_cells(Uuid::new_v4()).await.unwrap_err().is_transport());
}

#[tokio::test]
async fn test_sessions_sync_through_server_after_reconnect() {
    let (server, url) = start_test_server().await;
    let table_id = Uuid::new_v4();

    let ana_online = Arc::new(ConnectivityMonitor::new(false));
    let ana_remote = Arc::new(RemoteAuthority::with_connectivity(&url, ana_online.clone()));
    ana_remote.connect().await.unwrap();
    let ana = TableSession::open(
        table_id,
        Uuid::new_v4(),
        "ana",
        Arc::new(MemoryStore::new()),
        ana_remote.clone(),
        ana_online.clone(),
        SessionConfig::for_testing(),
    )
    .await
    .unwrap();

    let bo_online = Arc::new(ConnectivityMonitor::new(false));
    let bo_remote = Arc::new(RemoteAuthority::with_connectivity(&url, bo_online.clone()));
    bo_remote.connect().await.unwrap();
    let bo = TableSession::open(
        table_id,
        Uuid::new_v4(),
        "bo",
        Arc::new(MemoryStore::new()),
        bo_remote.clone(),
        bo_online.clone(),
        SessionConfig::for_testing(),
    )
    .await
    .unwrap();
    sleep(Duration::from_millis(100)).await;

    // Ana loses the connection and keeps editing.
    ana_remote.disconnect().await;
    assert_eq!(ana.set_cell(0, 0, "offline edit").await.unwrap(), CommitResult::SavedOffline);
    assert!(matches!(bo.set_cell(1, 1, "bo online").await.unwrap(), CommitResult::Saved(_)));

    ana_remote.connect().await.unwrap();

    let mut converged = false;
    for _ in 0..100 {
        let a = ana.view().await;
        let b = bo.view().await;
        if ana.pending_count().await == 0
            && a.value(1, 1) == "bo online"
            && b.value(0, 0) == "offline edit"
        {
            converged = true;
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(converged, "both actors should see both edits");

    let stored = server.authority().get_cell(table_id, 0, 0).await.unwrap().unwrap();
    assert_eq!(stored.version, 2);

    ana.close().await.unwrap();
    bo.close().await.unwrap();
}
