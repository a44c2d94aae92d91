//! gridsync-sim: two actors sharing a grid through a local authority server.
//!
//! Starts an [`AuthorityServer`] on a free port, connects two sessions over
//! WebSocket, takes one of them offline for a burst of edits and lets the
//! sync engine reconcile when it comes back. Each actor keeps its durable
//! cache in its own RocksDB directory under the system temp dir, removed on
//! exit. Run with `RUST_LOG=info` (or `debug`) to watch the pipeline.

use log::info;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use gridsync_collab::{
    storage::table_key, AuthorityServer, ConnectivityMonitor, GridView, RemoteAuthority,
    ServerConfig, SessionConfig, SessionEvent, StoreConfig, TableSession, TableStore,
};
use uuid::Uuid;

struct SimActor {
    name: &'static str,
    remote: Arc<RemoteAuthority>,
    store: Arc<TableStore>,
    data_dir: PathBuf,
    session: TableSession,
}

async fn join(
    name: &'static str,
    url: &str,
    table_id: Uuid,
) -> Result<SimActor, Box<dyn Error>> {
    let connectivity = Arc::new(ConnectivityMonitor::new(false));
    let remote = Arc::new(RemoteAuthority::with_connectivity(url, connectivity.clone()));
    remote.connect().await?;
    let data_dir = std::env::temp_dir().join(format!("gridsync-sim-{name}-{}", Uuid::new_v4()));
    let store = Arc::new(TableStore::open(StoreConfig {
        path: data_dir.clone(),
        ..StoreConfig::default()
    })?);
    info!("[{name}] local cache at {}", data_dir.display());
    let mut session = TableSession::open(
        table_id,
        Uuid::new_v4(),
        name,
        store.clone(),
        remote.clone(),
        connectivity,
        SessionConfig::default(),
    )
    .await?;
    if let Some(events) = session.take_event_rx() {
        tokio::spawn(log_events(name, events));
    }
    Ok(SimActor {
        name,
        remote,
        store,
        data_dir,
        session,
    })
}

async fn log_events(name: &'static str, mut events: mpsc::Receiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        info!("[{name}] {event:?}");
    }
}

fn render(name: &str, view: &GridView) {
    info!("[{name}] grid {}x{}", view.size.rows, view.size.cols);
    for cell in view.cells() {
        let marker = if view.is_pending(cell.row, cell.col) { " (pending)" } else { "" };
        info!("[{name}]   ({}, {}) v{} = {:?}{marker}", cell.row, cell.col, cell.version, cell.value);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("ws://{}", listener.local_addr()?);
    let server = Arc::new(AuthorityServer::new(ServerConfig::default()));
    let serving = server.clone();
    tokio::spawn(async move {
        if let Err(e) = serving.serve(listener).await {
            log::error!("Authority server stopped: {e}");
        }
    });
    info!("Authority listening on {url}");

    let table_id = Uuid::new_v4();
    let ana = join("ana", &url, table_id).await?;
    let bo = join("bo", &url, table_id).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    ana.session.set_cell(0, 0, "Name").await?;
    ana.session.set_cell(0, 1, "Qty").await?;
    bo.session.set_cell(1, 0, "Bolts").await?;
    bo.session.set_cell(1, 1, "40").await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    info!("[{}] goes offline", ana.name);
    ana.remote.disconnect().await;
    ana.session.set_cell(1, 1, "45").await?;
    ana.session.set_cell(2, 0, "Nuts").await?;
    tokio::time::sleep(Duration::from_millis(10)).await;
    // Bo edits the same cell later, so Bo's value wins on reconcile.
    bo.session.set_cell(1, 1, "50").await?;

    info!("[{}] reconnects", ana.name);
    ana.remote.connect().await?;
    tokio::time::sleep(Duration::from_secs(3)).await;

    for actor in [&ana, &bo] {
        render(actor.name, &actor.session.view().await);
    }
    for entry in ana.session.history().await? {
        info!(
            "history ({}, {}): {:?} -> {:?}",
            entry.row, entry.col, entry.old_value, entry.new_value
        );
    }
    info!("Server stats: {:?}", server.stats().await);

    for actor in [ana, bo] {
        actor.session.close().await?;
        let meta = actor.store.load_metadata(&table_key(actor.session.table_id()))?;
        info!(
            "[{}] cached {} cells, {} pending, {} -> {} bytes on disk",
            actor.name, meta.cell_count, meta.pending_count, meta.snapshot_size, meta.compressed_size
        );
        let data_dir = actor.data_dir.clone();
        drop(actor);
        if let Err(e) = std::fs::remove_dir_all(&data_dir) {
            log::warn!("Removing {} failed: {e}", data_dir.display());
        }
    }
    Ok(())
}
