//! Integration tests for the durable delta log: seeding, replay after
//! eviction, compaction, restart against the same store, and write-back.

use overtex_collab::auth::{Permission, StaticAuth};
use overtex_collab::client::{CollabClient, DocumentHandle, FileBinding};
use overtex_collab::hydration::DiskFileStore;
use overtex_collab::server::{Collaborators, ServerConfig, SyncServer};
use overtex_collab::storage::{DeltaLog, DocumentStore, StoreConfig};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::time::{sleep, Duration, Instant};

const MAIN_TEX: &str = "\\begin{document}\\end{document}";

struct Fixture {
    projects: TempDir,
    _db_dir: TempDir,
    store: Arc<DocumentStore>,
}

impl Fixture {
    fn log(&self) -> Option<Arc<dyn DeltaLog>> {
        Some(self.store.clone() as Arc<dyn DeltaLog>)
    }
}

fn fixture() -> Fixture {
    let projects = tempfile::tempdir().unwrap();
    let root = projects.path().join("P1");
    std::fs::create_dir_all(root.join("chapters")).unwrap();
    std::fs::write(root.join("main.tex"), MAIN_TEX).unwrap();
    std::fs::write(root.join("chapters/intro.tex"), "\\section{Intro}\n").unwrap();

    let db_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(DocumentStore::open(StoreConfig::for_testing(db_dir.path())).unwrap());
    Fixture { projects, _db_dir: db_dir, store }
}

async fn start_test_server(root: &Path, log: Option<Arc<dyn DeltaLog>>) -> (u16, Arc<SyncServer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let auth = Arc::new(
        StaticAuth::new(root)
            .with_token("tok-ada", "u1", "ada@example.com")
            .with_grant("u1", "P1", Permission::Owner),
    );
    let collaborators = Collaborators {
        verifier: auth.clone(),
        resolver: auth,
        files: Arc::new(DiskFileStore),
    };
    let server = Arc::new(SyncServer::with_log(ServerConfig::default(), collaborators, log));
    tokio::spawn(Arc::clone(&server).serve(listener));
    (port, server)
}

async fn open(port: u16) -> DocumentHandle {
    CollabClient::new(format!("ws://127.0.0.1:{port}"))
        .with_token("tok-ada")
        .with_name("Ada")
        .open("P1", Some("main.tex"))
        .await
        .unwrap()
}

async fn synced(handle: &DocumentHandle, file: &str) -> FileBinding {
    let binding = handle.bind_file(file).await.unwrap();
    binding.wait_synced(Duration::from_secs(3)).await.unwrap();
    binding
}

async fn wait_for_server_text(server: &SyncServer, file: &str, expected: &str) {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let text = server.registry().current_text("P1", file).await;
        if text.as_deref() == Some(expected) {
            return;
        }
        assert!(Instant::now() < deadline, "expected {expected:?}, got {text:?}");
        sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_evicted(server: &SyncServer) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while server.registry().contains("P1").await {
        assert!(Instant::now() < deadline, "P1 still live");
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_hydration_seeds_are_logged() {
    let fx = fixture();
    let (port, _server) = start_test_server(fx.projects.path(), fx.log()).await;

    let handle = open(port).await;
    synced(&handle, "main.tex").await;

    let mut files: Vec<String> = fx.store.load("P1").unwrap().into_iter().map(|d| d.file).collect();
    files.sort();
    assert_eq!(files, vec!["chapters/intro.tex".to_string(), "main.tex".to_string()]);
}

#[tokio::test]
async fn test_log_wins_over_disk_after_eviction() {
    let fx = fixture();
    let (port, server) = start_test_server(fx.projects.path(), fx.log()).await;

    let ada = open(port).await;
    let main = synced(&ada, "main.tex").await;
    main.insert(16, "Hello").await.unwrap();
    let edited = "\\begin{document}Hello\\end{document}";
    wait_for_server_text(&server, "main.tex", edited).await;

    ada.close().await.unwrap();
    wait_for_evicted(&server).await;

    // The disk copy drifts while nobody is connected
    std::fs::write(fx.projects.path().join("P1/main.tex"), "stale").unwrap();

    let again = open(port).await;
    let main = synced(&again, "main.tex").await;
    assert_eq!(main.text().await, edited);
}

#[tokio::test]
async fn test_eviction_compacts_log() {
    let fx = fixture();
    let (port, server) = start_test_server(fx.projects.path(), fx.log()).await;

    let ada = open(port).await;
    let main = synced(&ada, "main.tex").await;
    for i in 0..5 {
        main.insert(16, &i.to_string()).await.unwrap();
    }
    wait_for_server_text(&server, "main.tex", "\\begin{document}43210\\end{document}").await;
    let before = fx.store.load_metadata("P1").unwrap();
    assert!(before.delta_count >= 7);

    ada.close().await.unwrap();
    wait_for_evicted(&server).await;

    let after = fx.store.load_metadata("P1").unwrap();
    assert_eq!(after.delta_count, 0);
    assert_eq!(after.snapshot_files, 2);

    let replayed = fx.store.load("P1").unwrap();
    assert!(replayed.iter().all(|d| d.seq == 0));
}

#[tokio::test]
async fn test_restart_replays_from_store() {
    let fx = fixture();
    let edited = "% draft\n\\begin{document}\\end{document}";
    {
        let (port, server) = start_test_server(fx.projects.path(), fx.log()).await;
        let ada = open(port).await;
        let main = synced(&ada, "main.tex").await;
        main.insert(0, "% draft\n").await.unwrap();
        wait_for_server_text(&server, "main.tex", edited).await;
        // The second server shares nothing with the first but the store
    }

    std::fs::remove_file(fx.projects.path().join("P1/main.tex")).unwrap();
    let (port, _server) = start_test_server(fx.projects.path(), fx.log()).await;
    let again = open(port).await;
    let main = synced(&again, "main.tex").await;
    assert_eq!(main.text().await, edited);
    let intro = synced(&again, "chapters/intro.tex").await;
    assert_eq!(intro.text().await, "\\section{Intro}\n");
}

#[tokio::test]
async fn test_without_log_rehydration_is_idempotent() {
    let fx = fixture();
    let (port, server) = start_test_server(fx.projects.path(), None).await;

    let first = open(port).await;
    let first_text = synced(&first, "main.tex").await.text().await;
    first.close().await.unwrap();
    wait_for_evicted(&server).await;

    let second = open(port).await;
    let second_text = synced(&second, "main.tex").await.text().await;
    assert_eq!(first_text, second_text);
    assert_eq!(second_text, MAIN_TEX);
}

#[tokio::test]
async fn test_write_back_saves_merged_text() {
    let fx = fixture();
    let (port, server) = start_test_server(fx.projects.path(), None).await;

    let ada = open(port).await;
    let intro = synced(&ada, "chapters/intro.tex").await;
    intro.replace("\\section{Introduction}\n").await.unwrap();
    wait_for_server_text(&server, "chapters/intro.tex", "\\section{Introduction}\n").await;

    // Live edits never reach disk on their own
    let on_disk = std::fs::read_to_string(fx.projects.path().join("P1/chapters/intro.tex")).unwrap();
    assert_eq!(on_disk, "\\section{Intro}\n");

    server.registry().write_back("P1", "chapters/intro.tex").await.unwrap();
    let on_disk = std::fs::read_to_string(fx.projects.path().join("P1/chapters/intro.tex")).unwrap();
    assert_eq!(on_disk, "\\section{Introduction}\n");
}
