//! Exercises the asset fetcher against a local HTTP origin.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{extract::Path, extract::State, http::StatusCode, routing::get, Router};
use kswings::assets::{AssetFetcher, InstallScript};

async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn download_writes_the_body_to_disk() {
    let addr = serve(Router::new().route("/asset.txt", get(|| async { "payload" }))).await;
    let dir = tempfile::tempdir().unwrap();

    let fetcher = AssetFetcher::new();
    let path = fetcher
        .download_file(&format!("http://{addr}/asset.txt"), dir.path(), "asset.txt")
        .await
        .unwrap();

    assert_eq!(std::fs::read_to_string(path).unwrap(), "payload");
}

#[tokio::test]
async fn download_retries_failed_attempts() {
    let hits = Arc::new(AtomicUsize::new(0));
    let router = Router::new()
        .route(
            "/flaky",
            get(|State(hits): State<Arc<AtomicUsize>>| async move {
                if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                    (StatusCode::INTERNAL_SERVER_ERROR, "not yet")
                } else {
                    (StatusCode::OK, "recovered")
                }
            }),
        )
        .with_state(hits.clone());
    let addr = serve(router).await;
    let dir = tempfile::tempdir().unwrap();

    let fetcher = AssetFetcher::new();
    let path = fetcher
        .download_file(&format!("http://{addr}/flaky"), dir.path(), "flaky.txt")
        .await
        .unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(std::fs::read_to_string(path).unwrap(), "recovered");
}

#[tokio::test]
async fn download_gives_up_after_three_attempts() {
    let hits = Arc::new(AtomicUsize::new(0));
    let router = Router::new()
        .route(
            "/gone",
            get(|State(hits): State<Arc<AtomicUsize>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                StatusCode::NOT_FOUND
            }),
        )
        .with_state(hits.clone());
    let addr = serve(router).await;
    let dir = tempfile::tempdir().unwrap();

    let fetcher = AssetFetcher::new();
    let err = fetcher
        .download_file(&format!("http://{addr}/gone"), dir.path(), "gone.txt")
        .await
        .unwrap_err();

    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert!(err.to_string().contains("404"));
    assert!(!dir.path().join("gone.txt").exists());
}

#[tokio::test]
async fn install_scripts_substitute_uri_variables_and_keep_going() {
    let router = Router::new().route(
        "/pkg/{name}",
        get(|Path(name): Path<String>| async move { name }),
    );
    let addr = serve(router).await;
    let dir = tempfile::tempdir().unwrap();

    let scripts = vec![
        InstallScript {
            uri: format!("http://{addr}/missing/{{{{NAME}}}}"),
            path: "broken.sh".to_string(),
        },
        InstallScript {
            uri: format!("http://{addr}/pkg/{{{{NAME}}}}.sh"),
            path: "scripts/install.sh".to_string(),
        },
    ];
    let mut variables = HashMap::new();
    variables.insert("NAME".to_string(), "svc".to_string());

    let fetcher = AssetFetcher::new();
    fetcher
        .download_install_scripts(&scripts, dir.path(), &variables)
        .await;

    // The first script 404s and is skipped; the second still lands
    assert!(!dir.path().join("broken.sh").exists());
    let body = std::fs::read_to_string(dir.path().join("scripts/install.sh")).unwrap();
    assert_eq!(body, "svc.sh");
}
