//! Drives the public router directly (no real socket) to exercise the
//! discovery document rewrite end to end.

use std::path::PathBuf;
use std::sync::Arc;

use http_body_util::BodyExt;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use loolwsd_rs::config::Config;
use loolwsd_rs::context::AppContext;
use loolwsd_rs::endpoints::public;
use loolwsd_rs::supervisor::SupervisorLink;

fn test_config(fileserverroot: PathBuf) -> Config {
    Config {
        port: 9980,
        cache: None,
        systemplate: fileserverroot.clone(),
        lotemplate: fileserverroot.clone(),
        childroot: fileserverroot.clone(),
        losubpath: "lo".into(),
        fileserverroot: Some(fileserverroot),
        numprespawns: 1,
        test: true,
        supervisor_bin: None,
    }
}

#[tokio::test]
async fn discovery_document_gets_rewritten_with_the_advertised_host() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(
        tmp.path().join("discovery.xml"),
        r#"<wopi-discovery><net-zone name="external-http"><app name="writer">
<action ext="odt" name="edit" urlsrc=""/>
</app></net-zone></wopi-discovery>"#,
    )
    .unwrap();

    let ctx = Arc::new(AppContext::new(
        test_config(tmp.path().to_path_buf()),
        Arc::new(SupervisorLink::disconnected()),
        CancellationToken::new(),
    ));
    let router = public::router(ctx);

    let request = axum::http::Request::builder()
        .uri("/hosting/discovery")
        .header("host", "editor.example:9980")
        .body(axum::body::Body::empty())
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains(r#"urlsrc="https://editor.example:9980/loleaflet/dist/loleaflet.html?""#));
}

#[tokio::test]
async fn admin_websocket_route_is_a_stub() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = Arc::new(AppContext::new(
        test_config(tmp.path().to_path_buf()),
        Arc::new(SupervisorLink::disconnected()),
        CancellationToken::new(),
    ));
    let router = public::router(ctx);

    let request = axum::http::Request::builder()
        .uri("/adminws")
        .body(axum::body::Body::empty())
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::NOT_IMPLEMENTED);
}
