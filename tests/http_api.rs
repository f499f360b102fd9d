//! HTTP surface tests driven through axum-test

mod common;

use axum::http::StatusCode;
use axum_test::multipart::{MultipartForm, Part};
use axum_test::TestServer;
use serde_json::Value;

use common::*;
use toolora::server::router;

const MAX_REQUEST: u64 = 16 * 1024 * 1024;

fn server(dir: &std::path::Path) -> TestServer {
    let (state, _) = services(dir);
    TestServer::new(router(state, MAX_REQUEST)).unwrap()
}

fn pdf_part(name: &str, pages: u32, width: i64) -> Part {
    Part::bytes(pdf_with_pages(pages, width).to_vec())
        .file_name(name)
        .mime_type("application/pdf")
}

#[tokio::test]
async fn test_list_tools_and_health() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(dir.path());

    let tools: Vec<Value> = server.get("/api/tools").await.json();
    assert_eq!(tools.len(), 27);
    assert!(tools.iter().any(|t| t["id"] == "pdf-merge" && t["category"] == "pdf"));

    let health: Value = server.get("/health").await.json();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["tools"], 27);
    assert_eq!(health["video_workers"]["capacity"], 2);
}

#[tokio::test]
async fn test_merge_upload_then_download() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(dir.path());

    let form = MultipartForm::new()
        .add_part("files", pdf_part("a.pdf", 2, 100))
        .add_part("files", pdf_part("b.pdf", 1, 200));
    let response = server.post("/api/tools/pdf-merge").multipart(form).await;
    response.assert_status_ok();

    let body: Value = response.json();
    assert_eq!(body["success"], true);
    assert_eq!(body["tool_id"], "pdf-merge");
    assert_eq!(body["files"].as_array().unwrap().len(), 1);
    let url = body["download_url"].as_str().unwrap().to_string();

    let download = server.get(&url).await;
    download.assert_status_ok();
    assert_eq!(download.header("content-type"), "application/pdf");
    assert_eq!(
        download.header("content-disposition"),
        "attachment; filename=\"merged_a.pdf\""
    );
    assert_eq!(page_widths(download.as_bytes()), vec![100, 101, 200]);

    let again = server.get(&url).await;
    assert_eq!(again.as_bytes(), download.as_bytes());
}

#[tokio::test]
async fn test_form_fields_become_options() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(dir.path());

    let form = MultipartForm::new()
        .add_text("options", r#"{"case": "lower", "text": "ignored"}"#)
        .add_text("text", "Hello World")
        .add_text("case", "upper");
    let response = server.post("/api/tools/text-case-converter").multipart(form).await;
    response.assert_status_ok();

    let body: Value = response.json();
    assert_eq!(body["result"]["text"], "HELLO WORLD");
}

#[tokio::test]
async fn test_client_errors() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(dir.path());

    let unknown = server
        .post("/api/tools/pdf-to-word")
        .multipart(MultipartForm::new().add_part("file", pdf_part("a.pdf", 1, 100)))
        .await;
    unknown.assert_status(StatusCode::NOT_FOUND);

    let wrong_type = server
        .post("/api/tools/pdf-compress")
        .multipart(
            MultipartForm::new().add_part("file", Part::bytes(b"#!/bin/sh".to_vec()).file_name("run.sh")),
        )
        .await;
    wrong_type.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = wrong_type.json();
    assert_eq!(body["success"], false);
    assert_eq!(body["kind"], "InvalidInput");

    let bad_options = server
        .post("/api/tools/text-case-converter")
        .multipart(MultipartForm::new().add_text("options", "[1, 2]"))
        .await;
    bad_options.assert_status(StatusCode::BAD_REQUEST);

    assert_eq!(count_files(&dir.path().join("uploads")), 0);
}

#[tokio::test]
async fn test_download_unknown_or_traversal() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(dir.path());

    server
        .get("/api/download/00000000000000000000000000000000")
        .await
        .assert_status(StatusCode::NOT_FOUND);
    server
        .get("/api/download/..%2F..%2Fetc%2Fpasswd")
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_metrics_count_requests() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(dir.path());

    let form = MultipartForm::new().add_text("text", "abc");
    server
        .post("/api/tools/text-case-converter")
        .multipart(form)
        .await
        .assert_status_ok();

    let metrics: Value = server.get("/api/metrics").await.json();
    assert_eq!(metrics["total_requests"], 1);
    assert_eq!(metrics["successful_requests"], 1);
}
