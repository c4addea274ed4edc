//! End-to-end tests for background conversion of QuickTime videos
//!
//! A shell script stands in for ffmpeg: it answers `-version` and copies the
//! input to the output path, so the pipeline runs without a real encoder.

#![cfg(unix)]

mod common;

use common::{TestClient, TestServer, TestServerOptions, JPEG_BYTES, MOV_BYTES};
use reqwest::StatusCode;
use serde_json::Value;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Copies `-i <input>` to the last argument, like a lossless ffmpeg run
const COPYING_TRANSCODER: &str = r#"#!/bin/sh
if [ "$1" = "-version" ]; then
    echo "fake ffmpeg"
    exit 0
fi
for last; do :; done
cp "$4" "$last"
"#;

/// Starts fine but fails every conversion
const FAILING_TRANSCODER: &str = r#"#!/bin/sh
if [ "$1" = "-version" ]; then
    exit 0
fi
echo "Invalid data found when processing input" >&2
exit 1
"#;

fn write_script(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

async fn spawn_with_transcoder(ffmpeg_path: PathBuf) -> TestServer {
    TestServer::spawn_with(TestServerOptions {
        ffmpeg_path: Some(ffmpeg_path),
        ..Default::default()
    })
    .await
}

fn conversion_settled(session: &Value) -> bool {
    matches!(
        session["conversion"].as_str(),
        Some("SUCCEEDED") | Some("FAILED")
    )
}

#[tokio::test]
async fn test_mov_is_converted() {
    let scripts = TempDir::new().unwrap();
    let ffmpeg = write_script(scripts.path(), "ffmpeg", COPYING_TRANSCODER);
    let server = spawn_with_transcoder(ffmpeg).await;
    let client = TestClient::new(server.base_url.clone());

    let response = client
        .upload_raw_with_id("movie", "IMG_0007.MOV", "video/quicktime", MOV_BYTES.to_vec())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let upload: Value = response.json().await.unwrap();
    // The original is stored before the conversion runs
    assert_eq!(upload["status"], "DONE");
    assert_eq!(upload["asset"]["media_kind"], "PROPRIETARY_VIDEO");
    assert_eq!(upload["asset"]["conversion_needed"], true);
    assert_eq!(upload["conversion"], "PENDING");

    let session = client.wait_for_session("movie", conversion_settled).await;
    assert_eq!(session["conversion"], "SUCCEEDED", "{}", session);
    assert_eq!(session["status"], "DONE");

    assert_eq!(
        server.stored_file_names(),
        vec!["IMG_0007.MOV", "IMG_0007.mp4"]
    );
    let converted = std::fs::read(server.storage_dir.join("IMG_0007.mp4")).unwrap();
    assert_eq!(converted, MOV_BYTES);

    let fingerprint = upload["asset"]["fingerprint"].as_str().unwrap();
    let asset: Value = client.get_asset(fingerprint).await.json().await.unwrap();
    assert_eq!(asset["converted_filename"], "IMG_0007.mp4");
}

#[tokio::test]
async fn test_failed_conversion_keeps_original() {
    let scripts = TempDir::new().unwrap();
    let ffmpeg = write_script(scripts.path(), "ffmpeg", FAILING_TRANSCODER);
    let server = spawn_with_transcoder(ffmpeg).await;
    let client = TestClient::new(server.base_url.clone());

    let response = client
        .upload_raw_with_id("broken", "clip.mov", "video/quicktime", MOV_BYTES.to_vec())
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let session = client.wait_for_session("broken", conversion_settled).await;
    assert_eq!(session["conversion"], "FAILED");
    assert_eq!(session["status"], "DONE");
    assert!(session["conversion_error"]
        .as_str()
        .unwrap()
        .contains("Invalid data"));

    assert_eq!(server.stored_file_names(), vec!["clip.mov"]);
    assert_eq!(
        server.coordinator.store().scratch().entry_count().await.unwrap(),
        0
    );
}

#[tokio::test]
async fn test_missing_transcoder_fails_conversion_only() {
    let scripts = TempDir::new().unwrap();
    let server = spawn_with_transcoder(scripts.path().join("no-such-ffmpeg")).await;
    let client = TestClient::new(server.base_url.clone());

    let response = client
        .upload_raw_with_id("no-tool", "clip.mov", "video/quicktime", MOV_BYTES.to_vec())
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let session = client.wait_for_session("no-tool", conversion_settled).await;
    assert_eq!(session["conversion"], "FAILED");
    assert_eq!(session["status"], "DONE");
    assert!(session["conversion_error"]
        .as_str()
        .unwrap()
        .contains("not available"));
    assert_eq!(server.stored_file_names(), vec!["clip.mov"]);
}

#[tokio::test]
async fn test_photos_are_not_converted() {
    let scripts = TempDir::new().unwrap();
    let ffmpeg = write_script(scripts.path(), "ffmpeg", COPYING_TRANSCODER);
    let server = spawn_with_transcoder(ffmpeg).await;
    let client = TestClient::new(server.base_url.clone());

    let upload: Value = client
        .upload_raw_with_id("photo", "IMG_0001.jpg", "image/jpeg", JPEG_BYTES.to_vec())
        .await
        .json()
        .await
        .unwrap();
    assert!(upload.get("conversion").is_none());

    let session: Value = client.get_upload("photo").await.json().await.unwrap();
    assert_eq!(session["status"], "DONE");
    assert!(session.get("conversion").is_none());
}

#[tokio::test]
async fn test_conversion_disabled_stores_mov_as_is() {
    let server = TestServer::spawn().await;
    let client = TestClient::new(server.base_url.clone());

    let upload: Value = client
        .upload_raw_with_id("plain", "IMG_0008.mov", "video/quicktime", MOV_BYTES.to_vec())
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(upload["status"], "DONE");
    assert_eq!(upload["asset"]["conversion_needed"], true);
    assert!(upload.get("conversion").is_none());

    let session: Value = client.get_upload("plain").await.json().await.unwrap();
    assert_eq!(session["status"], "DONE");
    assert_eq!(server.stored_file_names(), vec!["IMG_0008.mov"]);
}
