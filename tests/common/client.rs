//! HTTP client for end-to-end tests
//!
//! This module provides a high-level HTTP client that wraps reqwest
//! and provides methods for all receiver endpoints.
//!
//! When API routes or request formats change, update only this file.

#![allow(dead_code)]

use super::constants::*;
use reqwest::multipart::{Form, Part};
use reqwest::Response;
use serde_json::Value;
use std::time::Duration;

/// HTTP test client
pub struct TestClient {
    /// The underlying reqwest client (public for custom requests in tests)
    pub client: reqwest::Client,
    /// The base URL of the test server
    pub base_url: String,
}

impl TestClient {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("Failed to build reqwest client");

        Self { client, base_url }
    }

    // ========================================================================
    // Upload Endpoints
    // ========================================================================

    /// POST /upload with a raw body, filename in Content-Disposition
    pub async fn upload_raw(&self, filename: &str, content_type: &str, body: Vec<u8>) -> Response {
        self.client
            .post(format!("{}/upload", self.base_url))
            .header("content-type", content_type)
            .header(
                "content-disposition",
                format!("attachment; filename=\"{}\"", filename),
            )
            .body(body)
            .send()
            .await
            .expect("Upload request failed")
    }

    /// POST /upload with a raw body and a client-chosen session id
    pub async fn upload_raw_with_id(
        &self,
        session_id: &str,
        filename: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Response {
        self.client
            .post(format!("{}/upload", self.base_url))
            .header("content-type", content_type)
            .header(
                "content-disposition",
                format!("attachment; filename=\"{}\"", filename),
            )
            .header(UPLOAD_ID_HEADER, session_id)
            .body(body)
            .send()
            .await
            .expect("Upload request failed")
    }

    /// POST /upload with a raw body and no filename at all
    pub async fn upload_unnamed(&self, content_type: &str, body: Vec<u8>) -> Response {
        self.client
            .post(format!("{}/upload", self.base_url))
            .header("content-type", content_type)
            .body(body)
            .send()
            .await
            .expect("Upload request failed")
    }

    /// POST /upload with a declared size that may not match the body
    pub async fn upload_with_declared_size(
        &self,
        filename: &str,
        declared_size: u64,
        body: Vec<u8>,
    ) -> Response {
        self.client
            .post(format!("{}/upload?filename={}", self.base_url, filename))
            .header("content-type", "application/octet-stream")
            .header(UPLOAD_SIZE_HEADER, declared_size.to_string())
            .body(body)
            .send()
            .await
            .expect("Upload request failed")
    }

    /// POST /upload as multipart/form-data with the file in `field_name`
    pub async fn upload_multipart(
        &self,
        field_name: &str,
        filename: &str,
        mime: &str,
        body: Vec<u8>,
    ) -> Response {
        let part = Part::bytes(body)
            .file_name(filename.to_string())
            .mime_str(mime)
            .expect("Invalid mime type");
        let form = Form::new()
            .text("device", "test-phone")
            .part(field_name.to_string(), part);

        self.client
            .post(format!("{}/upload", self.base_url))
            .multipart(form)
            .send()
            .await
            .expect("Multipart upload request failed")
    }

    /// GET /upload/{session_id}
    pub async fn get_upload(&self, session_id: &str) -> Response {
        self.client
            .get(format!("{}/upload/{}", self.base_url, session_id))
            .send()
            .await
            .expect("Get upload request failed")
    }

    /// GET /uploads
    pub async fn list_uploads(&self) -> Response {
        self.client
            .get(format!("{}/uploads", self.base_url))
            .send()
            .await
            .expect("List uploads request failed")
    }

    /// Polls a session until `done` accepts it or the conversion timeout passes
    pub async fn wait_for_session<F>(&self, session_id: &str, done: F) -> Value
    where
        F: Fn(&Value) -> bool,
    {
        let start = std::time::Instant::now();
        loop {
            let session: Value = self
                .get_upload(session_id)
                .await
                .json()
                .await
                .expect("Session is not JSON");
            if done(&session) {
                return session;
            }
            if start.elapsed() > Duration::from_millis(CONVERSION_TIMEOUT_MS) {
                panic!("Session {} did not settle: {}", session_id, session);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    // ========================================================================
    // Other Endpoints
    // ========================================================================

    /// GET /asset/{fingerprint}
    pub async fn get_asset(&self, fingerprint: &str) -> Response {
        self.client
            .get(format!("{}/asset/{}", self.base_url, fingerprint))
            .send()
            .await
            .expect("Get asset request failed")
    }

    /// GET /setup
    pub async fn setup(&self) -> Response {
        self.client
            .get(format!("{}/setup", self.base_url))
            .send()
            .await
            .expect("Setup request failed")
    }

    /// GET /
    pub async fn home(&self) -> Response {
        self.client
            .get(format!("{}/", self.base_url))
            .send()
            .await
            .expect("Home request failed")
    }
}
