//! Shared constants for end-to-end tests
//!
//! This module contains all constants used across the test suite.
//! When test payloads or timing change, update only this file.

#![allow(dead_code)]

// ============================================================================
// Test Payloads
// ============================================================================

/// Smallest thing that sniffs as a JPEG: SOI marker plus an APP0 header
pub const JPEG_BYTES: &[u8] = &[
    0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00, 0x01, 0x01, 0x00, 0x00,
    0x01, 0x00, 0x01, 0x00, 0x00, 0xFF, 0xD9,
];

/// PNG signature followed by an empty IHDR-sized tail
pub const PNG_BYTES: &[u8] = &[
    0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, b'I', b'H', b'D',
    b'R', 0x00, 0x00, 0x00, 0x01,
];

/// Stand-in for a QuickTime movie. Content only matters for fingerprinting.
pub const MOV_BYTES: &[u8] = b"\x00\x00\x00\x14ftypqt  \x00\x00\x00\x00qt  fake movie payload";

// ============================================================================
// Headers
// ============================================================================

pub const UPLOAD_ID_HEADER: &str = "x-upload-id";
pub const UPLOAD_SIZE_HEADER: &str = "x-upload-size";

// ============================================================================
// Timeouts
// ============================================================================

/// How long to wait for the server to accept requests
pub const SERVER_READY_TIMEOUT_MS: u64 = 5000;

/// Delay between readiness probes
pub const SERVER_READY_POLL_INTERVAL_MS: u64 = 10;

/// Per-request timeout for the test client
pub const REQUEST_TIMEOUT_SECS: u64 = 10;

/// How long to poll a session for a background conversion to settle
pub const CONVERSION_TIMEOUT_MS: u64 = 10_000;
