//! # Data Retrieval Module
//!
//! Generic HTTP retrieval used by the upstream client. Request building,
//! bearer authentication and transient-failure retries live here so the
//! ingestors only deal with endpoints and decoding.

/// Generic HTTP API client with retry middleware for resilient network requests.
pub mod ky_http;
