#![forbid(unsafe_code)]

//! Backend for a small video-sharing site.
//!
//! The heart of the crate is the range-aware byte server behind
//! `GET /video/{filename}` ([`range`], [`media`], [`server::serve_media`]).
//! Around it sit the upload pipeline ([`upload`], [`probe`]), the SQLite
//! metadata store ([`metadata`]) and the start-up plumbing ([`config`],
//! [`telemetry`]) used by the `vidtoast-backend` binary.

pub mod config;
pub mod media;
pub mod metadata;
pub mod probe;
pub mod range;
pub mod server;
pub mod telemetry;
pub mod upload;
