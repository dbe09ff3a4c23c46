//! S3 gateway library.
//!
//! The crate is organised around one business-logic layer,
//! [`service::Gateway`], which sits on top of the metadata repository and
//! the blob store.  Two thin adapters expose it: the S3 REST/XML surface
//! in [`server`] and [`handlers`], and the JSON surface in [`rpc`].

use std::sync::Arc;

pub mod auth;
pub mod config;
pub mod cors;
pub mod errors;
pub mod handlers;
pub mod metadata;
pub mod multipart;
pub mod policy;
pub mod rpc;
pub mod server;
pub mod service;
pub mod storage;
pub mod xml;

use crate::config::Config;
use crate::metadata::store::MetadataStore;
use crate::service::Gateway;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Loaded configuration.
    pub config: Config,
    /// Metadata repository; the auth middleware reads credentials from it.
    pub metadata: Arc<dyn MetadataStore>,
    /// Business-logic layer shared by both adapters.
    pub gateway: Gateway,
}
