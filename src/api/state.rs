//! Shared handler state

use crate::{Config, UsenetDownloader};
use std::sync::Arc;

/// What every handler can reach: the downloader handle and the
/// configuration the server was started with
#[derive(Clone)]
pub struct AppState {
    /// Engine handle
    pub downloader: Arc<UsenetDownloader>,
    /// Startup configuration (bind address, CORS)
    pub config: Arc<Config>,
}

impl AppState {
    /// Bundle the downloader and its configuration
    pub fn new(downloader: Arc<UsenetDownloader>, config: Arc<Config>) -> Self {
        Self { downloader, config }
    }
}
