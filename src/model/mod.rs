//! In-memory job model: jobs own files, files own articles
//!
//! The tree is an arena addressed by [`ArticleId`](crate::types::ArticleId)
//! `(job, file index, article index)`. Only the scheduling loop mutates it;
//! workers carry ids and report outcomes.

mod article;
mod job;

pub use article::{Article, NzbFile};
pub use job::{Job, PreQueueResult};

use crate::types::ServerId;
use serde::{Deserialize, Serialize};

/// Servers that already failed to deliver an article.
///
/// Append-only until a server is (re-)enabled, which clears every list.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TryList(Vec<ServerId>);

impl TryList {
    /// Record a server; returns false when it was already listed
    pub fn add(&mut self, server: &str) -> bool {
        if self.contains(server) {
            return false;
        }
        self.0.push(server.to_string());
        true
    }

    /// Has `server` tried this article
    pub fn contains(&self, server: &str) -> bool {
        self.0.iter().any(|s| s == server)
    }

    /// Forget every server
    pub fn reset(&mut self) {
        self.0.clear();
    }

    /// Number of servers listed
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Nothing tried yet
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Listed servers in the order they failed
    pub fn iter(&self) -> impl Iterator<Item = &ServerId> {
        self.0.iter()
    }
}
