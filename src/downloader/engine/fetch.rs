//! Fetch tasks and their results

use super::Engine;
use crate::decoder::DecodeJob;
use crate::error::FetchError;
use crate::queue::Dispatch;
use crate::servers::Lease;
use crate::types::{ArticleId, Event};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What a connection brought back
pub(super) enum Payload {
    /// Article body
    Body(Vec<u8>),
    /// Pre-check: the article as served, for header inspection
    Headers(Vec<u8>),
}

/// A finished fetch, posted back to the loop with its connection
pub(in crate::downloader) struct FetchDone {
    lease: Lease,
    dispatch: Dispatch,
    /// A fresh session was opened for this fetch
    connected: bool,
    result: Result<Payload, FetchError>,
}

/// Fetch one article over a leased connection
pub(super) async fn run(
    mut lease: Lease,
    dispatch: Dispatch,
    tx: mpsc::UnboundedSender<FetchDone>,
    cancel: CancellationToken,
) {
    let (connected, result) = tokio::select! {
        _ = cancel.cancelled() => return,
        outcome = fetch(&mut lease, &dispatch) => outcome,
    };
    tx.send(FetchDone {
        lease,
        dispatch,
        connected,
        result,
    })
    .ok();
}

async fn fetch(lease: &mut Lease, dispatch: &Dispatch) -> (bool, Result<Payload, FetchError>) {
    let mut connected = false;
    if lease.conn.needs_connect() {
        if let Err(e) = lease.conn.connect(&lease.config).await {
            return (false, Err(e));
        }
        connected = true;
    }
    let result = if dispatch.precheck {
        lease
            .conn
            .check(&dispatch.message_id)
            .await
            .map(Payload::Headers)
    } else {
        lease
            .conn
            .fetch_body(&dispatch.message_id)
            .await
            .map(Payload::Body)
    };
    (connected, result)
}

impl Engine {
    pub(super) async fn on_fetch(&mut self, done: FetchDone) {
        let FetchDone {
            lease,
            dispatch,
            connected,
            result,
        } = done;
        self.in_flight = self.in_flight.saturating_sub(1);
        let now = Instant::now();
        let server = dispatch.server.clone();
        let job = dispatch.id.job.clone();

        if connected && let Some(pool) = self.servers.get_mut(&server) {
            pool.record_connect();
        }

        match result {
            Ok(payload) => {
                self.release(lease);
                let (Payload::Body(raw) | Payload::Headers(raw)) = payload;
                if let Some(signal) = self.meter.update(&server, raw.len() as u64, now) {
                    self.on_quota(signal);
                }
                if !self.is_live(&job) {
                    self.clear_fetcher(&dispatch.id);
                } else {
                    self.submit_decode(dispatch, raw).await;
                }
            }
            Err(error) => self.on_fetch_error(lease, &dispatch, error, now),
        }

        self.drain(&job).await;
    }

    fn release(&mut self, lease: Lease) {
        let server = lease.conn.server().clone();
        if let Some(pool) = self.servers.get_mut(&server) {
            pool.release_connection(lease);
        }
    }

    async fn submit_decode(&mut self, dispatch: Dispatch, raw: Vec<u8>) {
        let job = DecodeJob {
            id: dispatch.id,
            server: dispatch.server,
            raw,
            ctx: dispatch.ctx,
            force_disk: dispatch.force_disk,
        };
        if let Err(job) = self.decoder.submit(job).await {
            warn!(article = %job.id, "decoder is gone, dropping body");
            self.clear_fetcher(&job.id);
        }
    }

    fn on_fetch_error(&mut self, lease: Lease, dispatch: &Dispatch, error: FetchError, now: Instant) {
        let id = &dispatch.id;
        let server = &dispatch.server;
        self.release(lease);

        match error {
            FetchError::NotFoundHere => {
                debug!(article = %id, server = %server, "article not on server");
                self.tried_on(id, server);
            }
            FetchError::Removed(reason) => {
                info!(article = %id, server = %server, reason = %reason, "article removed by server");
                self.tried_on(id, server);
                self.emit(Event::ArticleRemoved {
                    article: id.clone(),
                    server: server.clone(),
                });
            }
            FetchError::TransportFailure(reason) => {
                warn!(article = %id, server = %server, reason = %reason, "fetch failed");
                if let Some(pool) = self.servers.get_mut(server) {
                    let wait = pool.record_failure(now);
                    debug!(server = %server, backoff = ?wait, "server backing off");
                }
                let max_tries = self.config.download.max_art_tries;
                if let Some(article) = self.article_mut(id) {
                    article.fetcher = None;
                    article.tries += 1;
                    if article.tries >= max_tries {
                        article.tries = 0;
                        article.try_list.add(server);
                        debug!(article = %id, server = %server, "too many failures, trying other servers");
                    }
                }
            }
            FetchError::AuthRejected(reason) => {
                let message = format!("Server {server} rejected the login: {reason}");
                error!(server = %server, reason = %reason, "authentication rejected, disabling server");
                self.warnings.error(message.clone());
                if let Some(pool) = self.servers.get_mut(server) {
                    pool.disable(message);
                }
                self.clear_fetcher(id);
                self.emit(Event::ServerDisabled {
                    server: server.clone(),
                    reason,
                });
            }
        }
    }

    /// `server` has had its chance at the article
    pub(super) fn tried_on(&mut self, id: &ArticleId, server: &str) {
        if let Some(article) = self.article_mut(id) {
            article.fetcher = None;
            article.try_list.add(server);
            self.dirty.insert(id.job.clone());
        }
    }
}
