//! News servers and their connection pools
//!
//! [`ServerSet`] holds one [`ServerPool`] per configured server, ordered by
//! priority. It is owned by the scheduling loop; connections leave a pool as a
//! [`Lease`] for the duration of one fetch and come back through
//! [`ServerPool::release_connection`].

use crate::config::{ServerConfig, SslVerify};
use crate::error::Result;
use crate::model::TryList;
use crate::nntp::{Connection, ConnectionState};
use crate::retry::Backoff;
use crate::speed_limiter::SpeedLimiter;
use crate::types::{ServerId, ServerStatus};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A connection checked out of its pool for one fetch
pub struct Lease {
    /// The session (possibly not yet connected)
    pub conn: Connection,
    /// Server settings at checkout time
    pub config: Arc<ServerConfig>,
    generation: u64,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("conn", &self.conn)
            .field("generation", &self.generation)
            .finish()
    }
}

impl std::fmt::Debug for ServerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerPool")
            .field("id", &self.id)
            .field("enabled", &self.enabled)
            .field("idle", &self.idle.len())
            .field("leased", &self.leased)
            .finish()
    }
}

/// One configured server: credentials, limits and its connections
pub struct ServerPool {
    id: ServerId,
    config: Arc<ServerConfig>,
    enabled: bool,
    disabled_reason: Option<String>,
    idle: Vec<Connection>,
    leased: usize,
    backoff: Backoff,
    backoff_until: Option<Instant>,
    generation: u64,
    limiter: Option<SpeedLimiter>,
}

impl ServerPool {
    /// Build a pool; connections are opened lazily on first lease
    pub fn new(config: ServerConfig, limiter: Option<SpeedLimiter>) -> Result<Self> {
        if config.tls && config.ssl_verify != SslVerify::Strict {
            tracing::warn!(server = %config.id(), "certificate verification is disabled");
        }
        Ok(Self {
            id: config.id(),
            enabled: config.enabled,
            disabled_reason: (!config.enabled).then(|| "disabled in configuration".to_string()),
            backoff: Backoff::new(config.backoff.clone()),
            config: Arc::new(config),
            idle: Vec::new(),
            leased: 0,
            backoff_until: None,
            generation: 0,
            limiter,
        })
    }

    /// Server identity
    pub fn id(&self) -> &ServerId {
        &self.id
    }

    /// Current settings
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Priority rank (lower = preferred)
    pub fn priority(&self) -> i32 {
        self.config.priority
    }

    /// Backup servers are only used once every primary lacks an article
    pub fn is_backup(&self) -> bool {
        self.config.backup
    }

    /// Accepting new work
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Connections that exist right now (idle and leased)
    pub fn open_connections(&self) -> usize {
        self.idle.len() + self.leased
    }

    /// Connections currently leased to fetches
    pub fn busy_connections(&self) -> usize {
        self.leased
    }

    /// Can `acquire_connection` hand out a connection right now
    pub fn has_free_slot(&self, now: Instant) -> bool {
        if !self.enabled {
            return false;
        }
        if !self.idle.is_empty() {
            return true;
        }
        self.open_connections() < self.config.connections && !self.in_backoff(now)
    }

    fn in_backoff(&self, now: Instant) -> bool {
        self.backoff_until.is_some_and(|until| now < until)
    }

    /// Would the server carry an article posted at `posted_at`
    pub fn retains(&self, posted_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match (self.config.retention_days, posted_at) {
            (0, _) | (_, None) => true,
            (days, Some(posted)) => now - posted <= chrono::Duration::days(i64::from(days)),
        }
    }

    /// Hand out an idle connection, or a fresh unconnected one when under the limit
    pub fn acquire_connection(&mut self, now: Instant) -> Option<Lease> {
        if !self.enabled {
            return None;
        }
        let conn = match self.idle.pop() {
            Some(conn) => conn,
            None if self.open_connections() < self.config.connections && !self.in_backoff(now) => {
                Connection::new(self.id.clone(), self.limiter.clone())
            }
            None => return None,
        };
        self.leased += 1;
        Some(Lease {
            conn,
            config: Arc::clone(&self.config),
            generation: self.generation,
        })
    }

    /// Take a leased connection back. Dead, unused and stale connections are dropped.
    pub fn release_connection(&mut self, lease: Lease) {
        self.leased = self.leased.saturating_sub(1);
        let Lease {
            mut conn,
            generation,
            ..
        } = lease;
        if conn.state() != ConnectionState::Idle {
            return;
        }
        if generation != self.generation || !self.enabled {
            conn.close();
            return;
        }
        self.idle.push(conn);
    }

    /// A connect succeeded: forget accumulated backoff
    pub fn record_connect(&mut self) {
        if self.backoff.failures() > 0 {
            tracing::info!(server = %self.id, "server reachable again");
        }
        self.backoff.reset();
        self.backoff_until = None;
    }

    /// A connection died: hold off new connections for the next backoff delay
    pub fn record_failure(&mut self, now: Instant) -> Duration {
        let delay = self.backoff.fail();
        self.backoff_until = Some(now + delay);
        tracing::warn!(
            server = %self.id,
            delay_secs = delay.as_secs(),
            failures = self.backoff.failures(),
            "connection failed, backing off"
        );
        delay
    }

    /// Seconds of backoff left
    pub fn backoff_remaining(&self, now: Instant) -> Option<Duration> {
        self.backoff_until
            .and_then(|until| until.checked_duration_since(now))
    }

    /// Clear an elapsed backoff. Returns true when the server became usable.
    pub fn check_timers(&mut self, now: Instant) -> bool {
        match self.backoff_until {
            Some(until) if now >= until => {
                self.backoff_until = None;
                tracing::debug!(server = %self.id, "backoff elapsed");
                self.enabled
            }
            _ => false,
        }
    }

    /// Start accepting work again
    pub fn enable(&mut self) {
        self.enabled = true;
        self.disabled_reason = None;
        self.backoff.reset();
        self.backoff_until = None;
        tracing::info!(server = %self.id, "server enabled");
    }

    /// Stop accepting work; idle connections are closed
    pub fn disable(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(server = %self.id, reason = %reason, "server disabled");
        self.enabled = false;
        self.disabled_reason = Some(reason);
        self.close_idle();
    }

    /// Reload settings. Open connections are retired as they come back.
    pub fn update(&mut self, config: ServerConfig) -> Result<()> {
        self.backoff.reconfigure(config.backoff.clone());
        self.enabled = config.enabled;
        self.disabled_reason = (!config.enabled).then(|| "disabled in configuration".to_string());
        self.config = Arc::new(config);
        self.generation += 1;
        self.close_idle();
        tracing::info!(server = %self.id, "server settings reloaded");
        Ok(())
    }

    fn close_idle(&mut self) {
        for mut conn in self.idle.drain(..) {
            conn.close();
        }
    }

    /// Close every idle connection
    pub fn shutdown(&mut self) {
        let idle = self.idle.len();
        self.close_idle();
        if self.leased > 0 {
            tracing::debug!(server = %self.id, idle, leased = self.leased, "abandoning leased connections");
        }
    }

    /// Snapshot for the control plane
    pub fn status(&self, now: Instant, bytes_total: u64) -> ServerStatus {
        ServerStatus {
            name: self.id.clone(),
            enabled: self.enabled,
            disabled_reason: self.disabled_reason.clone(),
            open_connections: self.open_connections(),
            max_connections: self.config.connections,
            backoff_secs: self.backoff_remaining(now).map(|d| d.as_secs()),
            bytes_total,
        }
    }
}

/// Where an article should go next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pick {
    /// Dispatch to this server
    Server(ServerId),
    /// Eligible servers exist but none has a free connection
    Busy,
    /// Every eligible server has tried the article
    Exhausted,
}

/// All configured servers, ordered by priority
#[derive(Debug, Default)]
pub struct ServerSet {
    pools: Vec<ServerPool>,
}

impl ServerSet {
    /// Build pools for every configured server
    pub fn from_config(servers: &[ServerConfig], limiter: Option<SpeedLimiter>) -> Result<Self> {
        let mut set = Self::default();
        for server in servers {
            set.pools
                .push(ServerPool::new(server.clone(), limiter.clone())?);
        }
        set.sort();
        Ok(set)
    }

    fn sort(&mut self) {
        self.pools
            .sort_by_key(|p| (p.config.backup, p.config.priority));
    }

    /// Look up a pool
    pub fn get(&self, id: &str) -> Option<&ServerPool> {
        self.pools.iter().find(|p| p.id == id)
    }

    /// Look up a pool for mutation
    pub fn get_mut(&mut self, id: &str) -> Option<&mut ServerPool> {
        self.pools.iter_mut().find(|p| p.id == id)
    }

    /// Every pool, primaries first, then by priority
    pub fn iter(&self) -> impl Iterator<Item = &ServerPool> {
        self.pools.iter()
    }

    /// Enabled servers with priority rank `<= max_priority`
    pub fn active_servers(&self, max_priority: i32) -> impl Iterator<Item = &ServerPool> {
        self.pools
            .iter()
            .filter(move |p| p.enabled && p.config.priority <= max_priority)
    }

    /// Any enabled server at all
    pub fn any_enabled(&self) -> bool {
        self.pools.iter().any(|p| p.enabled)
    }

    /// Any server with a free connection right now
    pub fn any_free(&self, now: Instant) -> bool {
        self.pools.iter().any(|p| p.has_free_slot(now))
    }

    /// Add a server or reload an existing one. Returns true when it was new.
    pub fn update(&mut self, config: ServerConfig, limiter: Option<SpeedLimiter>) -> Result<bool> {
        let id = config.id();
        let added = match self.get_mut(&id) {
            Some(pool) => {
                pool.update(config)?;
                false
            }
            None => {
                self.pools.push(ServerPool::new(config, limiter)?);
                true
            }
        };
        self.sort();
        Ok(added)
    }

    /// Forget a server; its idle connections are closed
    pub fn remove(&mut self, id: &str) -> bool {
        match self.pools.iter().position(|p| p.id == id) {
            Some(index) => {
                let mut pool = self.pools.remove(index);
                pool.close_idle();
                true
            }
            None => false,
        }
    }

    /// Clear elapsed backoffs. Returns true when any server became usable.
    pub fn check_timers(&mut self, now: Instant) -> bool {
        self.pools
            .iter_mut()
            .fold(false, |woke, p| p.check_timers(now) || woke)
    }

    /// Choose the server for an article.
    ///
    /// A server is eligible when it is enabled, has not tried the article and
    /// retains articles as old as the job. Primaries are considered first; among
    /// them only the best priority rank qualifies, so a lower-ranked server only
    /// sees the article once every better one has tried it. Backups qualify only
    /// when no primary is eligible, and setting `allow_backup` records that.
    pub fn pick(
        &self,
        tried: &TryList,
        allow_backup: &mut bool,
        posted_at: Option<DateTime<Utc>>,
        now: Instant,
    ) -> Pick {
        if !self.any_enabled() {
            return Pick::Busy;
        }
        let wall = Utc::now();
        let eligible = |p: &&ServerPool| {
            p.enabled && !tried.contains(&p.id) && p.retains(posted_at, wall)
        };

        let primaries: Vec<&ServerPool> = self
            .pools
            .iter()
            .filter(|p| !p.config.backup)
            .filter(eligible)
            .collect();
        let candidates = if !primaries.is_empty() {
            primaries
        } else {
            let backups: Vec<&ServerPool> = self
                .pools
                .iter()
                .filter(|p| p.config.backup)
                .filter(eligible)
                .collect();
            if backups.is_empty() {
                return Pick::Exhausted;
            }
            if !*allow_backup {
                *allow_backup = true;
            }
            backups
        };

        let best = candidates
            .iter()
            .map(|p| p.config.priority)
            .min()
            .unwrap_or_default();
        candidates
            .into_iter()
            .filter(|p| p.config.priority == best)
            .find(|p| p.has_free_slot(now))
            .map(|p| Pick::Server(p.id.clone()))
            .unwrap_or(Pick::Busy)
    }

    /// Close idle connections of every server
    pub fn shutdown(&mut self) {
        for pool in &mut self.pools {
            pool.shutdown();
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn server(name: &str, priority: i32, backup: bool, connections: usize) -> ServerConfig {
        let mut cfg = ServerConfig::new("127.0.0.1", 119);
        cfg.name = name.into();
        cfg.priority = priority;
        cfg.backup = backup;
        cfg.connections = connections;
        cfg
    }

    #[tokio::test]
    async fn open_connections_never_exceed_the_limit() {
        let mut pool = ServerPool::new(server("s1", 0, false, 2), None).unwrap();
        let now = Instant::now();
        let a = pool.acquire_connection(now).unwrap();
        let _b = pool.acquire_connection(now).unwrap();
        assert!(pool.acquire_connection(now).is_none());
        assert_eq!(pool.open_connections(), 2);

        // an unconnected lease coming back frees its slot
        pool.release_connection(a);
        assert_eq!(pool.open_connections(), 1);
        assert!(pool.acquire_connection(now).is_some());
    }

    #[tokio::test]
    async fn backoff_blocks_new_connections_until_elapsed() {
        let mut cfg = server("s1", 0, false, 4);
        cfg.backoff.initial_delay = Duration::from_secs(5);
        cfg.backoff.jitter = false;
        let mut pool = ServerPool::new(cfg, None).unwrap();
        let now = Instant::now();

        assert_eq!(pool.record_failure(now), Duration::from_secs(5));
        assert!(pool.acquire_connection(now).is_none());
        assert!(!pool.check_timers(now + Duration::from_secs(1)));
        assert!(pool.check_timers(now + Duration::from_secs(6)));
        assert!(pool.acquire_connection(now + Duration::from_secs(6)).is_some());

        pool.record_connect();
        assert_eq!(pool.record_failure(now), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn disabled_server_hands_out_nothing() {
        let mut pool = ServerPool::new(server("s1", 0, false, 4), None).unwrap();
        pool.disable("authentication rejected");
        assert!(pool.acquire_connection(Instant::now()).is_none());
        let status = pool.status(Instant::now(), 0);
        assert!(!status.enabled);
        assert_eq!(
            status.disabled_reason.as_deref(),
            Some("authentication rejected")
        );
        pool.enable();
        assert!(pool.acquire_connection(Instant::now()).is_some());
    }

    #[tokio::test]
    async fn lower_priority_waits_for_better_ones() {
        let set = ServerSet::from_config(
            &[server("s2", 1, false, 1), server("s1", 0, false, 1)],
            None,
        )
        .unwrap();
        let mut tried = TryList::default();
        let mut backup = false;
        let now = Instant::now();
        assert_eq!(
            set.pick(&tried, &mut backup, None, now),
            Pick::Server("s1".into())
        );
        tried.add("s1");
        assert_eq!(
            set.pick(&tried, &mut backup, None, now),
            Pick::Server("s2".into())
        );
        tried.add("s2");
        assert_eq!(set.pick(&tried, &mut backup, None, now), Pick::Exhausted);
        assert!(!backup);
    }

    #[tokio::test]
    async fn backup_only_after_primaries_are_exhausted() {
        let set = ServerSet::from_config(
            &[
                server("s1", 0, false, 1),
                server("s3", 0, true, 1),
                server("s2", 1, false, 1),
            ],
            None,
        )
        .unwrap();
        let mut tried = TryList::default();
        let mut backup = false;
        let now = Instant::now();
        tried.add("s1");
        assert_eq!(
            set.pick(&tried, &mut backup, None, now),
            Pick::Server("s2".into())
        );
        assert!(!backup);
        tried.add("s2");
        assert_eq!(
            set.pick(&tried, &mut backup, None, now),
            Pick::Server("s3".into())
        );
        assert!(backup);
    }

    #[tokio::test]
    async fn busy_best_server_is_not_skipped() {
        let mut set = ServerSet::from_config(
            &[server("s1", 0, false, 1), server("s2", 1, false, 1)],
            None,
        )
        .unwrap();
        let now = Instant::now();
        let _lease = set.get_mut("s1").unwrap().acquire_connection(now).unwrap();
        let mut backup = false;
        assert_eq!(
            set.pick(&TryList::default(), &mut backup, None, now),
            Pick::Busy
        );
    }

    #[tokio::test]
    async fn retention_excludes_old_posts() {
        let mut cfg = server("short", 0, false, 1);
        cfg.retention_days = 10;
        let set = ServerSet::from_config(&[cfg], None).unwrap();
        let old = Utc::now() - chrono::Duration::days(30);
        let mut backup = false;
        assert_eq!(
            set.pick(&TryList::default(), &mut backup, Some(old), Instant::now()),
            Pick::Exhausted
        );
        assert_eq!(
            set.pick(&TryList::default(), &mut backup, Some(Utc::now()), Instant::now()),
            Pick::Server("short".into())
        );
    }

    #[tokio::test]
    async fn update_adds_and_reloads() {
        let mut set = ServerSet::from_config(&[server("s1", 0, false, 1)], None).unwrap();
        assert!(set.update(server("s2", 0, false, 1), None).unwrap());
        assert!(!set.update(server("s1", 5, false, 3), None).unwrap());
        assert_eq!(set.get("s1").unwrap().priority(), 5);
        assert_eq!(set.active_servers(0).count(), 1);
        assert!(set.remove("s2"));
        assert!(!set.remove("s2"));
    }
}
