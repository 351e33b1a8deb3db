//! Ordered job queue
//!
//! Jobs are kept sorted by priority rank; within a rank they keep insertion
//! order unless the operator moves or sorts them. The queue is owned by the
//! scheduling loop and picks the next article for an idle connection.

use crate::decoder::DecodeContext;
use crate::error::{JobError, Result};
use crate::model::{Job, PreQueueResult};
use crate::servers::{Pick, ServerSet};
use crate::types::{ArticleId, JobId, JobInfo, JobStatus, Priority, ServerId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Priority after the insertion-time precedence rules
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedPriority {
    /// Scheduling rank (a regular level)
    pub rank: Priority,
    /// Add the job paused
    pub paused: bool,
    /// Add the job flagged as duplicate
    pub duplicate: bool,
}

/// Apply the priority-on-add precedence.
///
/// Precedence, strongest first: an explicit priority on add, the pre-queue
/// script's priority, the category default. `Default` at any level defers to
/// the next one. A winning `Paused` or `Duplicate` sets job state, and the rank
/// falls back along the same chain to the first regular level other than
/// `Force` (`Normal` when there is none).
pub fn resolve_priority(
    category_default: Priority,
    explicit: Priority,
    pre_queue: Option<Priority>,
) -> ResolvedPriority {
    let chain: Vec<Priority> = [Some(explicit), pre_queue, Some(category_default)]
        .into_iter()
        .flatten()
        .filter(|p| *p != Priority::Default)
        .collect();

    let winner = chain.first().copied().unwrap_or(Priority::Normal);
    if !winner.sets_state() {
        return ResolvedPriority {
            rank: winner,
            paused: false,
            duplicate: false,
        };
    }
    let rank = chain
        .iter()
        .copied()
        .find(|p| p.is_regular() && *p != Priority::Force)
        .unwrap_or(Priority::Normal);
    ResolvedPriority {
        rank,
        paused: true,
        duplicate: winner == Priority::Duplicate,
    }
}

/// Category after a pre-queue script had its say
pub fn resolve_category(explicit: Option<String>, pre_queue: Option<&PreQueueResult>) -> Option<String> {
    pre_queue
        .and_then(|p| p.category.clone())
        .or(explicit)
}

/// Sort key for [`Queue::reorder_by`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    /// Job name, case-insensitive
    Name,
    /// Declared size
    Size,
    /// Bytes still to fetch
    Remaining,
    /// Time added
    Added,
    /// Post date
    Age,
}

/// Sort direction
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

/// Which jobs a purge removes
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PurgeSelector {
    /// Everything
    All,
    /// Jobs whose name contains the text (case-insensitive)
    NameContains(String),
    /// Jobs in a category
    Category(String),
    /// Jobs in a given status
    Status(JobStatus),
}

impl PurgeSelector {
    /// Does the selector cover `job`
    pub fn matches(&self, job: &Job) -> bool {
        match self {
            PurgeSelector::All => true,
            PurgeSelector::NameContains(text) => {
                job.name.to_lowercase().contains(&text.to_lowercase())
            }
            PurgeSelector::Category(cat) => job.category.as_deref() == Some(cat.as_str()),
            PurgeSelector::Status(status) => job.status == *status,
        }
    }
}

/// Dispatch constraints from the engine
#[derive(Clone, Copy, Debug, Default)]
pub struct DispatchScope {
    /// Engine paused: only `Force` jobs may run
    pub force_only: bool,
    /// Hold back jobs posted less than this long ago
    pub propagation_delay: chrono::Duration,
    /// Assembler is saturated: only the article each file's assembly waits on
    pub cursor_only: bool,
}

/// One article handed to a connection
#[derive(Clone, Debug)]
pub struct Dispatch {
    /// Article address
    pub id: ArticleId,
    /// Chosen server
    pub server: ServerId,
    /// Wire identifier
    pub message_id: String,
    /// Availability check instead of a download
    pub precheck: bool,
    /// Spill the payload to disk regardless of cache room
    pub force_disk: bool,
    /// Decoder context
    pub ctx: DecodeContext,
}

/// Ordered collection of jobs
#[derive(Debug, Default)]
pub struct Queue {
    jobs: Vec<Job>,
    next_seq: u64,
    top_only: bool,
}

impl Queue {
    /// Empty queue
    pub fn new(top_only: bool) -> Self {
        Self {
            top_only,
            ..Default::default()
        }
    }

    /// Insert a job behind every job of equal or higher priority.
    /// `job.priority` must already be resolved. Returns the position.
    pub fn add(&mut self, mut job: Job) -> usize {
        if !job.priority.is_regular() {
            job.priority = Priority::Normal;
        }
        job.seq = self.next_seq;
        self.next_seq += 1;
        let rank = job.priority.rank();
        let index = self
            .jobs
            .iter()
            .position(|j| j.priority.rank() > rank)
            .unwrap_or(self.jobs.len());
        tracing::debug!(job_id = %job.id, position = index, priority = ?job.priority, "job queued");
        self.jobs.insert(index, job);
        index
    }

    /// Put back a job restored from the admin store, keeping its stored order
    pub fn restore(&mut self, job: Job) {
        self.next_seq = self.next_seq.max(job.seq + 1);
        self.jobs.push(job);
    }

    /// Take a job out
    pub fn remove(&mut self, id: &JobId) -> Option<Job> {
        let index = self.position(id)?;
        Some(self.jobs.remove(index))
    }

    /// Position of a job
    pub fn position(&self, id: &JobId) -> Option<usize> {
        self.jobs.iter().position(|j| &j.id == id)
    }

    /// Look up a job
    pub fn get(&self, id: &JobId) -> Option<&Job> {
        self.jobs.iter().find(|j| &j.id == id)
    }

    /// Look up a job for mutation
    pub fn get_mut(&mut self, id: &JobId) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| &j.id == id)
    }

    /// Look up a job, failing with `JobError::NotFound`
    pub fn require_mut(&mut self, id: &JobId) -> Result<&mut Job> {
        self.get_mut(id)
            .ok_or_else(|| JobError::NotFound { id: id.clone() }.into())
    }

    /// Jobs in queue order
    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter()
    }

    /// Jobs in queue order, mutable
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Job> {
        self.jobs.iter_mut()
    }

    /// Number of jobs, deleted ones still draining included
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// No jobs left to download
    pub fn empty(&self) -> bool {
        self.jobs.iter().all(|j| j.is_deleted())
    }

    /// Only the head job is eligible for dispatch
    pub fn set_top_only(&mut self, top_only: bool) {
        self.top_only = top_only;
    }

    /// Current top-only setting
    pub fn top_only(&self) -> bool {
        self.top_only
    }

    /// Move a job to `index`. The queue stays sorted by rank, so the job takes
    /// the priority of the neighbour it lands next to when it crosses a boundary.
    pub fn move_to(&mut self, id: &JobId, index: usize) -> Result<usize> {
        let from = self
            .position(id)
            .ok_or_else(|| JobError::NotFound { id: id.clone() })?;
        let mut job = self.jobs.remove(from);
        let index = index.min(self.jobs.len());
        if let Some(prev) = index.checked_sub(1).and_then(|i| self.jobs.get(i))
            && prev.priority.rank() > job.priority.rank()
        {
            job.priority = prev.priority;
        }
        if let Some(next) = self.jobs.get(index)
            && next.priority.rank() < job.priority.rank()
        {
            job.priority = next.priority;
        }
        self.jobs.insert(index, job);
        Ok(index)
    }

    /// Move a job directly behind `anchor`
    pub fn move_after(&mut self, id: &JobId, anchor: &JobId) -> Result<usize> {
        if id == anchor {
            return Err(JobError::InvalidMove {
                id: id.clone(),
                reason: "cannot move a job behind itself".into(),
            }
            .into());
        }
        let anchor_index = self.position(anchor).ok_or_else(|| JobError::InvalidMove {
            id: id.clone(),
            reason: format!("anchor job {anchor} not in queue"),
        })?;
        let from = self
            .position(id)
            .ok_or_else(|| JobError::NotFound { id: id.clone() })?;
        let target = if from < anchor_index {
            anchor_index
        } else {
            anchor_index + 1
        };
        self.move_to(id, target)
    }

    /// Change a job's priority and re-slot it at the end of its new rank.
    /// `Paused` pauses the job instead; `Default` must be resolved by the caller.
    pub fn change_priority(&mut self, id: &JobId, priority: Priority) -> Result<usize> {
        let mut job = self
            .remove(id)
            .ok_or_else(|| JobError::NotFound { id: id.clone() })?;
        match priority {
            Priority::Paused | Priority::Duplicate => job.paused = true,
            p if p.is_regular() => job.priority = p,
            _ => {}
        }
        let seq = job.seq;
        let position = self.add(job);
        if let Some(job) = self.jobs.get_mut(position) {
            job.seq = seq;
        }
        Ok(position)
    }

    /// Stable sort within each priority rank
    pub fn reorder_by(&mut self, key: SortKey, direction: SortDirection) {
        self.jobs.sort_by(|a, b| {
            let by_key = match key {
                SortKey::Name => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
                SortKey::Size => a.size_bytes.cmp(&b.size_bytes),
                SortKey::Remaining => {
                    let left = |j: &Job| j.size_bytes.saturating_sub(j.downloaded_bytes());
                    left(a).cmp(&left(b))
                }
                SortKey::Added => a.added_at.cmp(&b.added_at),
                SortKey::Age => a.posted_at.cmp(&b.posted_at),
            };
            let by_key = match direction {
                SortDirection::Ascending => by_key,
                SortDirection::Descending => by_key.reverse(),
            };
            a.priority.rank().cmp(&b.priority.rank()).then(by_key)
        });
    }

    /// Live jobs the selector matches, in queue order
    pub fn matching(&self, selector: &PurgeSelector) -> Vec<JobId> {
        self.jobs
            .iter()
            .filter(|j| !j.is_deleted() && selector.matches(j))
            .map(|j| j.id.clone())
            .collect()
    }

    /// Clear every try-list (a server became eligible again)
    pub fn reset_try_lists(&mut self) {
        for job in &mut self.jobs {
            job.reset_try_lists();
        }
    }

    /// Control-plane view of the live jobs
    pub fn snapshot(&self) -> Vec<JobInfo> {
        self.jobs
            .iter()
            .filter(|j| !j.is_deleted())
            .enumerate()
            .map(|(i, j)| j.info(i))
            .collect()
    }

    /// Pick the next article and mark its fetcher.
    ///
    /// Articles whose every eligible server has already failed are marked
    /// exhausted on the way and reported through `exhausted`.
    pub fn next_article(
        &mut self,
        servers: &ServerSet,
        now: Instant,
        scope: DispatchScope,
        exhausted: &mut Vec<ArticleId>,
    ) -> Option<Dispatch> {
        if !servers.any_free(now) {
            return None;
        }
        let wall = Utc::now();
        let top_only = self.top_only;

        for job in &mut self.jobs {
            if !job.is_dispatchable() {
                continue;
            }
            if scope.force_only && job.priority != Priority::Force {
                continue;
            }
            if let Some(posted) = job.posted_at
                && wall - posted < scope.propagation_delay
            {
                continue;
            }

            for fi in 0..job.files.len() {
                if job.files[fi].assembled {
                    continue;
                }
                let Some(first) = job.files[fi].first_unsettled() else {
                    continue;
                };
                let articles = if scope.cursor_only && !job.precheck {
                    first..first + 1
                } else {
                    first..job.files[fi].articles.len()
                };
                for ai in articles {
                    let precheck = job.precheck;
                    let posted_at = job.posted_at;
                    let file = &mut job.files[fi];
                    let filename_checked = file.filename_checked;
                    let article = &mut file.articles[ai];
                    if !article.is_runnable(precheck) {
                        continue;
                    }
                    let had_backup = article.allow_backup_server;
                    let pick = servers.pick(
                        &article.try_list,
                        &mut article.allow_backup_server,
                        posted_at,
                        now,
                    );
                    if article.allow_backup_server && !had_backup {
                        tracing::debug!(job_id = %job.id, file = fi, article = ai, "primaries exhausted, allowing backup servers");
                    }
                    match pick {
                        Pick::Server(server) => {
                            article.fetcher = Some(server.clone());
                            let dispatch = Dispatch {
                                id: ArticleId::new(job.id.clone(), fi, ai),
                                server,
                                message_id: article.message_id.clone(),
                                precheck,
                                force_disk: !filename_checked && !article.lowest_partnum,
                                ctx: DecodeContext {
                                    lowest_partnum: article.lowest_partnum,
                                    precheck,
                                    size_hint: article.bytes as usize,
                                },
                            };
                            if job.status == JobStatus::Queued {
                                job.status = if precheck {
                                    JobStatus::Checking
                                } else {
                                    JobStatus::Downloading
                                };
                            }
                            return Some(dispatch);
                        }
                        Pick::Busy => {}
                        Pick::Exhausted => {
                            let id = ArticleId::new(job.id.clone(), fi, ai);
                            if job.mark_exhausted(&id) {
                                exhausted.push(id);
                            }
                        }
                    }
                }
            }
            if top_only {
                return None;
            }
        }
        None
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::model::{Article, NzbFile};
    use std::path::PathBuf;

    fn job(id: &str, priority: Priority, articles: u32) -> Job {
        let files = vec![NzbFile::new(
            "subject",
            format!("{id}.bin"),
            (1..=articles)
                .map(|p| Article::new(format!("{id}-{p}"), 1000, p))
                .collect(),
        )];
        let mut job = Job::new(JobId::from(id), id, files, PathBuf::from("/tmp").join(id));
        job.priority = priority;
        job
    }

    fn ids(queue: &Queue) -> Vec<&str> {
        queue.iter().map(|j| j.id.as_str()).collect()
    }

    fn servers(specs: &[(&str, i32, bool)]) -> ServerSet {
        let configs: Vec<ServerConfig> = specs
            .iter()
            .map(|(name, prio, backup)| {
                let mut c = ServerConfig::new("127.0.0.1", 119);
                c.name = name.to_string();
                c.priority = *prio;
                c.backup = *backup;
                c.connections = 4;
                c
            })
            .collect();
        ServerSet::from_config(&configs, None).unwrap()
    }

    #[test]
    fn precedence_explicit_beats_everything() {
        let r = resolve_priority(Priority::Low, Priority::High, Some(Priority::Repair));
        assert_eq!(r.rank, Priority::High);
        assert!(!r.paused);
    }

    #[test]
    fn precedence_default_defers_down_the_chain() {
        let r = resolve_priority(Priority::Low, Priority::Default, Some(Priority::High));
        assert_eq!(r.rank, Priority::High);
        let r = resolve_priority(Priority::Low, Priority::Default, None);
        assert_eq!(r.rank, Priority::Low);
        let r = resolve_priority(Priority::Default, Priority::Default, None);
        assert_eq!(r.rank, Priority::Normal);
    }

    #[test]
    fn precedence_state_setting_levels_fall_back() {
        // explicit pause: rank falls back to the pre-queue level
        let r = resolve_priority(Priority::Low, Priority::Paused, Some(Priority::High));
        assert_eq!(
            r,
            ResolvedPriority {
                rank: Priority::High,
                paused: true,
                duplicate: false
            }
        );
        // duplicate from the pre-queue script: falls back to the category
        let r = resolve_priority(Priority::Low, Priority::Default, Some(Priority::Duplicate));
        assert_eq!(r.rank, Priority::Low);
        assert!(r.paused && r.duplicate);
        // force is never a fallback for a state-setting level
        let r = resolve_priority(Priority::Force, Priority::Paused, None);
        assert_eq!(r.rank, Priority::Normal);
        assert!(r.paused);
        // category default paused
        let r = resolve_priority(Priority::Paused, Priority::Default, None);
        assert_eq!(r.rank, Priority::Normal);
        assert!(r.paused);
    }

    #[test]
    fn precedence_explicit_beats_pre_queue_pause() {
        let r = resolve_priority(Priority::Normal, Priority::High, Some(Priority::Paused));
        assert_eq!(r.rank, Priority::High);
        assert!(!r.paused);
    }

    #[test]
    fn pre_queue_category_wins() {
        let pre = PreQueueResult {
            category: Some("tv".into()),
            priority: None,
        };
        assert_eq!(
            resolve_category(Some("movies".into()), Some(&pre)).as_deref(),
            Some("tv")
        );
        assert_eq!(
            resolve_category(Some("movies".into()), None).as_deref(),
            Some("movies")
        );
    }

    #[test]
    fn add_orders_by_rank_then_insertion() {
        let mut q = Queue::default();
        q.add(job("n1", Priority::Normal, 1));
        q.add(job("l1", Priority::Low, 1));
        q.add(job("h1", Priority::High, 1));
        q.add(job("n2", Priority::Normal, 1));
        assert_eq!(q.add(job("f1", Priority::Force, 1)), 0);
        assert_eq!(ids(&q), vec!["f1", "h1", "n1", "n2", "l1"]);
    }

    #[test]
    fn move_adopts_neighbour_priority() {
        let mut q = Queue::default();
        q.add(job("h1", Priority::High, 1));
        q.add(job("n1", Priority::Normal, 1));
        q.add(job("n2", Priority::Normal, 1));
        assert_eq!(q.move_to(&JobId::from("n2"), 0).unwrap(), 0);
        assert_eq!(ids(&q), vec!["n2", "h1", "n1"]);
        assert_eq!(q.get(&JobId::from("n2")).unwrap().priority, Priority::High);

        q.move_after(&JobId::from("n2"), &JobId::from("n1")).unwrap();
        assert_eq!(ids(&q), vec!["h1", "n1", "n2"]);
        assert_eq!(q.get(&JobId::from("n2")).unwrap().priority, Priority::Normal);

        assert!(q.move_after(&JobId::from("n2"), &JobId::from("zz")).is_err());
        assert!(q.move_to(&JobId::from("zz"), 0).is_err());
    }

    #[test]
    fn change_priority_reslots_and_pauses() {
        let mut q = Queue::default();
        q.add(job("a", Priority::Normal, 1));
        q.add(job("b", Priority::Normal, 1));
        assert_eq!(q.change_priority(&JobId::from("b"), Priority::High).unwrap(), 0);
        q.change_priority(&JobId::from("a"), Priority::Paused).unwrap();
        assert!(q.get(&JobId::from("a")).unwrap().paused);
        assert_eq!(q.get(&JobId::from("a")).unwrap().priority, Priority::Normal);
    }

    #[test]
    fn reorder_keeps_priority_groups() {
        let mut q = Queue::default();
        q.add(job("zeta", Priority::High, 1));
        q.add(job("beta", Priority::Normal, 1));
        q.add(job("alpha", Priority::Normal, 1));
        q.add(job("gamma", Priority::Low, 1));
        q.reorder_by(SortKey::Name, SortDirection::Ascending);
        assert_eq!(ids(&q), vec!["zeta", "alpha", "beta", "gamma"]);
        q.reorder_by(SortKey::Name, SortDirection::Descending);
        assert_eq!(ids(&q), vec!["zeta", "beta", "alpha", "gamma"]);
    }

    #[test]
    fn purge_selector_matches_live_jobs() {
        let mut q = Queue::default();
        q.add(job("keep", Priority::Normal, 1));
        q.add(job("drop-me", Priority::Normal, 1));
        q.add(job("drop-me-too", Priority::Normal, 1));
        q.get_mut(&JobId::from("drop-me-too")).unwrap().status = JobStatus::Deleted;

        let ids = q.matching(&PurgeSelector::NameContains("DROP".into()));
        assert_eq!(ids, vec![JobId::from("drop-me")]);
        assert_eq!(q.matching(&PurgeSelector::All).len(), 2);
        assert!(q.matching(&PurgeSelector::Category("tv".into())).is_empty());
    }

    #[tokio::test]
    async fn dispatch_walks_articles_and_marks_fetcher() {
        let set = servers(&[("s1", 0, false)]);
        let mut q = Queue::default();
        q.add(job("a", Priority::Normal, 3));
        let mut exhausted = Vec::new();
        let now = Instant::now();

        let first = q
            .next_article(&set, now, DispatchScope::default(), &mut exhausted)
            .unwrap();
        assert_eq!(first.id.article, 0);
        assert!(first.ctx.lowest_partnum);
        assert!(!first.force_disk);
        let second = q
            .next_article(&set, now, DispatchScope::default(), &mut exhausted)
            .unwrap();
        assert_eq!(second.id.article, 1);
        assert!(second.force_disk, "filename not checked yet");

        let job = q.get(&JobId::from("a")).unwrap();
        assert_eq!(job.in_flight(), 2);
        assert_eq!(job.status, JobStatus::Downloading);
    }

    #[tokio::test]
    async fn exhausted_articles_are_reported() {
        let set = servers(&[("s1", 0, false)]);
        let mut q = Queue::default();
        let mut j = job("a", Priority::Normal, 2);
        j.files[0].articles[0].try_list.add("s1");
        q.add(j);
        let mut exhausted = Vec::new();
        let d = q
            .next_article(&set, Instant::now(), DispatchScope::default(), &mut exhausted)
            .unwrap();
        assert_eq!(d.id.article, 1);
        assert_eq!(exhausted, vec![ArticleId::new(JobId::from("a"), 0, 0)]);
        assert_eq!(q.get(&JobId::from("a")).unwrap().bad_articles, 1);
    }

    #[tokio::test]
    async fn top_only_and_stop_and_force_scope() {
        let set = servers(&[("s1", 0, false)]);
        let mut q = Queue::new(true);
        let mut head = job("head", Priority::High, 1);
        head.files[0].articles[0].fetcher = Some("s1".into());
        q.add(head);
        q.add(job("next", Priority::Normal, 1));
        q.add(job("stopped", Priority::Stop, 1));
        let mut exhausted = Vec::new();
        let now = Instant::now();

        assert!(
            q.next_article(&set, now, DispatchScope::default(), &mut exhausted)
                .is_none(),
            "head job has nothing runnable and top-only holds the rest"
        );
        q.set_top_only(false);
        let d = q
            .next_article(&set, now, DispatchScope::default(), &mut exhausted)
            .unwrap();
        assert_eq!(d.id.job.as_str(), "next");
        assert!(
            q.next_article(&set, now, DispatchScope::default(), &mut exhausted)
                .is_none(),
            "stop-priority jobs are never dispatched"
        );

        q.add(job("forced", Priority::Force, 1));
        let scope = DispatchScope {
            force_only: true,
            ..Default::default()
        };
        let d = q.next_article(&set, now, scope, &mut exhausted).unwrap();
        assert_eq!(d.id.job.as_str(), "forced");
    }

    #[tokio::test]
    async fn propagation_delay_holds_fresh_posts() {
        let set = servers(&[("s1", 0, false)]);
        let mut q = Queue::default();
        let mut fresh = job("fresh", Priority::Normal, 1);
        fresh.posted_at = Some(Utc::now());
        q.add(fresh);
        let scope = DispatchScope {
            propagation_delay: chrono::Duration::minutes(30),
            ..Default::default()
        };
        let mut exhausted = Vec::new();
        assert!(
            q.next_article(&set, Instant::now(), scope, &mut exhausted)
                .is_none()
        );
    }

    #[tokio::test]
    async fn saturated_assembler_only_feeds_file_cursors() {
        let set = servers(&[("s1", 0, false)]);
        let mut q = Queue::default();
        q.add(job("a", Priority::Normal, 3));
        {
            let file = &mut q.get_mut(&JobId::from("a")).unwrap().files[0];
            file.articles[1].decoded = true;
            file.articles[2].decoded = true;
        }
        let scope = DispatchScope {
            cursor_only: true,
            ..Default::default()
        };
        let mut exhausted = Vec::new();
        let now = Instant::now();
        let d = q.next_article(&set, now, scope, &mut exhausted).unwrap();
        assert_eq!(d.id.article, 0);
        assert!(
            q.next_article(&set, now, scope, &mut exhausted).is_none(),
            "the cursor article is already in flight"
        );
    }

    #[tokio::test]
    async fn settled_prefix_is_skipped_until_an_article_is_reset() {
        let set = servers(&[("s1", 0, false)]);
        let mut q = Queue::default();
        q.add(job("p", Priority::Normal, 4));
        let id = JobId::from("p");
        {
            let file = &mut q.get_mut(&id).unwrap().files[0];
            file.articles[0].decoded = true;
            file.articles[1].on_disk = true;
        }
        let mut exhausted = Vec::new();
        let now = Instant::now();
        let d = q
            .next_article(&set, now, DispatchScope::default(), &mut exhausted)
            .unwrap();
        assert_eq!(d.id.article, 2);
        assert_eq!(q.get_mut(&id).unwrap().files[0].first_unsettled(), Some(2));

        let job = q.get_mut(&id).unwrap();
        assert!(job.reset_article(&ArticleId::new(id.clone(), 0, 0)));
        assert_eq!(job.files[0].first_unsettled(), Some(0));
        let d = q
            .next_article(&set, now, DispatchScope::default(), &mut exhausted)
            .unwrap();
        assert_eq!(d.id.article, 0);
    }
}
