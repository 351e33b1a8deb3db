//! Operator commands

use super::Engine;
use super::assembly::archive_policy;
use crate::assembler::AssembleMsg;
use crate::config::ServerConfig;
use crate::downloader::command::Command;
use crate::error::{Error, Result};
use crate::model::Job;
use crate::queue::PurgeSelector;
use crate::types::{
    EngineStatus, Event, JobId, JobInfo, PauseReason, Priority, ServerId, ServerStatus,
};
use std::time::Instant;
use tracing::info;

impl Engine {
    pub(super) async fn on_command(&mut self, command: Command) {
        match command {
            Command::Add { job, reply } => {
                reply.send(Ok(self.add_job(*job))).ok();
            }
            Command::Pause { reply } => {
                self.pause(PauseReason::Operator);
                reply.send(Ok(())).ok();
            }
            Command::Resume { reply } => {
                self.resume();
                reply.send(Ok(())).ok();
            }
            Command::PauseJob { id, reply } => {
                let result = self.set_job_paused(&id, true);
                reply.send(result).ok();
            }
            Command::ResumeJob { id, reply } => {
                let result = self.set_job_paused(&id, false);
                if result.is_ok() {
                    self.try_finish(&id).await;
                }
                reply.send(result).ok();
            }
            Command::Rename {
                id,
                name,
                password,
                reply,
            } => {
                let result = self.rename(&id, name, password).await;
                reply.send(result).ok();
            }
            Command::Delete {
                id,
                del_files,
                reply,
            } => {
                let result = self.delete_job(&id, del_files).await;
                reply.send(result).ok();
            }
            Command::Purge {
                selector,
                del_files,
                reply,
            } => {
                let removed = self.purge(&selector, del_files).await;
                reply.send(Ok(removed)).ok();
            }
            Command::MoveTo { id, index, reply } => {
                let result = self.require_live(&id).and_then(|_| self.queue.move_to(&id, index));
                self.queue_moved(&id, &result);
                reply.send(result).ok();
            }
            Command::MoveAfter { id, anchor, reply } => {
                let result = self
                    .require_live(&id)
                    .and_then(|_| self.queue.move_after(&id, &anchor));
                self.queue_moved(&id, &result);
                reply.send(result).ok();
            }
            Command::ChangePriority {
                id,
                priority,
                reply,
            } => {
                let result = self.change_priority(&id, priority);
                reply.send(result).ok();
            }
            Command::Sort {
                key,
                direction,
                reply,
            } => {
                self.queue.reorder_by(key, direction);
                self.queue_dirty = true;
                info!(key = ?key, direction = ?direction, "queue sorted");
                reply.send(Ok(())).ok();
            }
            Command::JobInfo { id, reply } => {
                reply.send(self.job_info(&id)).ok();
            }
            Command::Job { id, reply } => {
                let job = self
                    .queue
                    .get(&id)
                    .filter(|j| !j.is_deleted())
                    .cloned()
                    .ok_or_else(|| Error::job_not_found(&id));
                reply.send(job).ok();
            }
            Command::Snapshot { reply } => {
                reply.send(Ok(self.queue.snapshot())).ok();
            }
            Command::Status { reply } => {
                reply.send(Ok(self.status())).ok();
            }
            Command::Servers { reply } => {
                reply.send(Ok(self.server_status())).ok();
            }
            Command::UpdateServer { config, reply } => {
                reply.send(self.update_server(*config)).ok();
            }
            Command::EnableServer { server, reply } => {
                let result = self.enable_server(&server);
                reply.send(result).ok();
            }
            Command::DisableServer { server, reply } => {
                let result = self.disable_server(&server);
                reply.send(result).ok();
            }
            Command::RemoveServer { server, reply } => {
                let result = if self.servers.remove(&server) {
                    info!(server = %server, "server removed");
                    Ok(())
                } else {
                    Err(Error::NotFound(format!("server {server}")))
                };
                reply.send(result).ok();
            }
        }
    }

    fn add_job(&mut self, job: Job) -> usize {
        let id = job.id.clone();
        let name = job.name.clone();
        let position = self.queue.add(job);
        info!(job_id = %id, name = %name, position, "job added");
        self.dirty.insert(id.clone());
        self.queue_dirty = true;
        self.emit(Event::JobAdded { id, name });
        position
    }

    fn require_live(&self, id: &JobId) -> Result<()> {
        if self.is_live(id) {
            Ok(())
        } else {
            Err(Error::job_not_found(id))
        }
    }

    fn queue_moved(&mut self, id: &JobId, result: &Result<usize>) {
        if let Ok(position) = result {
            info!(job_id = %id, position, "job moved");
            self.dirty.insert(id.clone());
            self.queue_dirty = true;
        }
    }

    fn set_job_paused(&mut self, id: &JobId, paused: bool) -> Result<()> {
        self.require_live(id)?;
        let job = self.queue.require_mut(id)?;
        if job.paused == paused {
            return Ok(());
        }
        job.paused = paused;
        info!(job_id = %id, paused, "job pause changed");
        self.dirty.insert(id.clone());
        self.queue_dirty = true;
        self.emit(if paused {
            Event::JobPaused {
                id: id.clone(),
                reason: "operator".into(),
            }
        } else {
            Event::JobResumed { id: id.clone() }
        });
        Ok(())
    }

    /// Rename a job and optionally supply a password. A password resumes a job
    /// held for encryption and inspects its assembled archives again.
    async fn rename(
        &mut self,
        id: &JobId,
        name: Option<String>,
        password: Option<String>,
    ) -> Result<()> {
        self.require_live(id)?;
        let job = self.queue.require_mut(id)?;
        if let Some(name) = name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()) {
            info!(job_id = %id, name = %name, "job renamed");
            job.name = name;
        }
        self.dirty.insert(id.clone());
        let Some(password) = password else {
            return Ok(());
        };

        let job = self.queue.require_mut(id)?;
        job.password = Some(password);
        let held = job.encrypted == 1;
        let targets: Vec<(usize, std::path::PathBuf, _)> = job
            .files
            .iter()
            .enumerate()
            .filter(|(_, f)| f.assembled)
            .filter_map(|(index, f)| {
                archive_policy(&self.config.archive, job.password.as_deref(), &f.filename)
                    .map(|policy| (index, job.workdir.join(&f.filename), policy))
            })
            .collect();
        if !held {
            return Ok(());
        }
        job.encrypted = 0;
        let resumed = std::mem::replace(&mut job.paused, false);
        info!(job_id = %id, archives = targets.len(), "password supplied, checking archives again");

        if !targets.is_empty() {
            *self.reinspecting.entry(id.clone()).or_default() += targets.len();
            for (file, path, policy) in targets {
                self.assembler.submit(AssembleMsg::Reinspect {
                    job: id.clone(),
                    file,
                    path,
                    policy,
                });
            }
        }
        if resumed {
            self.queue_dirty = true;
            self.emit(Event::JobResumed { id: id.clone() });
        }
        self.try_finish(id).await;
        Ok(())
    }

    async fn purge(&mut self, selector: &PurgeSelector, del_files: bool) -> Vec<JobId> {
        let ids: Vec<JobId> = self
            .queue
            .matching(selector)
            .into_iter()
            .filter(|id| self.is_live(id))
            .collect();
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if self.delete_job(&id, del_files).await.is_ok() {
                removed.push(id);
            }
        }
        info!(count = removed.len(), "queue purged");
        removed
    }

    fn change_priority(&mut self, id: &JobId, priority: Priority) -> Result<usize> {
        self.require_live(id)?;
        let priority = match priority {
            Priority::Default => {
                let category = self.queue.get(id).and_then(|j| j.category.clone());
                match self.config.category_priority(category.as_deref()) {
                    Priority::Default => Priority::Normal,
                    p => p,
                }
            }
            p => p,
        };
        let position = self.queue.change_priority(id, priority)?;
        info!(job_id = %id, priority = ?priority, position, "job priority changed");
        if matches!(priority, Priority::Paused | Priority::Duplicate) {
            self.emit(Event::JobPaused {
                id: id.clone(),
                reason: "priority".into(),
            });
        }
        self.dirty.insert(id.clone());
        self.queue_dirty = true;
        Ok(position)
    }

    fn job_info(&self, id: &JobId) -> Result<JobInfo> {
        self.require_live(id)?;
        self.queue
            .snapshot()
            .into_iter()
            .find(|info| info.id == *id)
            .ok_or_else(|| Error::job_not_found(id))
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            state: self.state,
            pause_reason: self.pause_reason,
            delayed: self.decoder.is_delayed(),
            speed_bps: self.meter.speed(),
            cache_used: self.cache.used(),
            cache_limit: self.cache.limit(),
            jobs: self.queue.snapshot().len(),
            in_flight: self.in_flight,
            quota_left: self.meter.quota_left(),
            top_only: self.queue.top_only(),
        }
    }

    fn server_status(&self) -> Vec<ServerStatus> {
        let now = Instant::now();
        self.servers
            .iter()
            .map(|pool| pool.status(now, self.meter.totals(pool.id()).total))
            .collect()
    }

    fn update_server(&mut self, server: ServerConfig) -> Result<()> {
        if server.host.is_empty() || server.connections == 0 {
            return Err(Error::Config {
                message: "a server needs a host and at least one connection".into(),
                key: Some("servers".into()),
            });
        }
        self.apply_server(server)
    }

    fn enable_server(&mut self, server: &ServerId) -> Result<()> {
        let pool = self
            .servers
            .get_mut(server)
            .ok_or_else(|| Error::NotFound(format!("server {server}")))?;
        if !pool.is_enabled() {
            pool.enable();
            info!(server = %server, "server enabled, resetting try-lists");
            self.queue.reset_try_lists();
        }
        Ok(())
    }

    fn disable_server(&mut self, server: &ServerId) -> Result<()> {
        let pool = self
            .servers
            .get_mut(server)
            .ok_or_else(|| Error::NotFound(format!("server {server}")))?;
        if pool.is_enabled() {
            pool.disable("disabled by operator");
            info!(server = %server, "server disabled");
            self.emit(Event::ServerDisabled {
                server: server.clone(),
                reason: "disabled by operator".into(),
            });
        }
        Ok(())
    }
}
