//! Single-process `JobRepository` backed by a `parking_lot::RwLock`-guarded
//! map; atomicity is achieved by holding the write lock across each
//! compare-and-set (§4.3.1).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::{AgendaError, AgendaResult};
use crate::job::{Job, JobId, JobType};
use crate::repository::{JobFilter, JobRepository, NameOverview, SortSpec};

#[derive(Default)]
pub struct MemoryJobRepository {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn existing_single_id(jobs: &HashMap<JobId, Job>, job: &Job) -> Option<JobId> {
        if job.job_type != JobType::Single {
            return None;
        }
        jobs.iter()
            .find(|(_, existing)| existing.job_type == JobType::Single && existing.name == job.name)
            .map(|(id, _)| *id)
    }

    fn existing_unique_id(jobs: &HashMap<JobId, Job>, job: &Job) -> Option<JobId> {
        let unique = job.unique.as_ref()?;
        jobs.iter()
            .find(|(_, existing)| {
                existing.name == job.name
                    && existing
                        .unique
                        .as_ref()
                        .map(|u| u.query == unique.query)
                        .unwrap_or(false)
            })
            .map(|(id, _)| *id)
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn save_job(&self, mut job: Job) -> AgendaResult<Job> {
        let mut jobs = self.jobs.write();

        if let Some(id) = Self::existing_single_id(&jobs, &job) {
            job.id = Some(id);
            jobs.insert(id, job.clone());
            return Ok(job);
        }

        if let Some(id) = Self::existing_unique_id(&jobs, &job) {
            let insert_only = job.unique.as_ref().map(|u| u.insert_only).unwrap_or(false);
            if insert_only {
                return Ok(jobs.get(&id).cloned().expect("id just looked up"));
            }
            job.id = Some(id);
            jobs.insert(id, job.clone());
            return Ok(job);
        }

        let id = job.id.unwrap_or_else(JobId::new);
        job.id = Some(id);
        jobs.insert(id, job.clone());
        Ok(job)
    }

    async fn get_next_job_to_run(
        &self,
        name: &str,
        next_scan_at: DateTime<Utc>,
        lock_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AgendaResult<Option<Job>> {
        let mut jobs = self.jobs.write();

        let mut candidate_id = None;
        for (id, job) in jobs.iter() {
            if job.name != name || job.disabled {
                continue;
            }
            let unlocked_and_due = job.locked_at.is_none()
                && job.next_run_at.map(|at| at <= next_scan_at).unwrap_or(false);
            let orphaned = job.locked_at.map(|at| at <= lock_deadline).unwrap_or(false);
            if !(unlocked_and_due || orphaned) {
                continue;
            }
            candidate_id = Some(match candidate_id {
                None => *id,
                Some(best) => {
                    let best_job = &jobs[&best];
                    if (job.priority, std::cmp::Reverse(job.next_run_at))
                        > (best_job.priority, std::cmp::Reverse(best_job.next_run_at))
                    {
                        *id
                    } else {
                        best
                    }
                }
            });
        }

        let Some(id) = candidate_id else {
            return Ok(None);
        };
        let job = jobs.get_mut(&id).expect("id came from iteration above");
        job.mark_locked(now);
        Ok(Some(job.clone()))
    }

    async fn lock_job_by_id(
        &self,
        id: JobId,
        expected_next_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> AgendaResult<Option<Job>> {
        let mut jobs = self.jobs.write();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        if job.disabled || job.locked_at.is_some() || job.next_run_at != expected_next_run_at {
            return Ok(None);
        }
        job.mark_locked(now);
        Ok(Some(job.clone()))
    }

    async fn unlock_jobs(&self, ids: &[JobId]) -> AgendaResult<()> {
        let mut jobs = self.jobs.write();
        for id in ids {
            if let Some(job) = jobs.get_mut(id) {
                if job.next_run_at.is_some() {
                    job.mark_unlocked();
                }
            }
        }
        Ok(())
    }

    async fn save_job_state(&self, job: &Job) -> AgendaResult<()> {
        let mut jobs = self.jobs.write();
        let id = job.id.ok_or_else(|| AgendaError::Configuration("save_job_state requires an id".into()))?;
        if !jobs.contains_key(&id) {
            return Err(AgendaError::StaleJob(id.to_string()));
        }
        jobs.insert(id, job.clone());
        Ok(())
    }

    async fn cancel(&self, filter: &JobFilter) -> AgendaResult<u64> {
        let mut jobs = self.jobs.write();
        let before = jobs.len();
        jobs.retain(|_, job| !matches_filter(job, filter));
        Ok((before - jobs.len()) as u64)
    }

    async fn purge(&self, defined_names: &[String]) -> AgendaResult<u64> {
        let mut jobs = self.jobs.write();
        let before = jobs.len();
        jobs.retain(|_, job| defined_names.iter().any(|n| n == &job.name));
        Ok((before - jobs.len()) as u64)
    }

    async fn query_jobs(
        &self,
        filter: &JobFilter,
        sort: SortSpec,
        skip: u64,
        limit: u64,
    ) -> AgendaResult<(Vec<Job>, u64)> {
        let jobs = self.jobs.read();
        let mut matched: Vec<Job> = jobs.values().filter(|j| matches_filter(j, filter)).cloned().collect();
        match sort {
            SortSpec::NextRunAtAscPriorityDesc => matched.sort_by(|a, b| {
                a.next_run_at
                    .cmp(&b.next_run_at)
                    .then(b.priority.cmp(&a.priority))
            }),
            SortSpec::PriorityDescNextRunAtAsc => matched.sort_by(|a, b| {
                b.priority.cmp(&a.priority).then(a.next_run_at.cmp(&b.next_run_at))
            }),
        }
        let total = matched.len() as u64;
        let page = matched
            .into_iter()
            .skip(skip as usize)
            .take(limit as usize)
            .collect();
        Ok((page, total))
    }

    async fn get_jobs_overview(&self) -> AgendaResult<Vec<NameOverview>> {
        let jobs = self.jobs.read();
        let now = Utc::now();
        let mut by_name: HashMap<String, NameOverview> = HashMap::new();
        for job in jobs.values() {
            let entry = by_name.entry(job.name.clone()).or_insert_with(|| NameOverview {
                name: job.name.clone(),
                ..Default::default()
            });
            entry.total += 1;
            if job.is_running() {
                entry.running += 1;
            }
            if job.is_scheduled(now) {
                entry.scheduled += 1;
            }
            if job.is_queued(now) {
                entry.queued += 1;
            }
            if job.is_completed() {
                entry.completed += 1;
            }
            if job.is_failed() {
                entry.failed += 1;
            }
        }
        Ok(by_name.into_values().collect())
    }
}

pub(crate) fn matches_filter(job: &Job, filter: &JobFilter) -> bool {
    if let Some(name) = &filter.name {
        if &job.name != name {
            return false;
        }
    }
    if let Some(disabled) = filter.disabled {
        if job.disabled != disabled {
            return false;
        }
    }
    if let Some(locked) = filter.locked {
        if job.locked_at.is_some() != locked {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(name: &str) -> Job {
        Job::new(name, serde_json::json!(null))
    }

    #[tokio::test]
    async fn single_type_upserts_to_one_row() {
        let repo = MemoryJobRepository::new();
        let mut first = job("heartbeat");
        first.job_type = JobType::Single;
        let saved = repo.save_job(first.clone()).await.unwrap();

        let mut second = job("heartbeat");
        second.job_type = JobType::Single;
        second.recurrence.interval = Some("10 seconds".into());
        let resaved = repo.save_job(second).await.unwrap();

        assert_eq!(saved.id, resaved.id);
        let (rows, total) = repo
            .query_jobs(&JobFilter { name: Some("heartbeat".into()), ..Default::default() }, SortSpec::default(), 0, 10)
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].recurrence.interval.as_deref(), Some("10 seconds"));
    }

    #[tokio::test]
    async fn get_next_job_to_run_locks_exactly_one_row() {
        let repo = MemoryJobRepository::new();
        let now = Utc::now();
        let mut due = job("ping");
        due.next_run_at = Some(now - chrono::Duration::seconds(1));
        repo.save_job(due).await.unwrap();

        let locked = repo
            .get_next_job_to_run("ping", now, now - chrono::Duration::minutes(10), now)
            .await
            .unwrap();
        assert!(locked.is_some());

        let second_attempt = repo
            .get_next_job_to_run("ping", now, now - chrono::Duration::minutes(10), now)
            .await
            .unwrap();
        assert!(second_attempt.is_none(), "row is already locked, so a concurrent claim must miss");
    }

    #[tokio::test]
    async fn lock_job_by_id_rejects_stale_expectation() {
        let repo = MemoryJobRepository::new();
        let now = Utc::now();
        let mut j = job("ping");
        j.next_run_at = Some(now);
        let saved = repo.save_job(j).await.unwrap();

        let result = repo
            .lock_job_by_id(saved.id.unwrap(), Some(now - chrono::Duration::seconds(5)), now)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn save_job_state_on_removed_row_is_stale() {
        let repo = MemoryJobRepository::new();
        let mut j = job("ping");
        j.id = Some(JobId::new());
        let err = repo.save_job_state(&j).await.unwrap_err();
        assert!(matches!(err, AgendaError::StaleJob(_)));
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let repo = MemoryJobRepository::new();
        repo.save_job(job("ping")).await.unwrap();
        let filter = JobFilter { name: Some("ping".into()), ..Default::default() };
        assert_eq!(repo.cancel(&filter).await.unwrap(), 1);
        assert_eq!(repo.cancel(&filter).await.unwrap(), 0);
    }
}
