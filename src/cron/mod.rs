//! Persistent cron-like scheduling: one-shot, interval, and weekly jobs
//! firing bash commands or orchestrator prompts.
//!
//! A minute ticker evaluates type-specific predicates against wall-clock
//! time. Firing never blocks the tick; job bodies run on their own tasks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDateTime, Timelike, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::db::Database;
use crate::orchestrator::{NoopStatus, Orchestrator, PromptRequest};

/// Synthetic channel for prompt jobs; keeps abort keys and continuations
/// separate from real chat channels.
pub const CRON_CHANNEL: &str = "cron";

const SQLITE_TS: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    OneTime,
    Interval,
    Schedule,
}

impl JobType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "one_time" => Some(JobType::OneTime),
            "interval" => Some(JobType::Interval),
            "schedule" => Some(JobType::Schedule),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::OneTime => "one_time",
            JobType::Interval => "interval",
            JobType::Schedule => "schedule",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CronAction {
    Bash { command: String },
    Prompt { text: String },
}

/// Weekly slot: days use 0=Sunday .. 6=Saturday.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub days: Vec<u8>,
    pub hour: u8,
    pub minute: u8,
}

impl Schedule {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.days.is_empty() {
            anyhow::bail!("schedule.days must not be empty");
        }
        if self.days.iter().any(|d| *d > 6) {
            anyhow::bail!("schedule.days entries must be 0..6");
        }
        if self.hour > 23 {
            anyhow::bail!("schedule.hour must be 0..23");
        }
        if self.minute > 59 {
            anyhow::bail!("schedule.minute must be 0..59");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CronJob {
    pub id: i64,
    pub job_type: JobType,
    pub action: CronAction,
    pub schedule: Option<Schedule>,
    pub time: Option<DateTime<Utc>>,
    pub interval_ms: Option<i64>,
    pub disabled: bool,
    pub last_fired: Option<DateTime<Utc>>,
    pub created_at: String,
}

/// Validated input for job creation; see [`NewJob::from_spec`] for the
/// accepted loose shapes.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: JobType,
    pub action: CronAction,
    pub schedule: Option<Schedule>,
    pub time: Option<DateTime<Utc>>,
    pub interval_ms: Option<i64>,
}

impl NewJob {
    /// Normalize the loose tool-facing shape: `delay` seconds becomes a
    /// future `time`, a bare `message` becomes a prompt action, and required
    /// fields are validated per type.
    pub fn from_spec(spec: &serde_json::Value, now: DateTime<Utc>) -> anyhow::Result<Self> {
        let type_str = spec["type"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing required 'type'"))?;
        let job_type = JobType::parse(type_str)
            .ok_or_else(|| anyhow::anyhow!("Unknown type '{type_str}'"))?;

        let action = if let Some(action) = spec.get("action").filter(|a| !a.is_null()) {
            serde_json::from_value(action.clone())
                .map_err(|e| anyhow::anyhow!("Invalid action: {e}"))?
        } else if let Some(message) = spec["message"].as_str() {
            CronAction::Prompt {
                text: message.to_string(),
            }
        } else if let Some(command) = spec["command"].as_str() {
            CronAction::Bash {
                command: command.to_string(),
            }
        } else {
            anyhow::bail!("Missing 'action' (or 'message'/'command' shorthand)");
        };

        let time = if let Some(delay) = spec["delay"].as_i64() {
            Some(now + chrono::Duration::seconds(delay))
        } else if let Some(raw) = spec["time"].as_str() {
            Some(parse_time(raw)?)
        } else {
            None
        };

        let interval_ms = spec["interval_ms"].as_i64();
        let schedule: Option<Schedule> = match spec.get("schedule").filter(|s| !s.is_null()) {
            Some(raw) => Some(
                serde_json::from_value(raw.clone())
                    .map_err(|e| anyhow::anyhow!("Invalid schedule: {e}"))?,
            ),
            None => None,
        };

        match job_type {
            JobType::OneTime if time.is_none() => {
                anyhow::bail!("one_time jobs need 'time' or 'delay'")
            }
            JobType::Interval if interval_ms.is_none() => {
                anyhow::bail!("interval jobs need 'interval_ms'")
            }
            JobType::Interval if interval_ms.is_some_and(|ms| ms <= 0) => {
                anyhow::bail!("interval_ms must be positive")
            }
            JobType::Schedule => match &schedule {
                Some(s) => s.validate()?,
                None => anyhow::bail!("schedule jobs need 'schedule'"),
            },
            _ => {}
        }

        Ok(Self {
            job_type,
            action,
            schedule,
            time,
            interval_ms,
        })
    }
}

fn parse_time(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Ok(t.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, SQLITE_TS)
        .map_err(|e| anyhow::anyhow!("Invalid time '{raw}': {e}"))?;
    Ok(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}

fn format_time(t: DateTime<Utc>) -> String {
    t.format(SQLITE_TS).to_string()
}

fn parse_stored_time(raw: Option<String>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    NaiveDateTime::parse_from_str(&raw, SQLITE_TS)
        .ok()
        .map(|n| DateTime::<Utc>::from_naive_utc_and_offset(n, Utc))
}

/// Type-specific fire predicate. Pure so the minute-boundary behavior is
/// testable with fixed clocks.
pub fn should_fire(job: &CronJob, now: DateTime<Utc>) -> bool {
    if job.disabled {
        return false;
    }
    match job.job_type {
        JobType::OneTime => job.time.is_some_and(|t| now >= t),
        JobType::Interval => match job.interval_ms {
            Some(ms) => match job.last_fired {
                None => true,
                Some(last) => now.signed_duration_since(last).num_milliseconds() >= ms,
            },
            None => false,
        },
        JobType::Schedule => {
            let Some(schedule) = &job.schedule else {
                return false;
            };
            let day = now.weekday().num_days_from_sunday() as u8;
            schedule.days.contains(&day)
                && now.hour() == schedule.hour as u32
                && now.minute() == schedule.minute as u32
                && job.last_fired.is_none_or(|last| !same_minute(last, now))
        }
    }
}

fn same_minute(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.timestamp() / 60 == b.timestamp() / 60
}

#[derive(Clone)]
pub struct CronStore {
    db: Database,
}

impl CronStore {
    pub fn new(db: Database) -> anyhow::Result<Self> {
        let store = Self { db };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> anyhow::Result<()> {
        let conn = self.db.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cron_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                type TEXT NOT NULL,
                action TEXT NOT NULL,
                schedule TEXT,
                time TEXT,
                interval_ms INTEGER,
                disabled INTEGER NOT NULL DEFAULT 0,
                last_fired TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );",
        )?;
        Ok(())
    }

    pub async fn run<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&CronStore) -> anyhow::Result<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store)).await?
    }

    pub fn create(&self, new: &NewJob) -> anyhow::Result<i64> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO cron_jobs (type, action, schedule, time, interval_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                new.job_type.as_str(),
                serde_json::to_string(&new.action)?,
                new.schedule
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                new.time.map(format_time),
                new.interval_ms,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list(&self) -> anyhow::Result<Vec<CronJob>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, type, action, schedule, time, interval_ms, disabled,
                    last_fired, created_at
             FROM cron_jobs ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<i64>>(5)?,
                row.get::<_, bool>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;

        let mut jobs = Vec::new();
        for row in rows {
            let (id, type_str, action, schedule, time, interval_ms, disabled, last_fired, created_at) =
                row?;
            let Some(job_type) = JobType::parse(&type_str) else {
                error!("Cron job {id} has unknown type '{type_str}'; skipping");
                continue;
            };
            jobs.push(CronJob {
                id,
                job_type,
                action: serde_json::from_str(&action)?,
                schedule: schedule.map(|s| serde_json::from_str(&s)).transpose()?,
                time: parse_stored_time(time),
                interval_ms,
                disabled,
                last_fired: parse_stored_time(last_fired),
                created_at,
            });
        }
        Ok(jobs)
    }

    pub fn get(&self, id: i64) -> anyhow::Result<Option<CronJob>> {
        Ok(self.list()?.into_iter().find(|j| j.id == id))
    }

    pub fn delete(&self, id: i64) -> anyhow::Result<bool> {
        let conn = self.db.lock();
        let n = conn.execute("DELETE FROM cron_jobs WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    pub fn set_disabled(&self, id: i64, disabled: bool) -> anyhow::Result<bool> {
        let conn = self.db.lock();
        let n = conn.execute(
            "UPDATE cron_jobs SET disabled = ?1 WHERE id = ?2",
            params![disabled, id],
        )?;
        Ok(n > 0)
    }

    pub fn mark_fired(&self, id: i64, at: DateTime<Utc>) -> anyhow::Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE cron_jobs SET last_fired = ?1 WHERE id = ?2",
            params![format_time(at), id],
        )?;
        Ok(())
    }

    pub fn exists(&self, id: i64) -> anyhow::Result<bool> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare("SELECT 1 FROM cron_jobs WHERE id = ?1")?;
        Ok(stmt.query_row([id], |_| Ok(())).optional()?.is_some())
    }
}

/// Seam for prompt-action jobs; production wires the orchestrator in, tests
/// record calls.
#[async_trait]
pub trait PromptRunner: Send + Sync {
    async fn run_cron_prompt(&self, text: String);
}

#[async_trait]
impl PromptRunner for Orchestrator {
    async fn run_cron_prompt(&self, text: String) {
        let request = PromptRequest {
            prompt: text,
            channel: CRON_CHANNEL.to_string(),
            user: self.default_user(),
            ..Default::default()
        };
        if let Err(e) = self.run_prompt(request, &NoopStatus).await {
            error!("Cron prompt failed: {e:#}");
        }
    }
}

pub struct Scheduler {
    store: CronStore,
    runner: Arc<dyn PromptRunner>,
}

impl Scheduler {
    pub fn new(store: CronStore, runner: Arc<dyn PromptRunner>) -> Self {
        Self { store, runner }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = self.tick(Utc::now()).await {
                error!("Cron tick failed: {e:#}");
            }
        }
    }

    /// Evaluate every enabled job against `now` and fire the due ones.
    /// Job bodies run detached; the tick never waits on them.
    pub async fn tick(&self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let jobs = self.store.run(|s| s.list()).await?;
        for job in jobs {
            if !should_fire(&job, now) {
                continue;
            }
            info!("Cron job {} firing ({})", job.id, job.job_type.as_str());

            match job.job_type {
                JobType::OneTime => {
                    let id = job.id;
                    self.store.run(move |s| s.delete(id).map(|_| ())).await?;
                }
                _ => {
                    let id = job.id;
                    self.store.run(move |s| s.mark_fired(id, now)).await?;
                }
            }

            match job.action {
                CronAction::Bash { command } => {
                    tokio::spawn(async move {
                        match tokio::process::Command::new("/bin/sh")
                            .arg("-c")
                            .arg(&command)
                            .output()
                            .await
                        {
                            Ok(output) if !output.status.success() => {
                                error!(
                                    "Cron bash command failed ({}): {}",
                                    output.status,
                                    String::from_utf8_lossy(&output.stderr).trim()
                                );
                            }
                            Ok(_) => {}
                            Err(e) => error!("Cron bash command did not start: {e}"),
                        }
                    });
                }
                CronAction::Prompt { text } => {
                    let runner = self.runner.clone();
                    tokio::spawn(async move {
                        runner.run_cron_prompt(text).await;
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Mutex;

    fn store() -> CronStore {
        CronStore::new(Database::open_in_memory().unwrap()).unwrap()
    }

    fn job(job_type: JobType) -> CronJob {
        CronJob {
            id: 1,
            job_type,
            action: CronAction::Bash {
                command: "true".to_string(),
            },
            schedule: None,
            time: None,
            interval_ms: None,
            disabled: false,
            last_fired: None,
            created_at: String::new(),
        }
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_one_time_predicate() {
        let mut j = job(JobType::OneTime);
        j.time = Some(utc(2025, 6, 2, 9, 0, 0));

        assert!(!should_fire(&j, utc(2025, 6, 2, 8, 59, 59)));
        assert!(should_fire(&j, utc(2025, 6, 2, 9, 0, 0)));
        assert!(should_fire(&j, utc(2025, 6, 3, 0, 0, 0)));
    }

    #[test]
    fn test_interval_predicate() {
        let mut j = job(JobType::Interval);
        j.interval_ms = Some(60_000);

        assert!(should_fire(&j, utc(2025, 6, 2, 9, 0, 0)), "never fired yet");

        j.last_fired = Some(utc(2025, 6, 2, 9, 0, 0));
        assert!(!should_fire(&j, utc(2025, 6, 2, 9, 0, 30)));
        assert!(should_fire(&j, utc(2025, 6, 2, 9, 1, 0)));
    }

    #[test]
    fn test_schedule_fires_once_per_due_minute() {
        // 2025-06-02 is a Monday; days use 0=Sunday.
        let mut j = job(JobType::Schedule);
        j.schedule = Some(Schedule {
            days: vec![1],
            hour: 9,
            minute: 0,
        });

        assert!(should_fire(&j, utc(2025, 6, 2, 9, 0, 10)));

        // Tick jitter: a second evaluation within the same minute must not
        // fire again.
        j.last_fired = Some(utc(2025, 6, 2, 9, 0, 10));
        assert!(!should_fire(&j, utc(2025, 6, 2, 9, 0, 55)));

        // The following Monday fires again.
        assert!(should_fire(&j, utc(2025, 6, 9, 9, 0, 5)));

        // Wrong minute, wrong hour, wrong day.
        j.last_fired = None;
        assert!(!should_fire(&j, utc(2025, 6, 2, 9, 1, 0)));
        assert!(!should_fire(&j, utc(2025, 6, 2, 10, 0, 0)));
        assert!(!should_fire(&j, utc(2025, 6, 3, 9, 0, 0)));
    }

    #[test]
    fn test_disabled_never_fires() {
        let mut j = job(JobType::Interval);
        j.interval_ms = Some(1);
        j.disabled = true;
        assert!(!should_fire(&j, Utc::now()));
    }

    #[test]
    fn test_new_job_delay_normalized() {
        let now = utc(2025, 6, 2, 12, 0, 0);
        let new = NewJob::from_spec(
            &json!({"type": "one_time", "delay": 90, "command": "echo hi"}),
            now,
        )
        .unwrap();
        assert_eq!(new.time, Some(utc(2025, 6, 2, 12, 1, 30)));
        assert_eq!(
            new.action,
            CronAction::Bash {
                command: "echo hi".to_string()
            }
        );
    }

    #[test]
    fn test_new_job_message_becomes_prompt() {
        let new = NewJob::from_spec(
            &json!({"type": "interval", "interval_ms": 1000, "message": "check the oven"}),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(
            new.action,
            CronAction::Prompt {
                text: "check the oven".to_string()
            }
        );
    }

    #[test]
    fn test_new_job_validation() {
        let now = Utc::now();
        assert!(NewJob::from_spec(&json!({"type": "one_time", "command": "x"}), now).is_err());
        assert!(NewJob::from_spec(&json!({"type": "interval", "command": "x"}), now).is_err());
        assert!(NewJob::from_spec(
            &json!({"type": "interval", "interval_ms": -5, "command": "x"}),
            now
        )
        .is_err());
        assert!(NewJob::from_spec(&json!({"type": "schedule", "command": "x"}), now).is_err());
        assert!(NewJob::from_spec(
            &json!({"type": "schedule", "command": "x",
                    "schedule": {"days": [9], "hour": 9, "minute": 0}}),
            now
        )
        .is_err());
        assert!(NewJob::from_spec(&json!({"type": "nope", "command": "x"}), now).is_err());
        assert!(NewJob::from_spec(&json!({"type": "one_time", "delay": 5}), now).is_err());
    }

    #[test]
    fn test_store_round_trip() {
        let store = store();
        let id = store
            .create(&NewJob {
                job_type: JobType::Schedule,
                action: CronAction::Prompt {
                    text: "morning briefing".to_string(),
                },
                schedule: Some(Schedule {
                    days: vec![1, 3],
                    hour: 7,
                    minute: 30,
                }),
                time: None,
                interval_ms: None,
            })
            .unwrap();

        let jobs = store.list().unwrap();
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.id, id);
        assert_eq!(job.job_type, JobType::Schedule);
        assert_eq!(
            job.schedule,
            Some(Schedule {
                days: vec![1, 3],
                hour: 7,
                minute: 30
            })
        );
        assert!(!job.disabled);

        assert!(store.set_disabled(id, true).unwrap());
        assert!(store.list().unwrap()[0].disabled);

        assert!(store.delete(id).unwrap());
        assert!(store.list().unwrap().is_empty());
    }

    struct RecordingRunner {
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PromptRunner for RecordingRunner {
        async fn run_cron_prompt(&self, text: String) {
            self.prompts.lock().unwrap().push(text);
        }
    }

    #[tokio::test]
    async fn test_tick_deletes_one_time_after_fire() {
        let store = store();
        let now = Utc::now();
        store
            .create(&NewJob {
                job_type: JobType::OneTime,
                action: CronAction::Bash {
                    command: "true".to_string(),
                },
                schedule: None,
                time: Some(now - chrono::Duration::seconds(5)),
                interval_ms: None,
            })
            .unwrap();

        let runner = Arc::new(RecordingRunner {
            prompts: Mutex::new(Vec::new()),
        });
        let scheduler = Scheduler::new(store.clone(), runner);
        scheduler.tick(now).await.unwrap();

        assert!(store.list().unwrap().is_empty(), "one_time deleted on fire");
    }

    #[tokio::test]
    async fn test_tick_marks_interval_and_runs_prompt() {
        let store = store();
        let now = Utc::now();
        let id = store
            .create(&NewJob {
                job_type: JobType::Interval,
                action: CronAction::Prompt {
                    text: "water the plants".to_string(),
                },
                schedule: None,
                time: None,
                interval_ms: Some(60_000),
            })
            .unwrap();

        let runner = Arc::new(RecordingRunner {
            prompts: Mutex::new(Vec::new()),
        });
        let scheduler = Scheduler::new(store.clone(), runner.clone());
        scheduler.tick(now).await.unwrap();

        // The prompt task is detached; give it a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            runner.prompts.lock().unwrap().as_slice(),
            ["water the plants"]
        );
        assert!(store.get(id).unwrap().unwrap().last_fired.is_some());

        // Within the interval the second tick is a no-op.
        scheduler.tick(now + chrono::Duration::seconds(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runner.prompts.lock().unwrap().len(), 1);
    }
}
