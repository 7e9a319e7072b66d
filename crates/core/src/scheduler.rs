//! Trigger scheduling. Cron triggers are parsed in their own IANA
//! timezone and kept in a single priority queue keyed by next-fire
//! time, with exactly one pending entry per trigger. Event triggers are
//! push-only: the scheduler registers interest and creates a run when
//! the source notifies. Manual triggers never schedule anything.

use crate::engine::Engine;
use crate::error::ScheduleError;
use crate::storage::RunStore;
use crate::types::{Trigger, TriggerReason, TriggerRecord, WorkflowId};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Guard against a window/cron combination that can never fire
const MAX_WINDOW_SCANS: u32 = 400;

/// Validate a trigger without scheduling it. Misconfiguration is
/// rejected here, at trigger-set time, never silently ignored.
pub fn validate_trigger(trigger: &Trigger) -> Result<(), ScheduleError> {
    if let Trigger::Cron {
        expression,
        timezone,
        window_start,
        window_end,
    } = trigger
    {
        parse_cron(expression)?;
        parse_timezone(timezone)?;
        match (window_start, window_end) {
            (None, None) => {}
            (Some(start), Some(end)) if start < end => {}
            (Some(start), Some(end)) => {
                return Err(ScheduleError::InvalidWindow {
                    start: start.to_string(),
                    end: end.to_string(),
                })
            }
            _ => return Err(ScheduleError::IncompleteWindow),
        }
    }
    Ok(())
}

/// Compute the next fire time at or after `now`, honoring the trigger's
/// timezone and execution window. `Manual` and `Event` triggers never
/// produce a scheduled time.
pub fn next_fire(trigger: &Trigger, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let Trigger::Cron {
        expression,
        timezone,
        window_start,
        window_end,
    } = trigger
    else {
        return Ok(None);
    };

    let schedule = parse_cron(expression)?;
    let tz = parse_timezone(timezone)?;

    // `Schedule::after` is exclusive; back up one second so a fire time
    // exactly at `now` is still found
    let mut cursor = now - chrono::Duration::seconds(1);

    for _ in 0..MAX_WINDOW_SCANS {
        let Some(fire) = schedule.after(&cursor.with_timezone(&tz)).next() else {
            return Ok(None);
        };

        let (Some(start), Some(end)) = (window_start, window_end) else {
            return Ok(Some(fire.with_timezone(&Utc)));
        };

        let fire_time = fire.time();
        if fire_time >= *start && fire_time < *end {
            return Ok(Some(fire.with_timezone(&Utc)));
        }

        // Outside the window: advance to the window start (same day if
        // the fire came early, next day otherwise) and re-evaluate, so a
        // fire that merely misses the window is moved rather than
        // silently skipped
        let date = if fire_time < *start {
            fire.date_naive()
        } else {
            fire.date_naive() + chrono::Duration::days(1)
        };
        cursor = window_open(&tz, date, *start) - chrono::Duration::seconds(1);
    }

    Ok(None)
}

/// What a trigger should do when the process comes back up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupPlan {
    /// The persisted fire time was missed while down: fire once
    /// immediately, then resume the normal cadence
    CatchUpThen { next: Option<DateTime<Utc>> },
    /// Nothing was missed; wait for the next computed fire
    WaitUntil(DateTime<Utc>),
    /// The trigger never fires on a clock (manual/event) or the
    /// schedule is exhausted
    Idle,
}

/// Decide the startup behavior for a trigger given the fire time that
/// was persisted before shutdown. Missed fires are caught up at most
/// once, never backfilled per missed occurrence.
pub fn plan_startup(
    trigger: &Trigger,
    persisted_next: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<StartupPlan, ScheduleError> {
    if !matches!(trigger, Trigger::Cron { .. }) {
        return Ok(StartupPlan::Idle);
    }

    if let Some(missed) = persisted_next.filter(|t| *t <= now) {
        tracing::info!("catching up missed fire at {missed} (once)");
        return Ok(StartupPlan::CatchUpThen {
            next: next_fire(trigger, now)?,
        });
    }

    match next_fire(trigger, now)? {
        Some(at) => Ok(StartupPlan::WaitUntil(at)),
        None => Ok(StartupPlan::Idle),
    }
}

fn parse_cron(expression: &str) -> Result<cron::Schedule, ScheduleError> {
    // The cron crate wants a seconds field; accept the standard
    // five-field form by pinning seconds to zero
    let fields = expression.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {expression}"),
        6 | 7 => expression.to_string(),
        _ => {
            return Err(ScheduleError::InvalidCron {
                expression: expression.to_string(),
                reason: format!("expected 5 to 7 fields, got {fields}"),
            })
        }
    };
    cron::Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

fn parse_timezone(timezone: &str) -> Result<Tz, ScheduleError> {
    timezone.parse().map_err(|_| ScheduleError::UnknownTimezone {
        timezone: timezone.to_string(),
    })
}

/// Window opening instant on `date` in `tz`, expressed in UTC
fn window_open(tz: &Tz, mut date: NaiveDate, start: NaiveTime) -> DateTime<Utc> {
    loop {
        // `earliest` skips local times that a DST gap swallowed
        if let Some(open) = tz.from_local_datetime(&date.and_time(start)).earliest() {
            return open.with_timezone(&Utc);
        }
        date += chrono::Duration::days(1);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FireEntry {
    at: DateTime<Utc>,
    workflow_id: WorkflowId,
    generation: u64,
}

impl Ord for FireEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at
            .cmp(&other.at)
            .then_with(|| self.workflow_id.0.cmp(&other.workflow_id.0))
    }
}

impl PartialOrd for FireEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Scheduler service: owns the cron fire queue and event-source
/// bindings, and creates runs through the engine.
pub struct Scheduler {
    store: Arc<RunStore>,
    engine: Arc<Engine>,
    queue: Mutex<BinaryHeap<Reverse<FireEntry>>>,
    /// Latest generation per workflow; stale heap entries are discarded
    /// on pop, which keeps exactly one live entry per trigger
    generations: Mutex<HashMap<WorkflowId, u64>>,
    bindings: Mutex<HashMap<String, HashSet<WorkflowId>>>,
    generation_counter: AtomicU64,
    wake: Notify,
}

impl Scheduler {
    pub fn new(store: Arc<RunStore>, engine: Arc<Engine>) -> Arc<Self> {
        Arc::new(Self {
            store,
            engine,
            queue: Mutex::new(BinaryHeap::new()),
            generations: Mutex::new(HashMap::new()),
            bindings: Mutex::new(HashMap::new()),
            generation_counter: AtomicU64::new(0),
            wake: Notify::new(),
        })
    }

    /// Install or replace the active trigger for a workflow. The
    /// replacement is atomic: persisting the record supersedes the old
    /// trigger, and any stale queue entry dies by generation check.
    pub fn set_trigger(&self, workflow_id: WorkflowId, trigger: Trigger) -> Result<TriggerRecord> {
        validate_trigger(&trigger)?;
        let next = next_fire(&trigger, Utc::now())?;

        let record = TriggerRecord {
            workflow_id,
            trigger: trigger.clone(),
            next_fire: next,
            updated_at: Utc::now(),
        };
        self.store.set_trigger(&record).context("failed to persist trigger")?;

        self.rebind_event_source(workflow_id, &trigger);
        let generation = self.bump_generation(workflow_id);
        if let Some(at) = next {
            self.push_entry(FireEntry {
                at,
                workflow_id,
                generation,
            });
        }
        self.wake.notify_one();

        tracing::info!("trigger for workflow {workflow_id} set, next fire {next:?}");
        Ok(record)
    }

    /// Notify an external event source; creates a run for every
    /// workflow bound to it.
    pub fn notify_event(&self, source_id: &str) -> Vec<crate::types::RunId> {
        let workflows: Vec<WorkflowId> = self
            .bindings
            .lock()
            .expect("bindings lock poisoned")
            .get(source_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();

        let mut runs = Vec::new();
        for workflow_id in workflows {
            match self.engine.start_run(
                workflow_id,
                TriggerReason::Event {
                    source_id: source_id.to_string(),
                },
            ) {
                Ok(run_id) => runs.push(run_id),
                Err(e) => {
                    tracing::error!("event {source_id} failed to start workflow {workflow_id}: {e}")
                }
            }
        }
        runs
    }

    /// Load persisted triggers, catch up missed cron fires (once each),
    /// and run the fire loop until the scheduler is dropped.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = scheduler.restore().await {
                tracing::error!("scheduler restore failed: {e:#}");
            }
            scheduler.fire_loop().await;
        })
    }

    async fn restore(&self) -> Result<()> {
        let now = Utc::now();
        for record in self.store.list_triggers()? {
            self.rebind_event_source(record.workflow_id, &record.trigger);

            match plan_startup(&record.trigger, record.next_fire, now)? {
                StartupPlan::CatchUpThen { next } => {
                    self.fire(record.workflow_id, now).await;
                    self.persist_next(record.workflow_id, &record.trigger, next)?;
                    if let Some(at) = next {
                        let generation = self.bump_generation(record.workflow_id);
                        self.push_entry(FireEntry {
                            at,
                            workflow_id: record.workflow_id,
                            generation,
                        });
                    }
                }
                StartupPlan::WaitUntil(at) => {
                    let generation = self.bump_generation(record.workflow_id);
                    self.push_entry(FireEntry {
                        at,
                        workflow_id: record.workflow_id,
                        generation,
                    });
                }
                StartupPlan::Idle => {}
            }
        }
        Ok(())
    }

    async fn fire_loop(&self) {
        loop {
            let next = self.peek_live();

            match next {
                Some(entry) => {
                    let now = Utc::now();
                    if entry.at > now {
                        let wait = (entry.at - now)
                            .to_std()
                            .unwrap_or(std::time::Duration::from_secs(0));
                        tokio::select! {
                            _ = tokio::time::sleep(wait) => {}
                            _ = self.wake.notified() => continue,
                        }
                    }

                    let Some(due) = self.pop_if_due(Utc::now()) else {
                        continue;
                    };
                    self.fire(due.workflow_id, due.at).await;

                    // Re-derive the next fire immediately so the trigger
                    // keeps exactly one pending entry
                    if let Ok(Some(record)) = self.store.get_trigger(&due.workflow_id) {
                        match next_fire(&record.trigger, Utc::now()) {
                            Ok(next) => {
                                if let Err(e) =
                                    self.persist_next(due.workflow_id, &record.trigger, next)
                                {
                                    tracing::error!("failed to persist next fire: {e:#}");
                                }
                                if let Some(at) = next {
                                    let generation = self.bump_generation(due.workflow_id);
                                    self.push_entry(FireEntry {
                                        at,
                                        workflow_id: due.workflow_id,
                                        generation,
                                    });
                                }
                            }
                            Err(e) => tracing::error!(
                                "stored trigger for {} is no longer valid: {e}",
                                due.workflow_id
                            ),
                        }
                    }
                }
                None => self.wake.notified().await,
            }
        }
    }

    async fn fire(&self, workflow_id: WorkflowId, fire_time: DateTime<Utc>) {
        match self
            .engine
            .start_run(workflow_id, TriggerReason::Scheduled { fire_time })
        {
            Ok(run_id) => {
                tracing::info!("cron fired workflow {workflow_id}: run {run_id}");
            }
            Err(e) => tracing::error!("cron fire failed for workflow {workflow_id}: {e}"),
        }
    }

    fn persist_next(
        &self,
        workflow_id: WorkflowId,
        trigger: &Trigger,
        next: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.store.set_trigger(&TriggerRecord {
            workflow_id,
            trigger: trigger.clone(),
            next_fire: next,
            updated_at: Utc::now(),
        })
    }

    fn bump_generation(&self, workflow_id: WorkflowId) -> u64 {
        let generation = self.generation_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.generations
            .lock()
            .expect("generations lock poisoned")
            .insert(workflow_id, generation);
        generation
    }

    fn push_entry(&self, entry: FireEntry) {
        self.queue
            .lock()
            .expect("queue lock poisoned")
            .push(Reverse(entry));
        self.wake.notify_one();
    }

    fn is_live(&self, entry: &FireEntry) -> bool {
        self.generations
            .lock()
            .expect("generations lock poisoned")
            .get(&entry.workflow_id)
            .map(|g| *g == entry.generation)
            .unwrap_or(false)
    }

    fn peek_live(&self) -> Option<FireEntry> {
        let mut queue = self.queue.lock().expect("queue lock poisoned");
        while let Some(Reverse(entry)) = queue.peek().cloned() {
            if self.is_live(&entry) {
                return Some(entry);
            }
            queue.pop();
        }
        None
    }

    fn pop_if_due(&self, now: DateTime<Utc>) -> Option<FireEntry> {
        let mut queue = self.queue.lock().expect("queue lock poisoned");
        match queue.peek() {
            Some(Reverse(entry)) if entry.at <= now && self.is_live(entry) => {
                queue.pop().map(|Reverse(e)| e)
            }
            _ => None,
        }
    }

    fn rebind_event_source(&self, workflow_id: WorkflowId, trigger: &Trigger) {
        let mut bindings = self.bindings.lock().expect("bindings lock poisoned");
        for bound in bindings.values_mut() {
            bound.remove(&workflow_id);
        }
        if let Trigger::Event { source_id } = trigger {
            bindings
                .entry(source_id.clone())
                .or_default()
                .insert(workflow_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn cron(expression: &str, timezone: &str) -> Trigger {
        Trigger::Cron {
            expression: expression.to_string(),
            timezone: timezone.to_string(),
            window_start: None,
            window_end: None,
        }
    }

    fn windowed(expression: &str, timezone: &str, start: (u32, u32), end: (u32, u32)) -> Trigger {
        Trigger::Cron {
            expression: expression.to_string(),
            timezone: timezone.to_string(),
            window_start: NaiveTime::from_hms_opt(start.0, start.1, 0),
            window_end: NaiveTime::from_hms_opt(end.0, end.1, 0),
        }
    }

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn manual_and_event_triggers_never_schedule() {
        assert_eq!(next_fire(&Trigger::Manual, Utc::now()).unwrap(), None);
        assert_eq!(
            next_fire(
                &Trigger::Event {
                    source_id: "hook".to_string()
                },
                Utc::now()
            )
            .unwrap(),
            None
        );
    }

    #[test]
    fn five_field_cron_finds_next_daily_fire() {
        let trigger = cron("0 9 * * *", "UTC");
        let next = next_fire(&trigger, utc("2026-08-07T08:00:00Z")).unwrap().unwrap();
        assert_eq!(next, utc("2026-08-07T09:00:00Z"));

        let next = next_fire(&trigger, utc("2026-08-07T09:30:00Z")).unwrap().unwrap();
        assert_eq!(next, utc("2026-08-08T09:00:00Z"));
    }

    #[test]
    fn fire_exactly_at_now_is_not_skipped() {
        let trigger = cron("0 9 * * *", "UTC");
        let next = next_fire(&trigger, utc("2026-08-07T09:00:00Z")).unwrap().unwrap();
        assert_eq!(next, utc("2026-08-07T09:00:00Z"));
    }

    #[test]
    fn timezone_shifts_the_fire_into_utc() {
        // 09:00 in New York is 13:00 UTC during DST
        let trigger = cron("0 9 * * *", "America/New_York");
        let next = next_fire(&trigger, utc("2026-08-07T00:00:00Z")).unwrap().unwrap();
        assert_eq!(next, utc("2026-08-07T13:00:00Z"));
    }

    #[test]
    fn fire_outside_window_moves_to_next_window_day() {
        // Fires at 17:00 daily, window is 09:00-09:30: the 17:00 fire
        // must be advanced, not dropped
        let trigger = windowed("0 17 * * *", "UTC", (9, 0), (9, 30));
        let next = next_fire(&trigger, utc("2026-08-07T08:00:00Z")).unwrap();
        // After advancing to the next window open, the cron has a fire
        // at 17:00 again; it can never land inside the window
        assert_eq!(next, None);
    }

    #[test]
    fn late_fire_is_moved_to_the_next_window_open() {
        // Hourly cron, window 09:00-09:30: the 10:00 fire is outside,
        // so the next in-window fire is tomorrow at 09:00
        let trigger = windowed("0 * * * *", "UTC", (9, 0), (9, 30));
        let next = next_fire(&trigger, utc("2026-08-07T09:50:00Z")).unwrap().unwrap();
        assert_eq!(next, utc("2026-08-08T09:00:00Z"));
    }

    #[test]
    fn early_fire_is_moved_to_the_same_day_window_open() {
        let trigger = windowed("0 * * * *", "UTC", (9, 0), (9, 30));
        let next = next_fire(&trigger, utc("2026-08-07T05:00:00Z")).unwrap().unwrap();
        assert_eq!(next, utc("2026-08-07T09:00:00Z"));
    }

    #[test]
    fn fire_inside_window_is_kept() {
        let trigger = windowed("15 9 * * *", "UTC", (9, 0), (9, 30));
        let next = next_fire(&trigger, utc("2026-08-07T00:00:00Z")).unwrap().unwrap();
        assert_eq!(next, utc("2026-08-07T09:15:00Z"));
    }

    #[test]
    fn window_end_is_exclusive() {
        let trigger = windowed("30 9 * * *", "UTC", (9, 0), (9, 30));
        assert_eq!(next_fire(&trigger, utc("2026-08-07T00:00:00Z")).unwrap(), None);
    }

    #[test]
    fn missed_fire_catches_up_once_then_resumes_cadence() {
        // Daily 09:00 UTC fire with a 09:00-09:30 window; the process
        // restarts at 09:45 having missed today's fire
        let trigger = windowed("0 9 * * *", "UTC", (9, 0), (9, 30));
        let persisted = Some(utc("2026-08-07T09:00:00Z"));
        let now = utc("2026-08-07T09:45:00Z");

        let plan = plan_startup(&trigger, persisted, now).unwrap();
        match plan {
            StartupPlan::CatchUpThen { next } => {
                assert_eq!(next, Some(utc("2026-08-08T09:00:00Z")));
            }
            other => panic!("expected catch-up, got {other:?}"),
        }
    }

    #[test]
    fn nothing_missed_waits_for_next_fire() {
        let trigger = cron("0 9 * * *", "UTC");
        let persisted = Some(utc("2026-08-08T09:00:00Z"));
        let now = utc("2026-08-07T10:00:00Z");

        let plan = plan_startup(&trigger, persisted, now).unwrap();
        assert_eq!(plan, StartupPlan::WaitUntil(utc("2026-08-08T09:00:00Z")));
    }

    #[test]
    fn manual_trigger_is_idle_at_startup() {
        let plan = plan_startup(&Trigger::Manual, None, Utc::now()).unwrap();
        assert_eq!(plan, StartupPlan::Idle);
    }

    #[test]
    fn invalid_cron_is_rejected_at_set_time() {
        let err = validate_trigger(&cron("not a cron", "UTC")).unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidCron { .. }));

        let err = validate_trigger(&cron("0 9 * * *", "Mars/Olympus")).unwrap_err();
        assert!(matches!(err, ScheduleError::UnknownTimezone { .. }));
    }

    #[test]
    fn inverted_window_is_rejected() {
        let err = validate_trigger(&windowed("0 9 * * *", "UTC", (10, 0), (9, 0))).unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidWindow { .. }));
    }

    #[test]
    fn half_open_window_is_rejected() {
        let trigger = Trigger::Cron {
            expression: "0 9 * * *".to_string(),
            timezone: "UTC".to_string(),
            window_start: NaiveTime::from_hms_opt(9, 0, 0),
            window_end: None,
        };
        assert!(matches!(
            validate_trigger(&trigger).unwrap_err(),
            ScheduleError::IncompleteWindow
        ));
    }
}
