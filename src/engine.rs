use crate::archival;
use crate::clock::{Clock, SystemClock};
use crate::db::{Database, UnitOfWork};
use crate::errors::{EngineError, EngineResult};
use crate::gc;
use crate::materializer::{apply_plan, materialize_journal, materialize_time_plan, Materialization};
use crate::models::{
    BigPlan, BigPlanStatus, Chore, EntityKind, EventSource, GcLogEntry, GenLogEntry, GenTarget,
    GenerationFilters, Habit, InboxTask, InboxTaskSource, InboxTaskStatus, Journal,
    JournalSettings, Metric, Person, Project, RecurringTaskPeriod,
    ScheduleExternalSyncLogEntry, ScoreLogEntry, ScoreSource, StatsSummary, StatsTarget,
    TimePlanSettings, WorkingMemPrefs,
};
use crate::period::instances_in_range;
use crate::planner::{
    generation_window, plan_chore, plan_habit, plan_metric, plan_person_birthday,
    plan_person_catch_up, plan_working_mem_cleanup,
};
use crate::progress::{report_created, report_removed, report_updated, NoopReporter, ProgressReporter};
use crate::stats;
use crate::sync::{sync_stream, ExternalScheduleSource};
use chrono::{Datelike, NaiveDate};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const CONFLICT_RETRIES: u32 = 2;

/// The engine's public surface. One instance per workspace database; runs
/// are serialized by the database's connection lock.
pub struct EngineService {
    db: Database,
    clock: Arc<dyn Clock>,
    reporter: Arc<dyn ProgressReporter>,
    cancelled: AtomicBool,
}

impl EngineService {
    pub fn new(db: Database) -> Self {
        Self::with_parts(db, Arc::new(SystemClock), Arc::new(NoopReporter))
    }

    pub fn with_parts(
        db: Database,
        clock: Arc<dyn Clock>,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Self {
        Self {
            db,
            clock,
            reporter,
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Cooperative cancellation: the run finishes the entity in flight,
    /// aborts the unit of work, and nothing is committed.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    fn check_cancelled(&self) -> EngineResult<()> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(EngineError::Cancelled("run cancelled by caller".to_string()));
        }
        Ok(())
    }

    pub fn run_generation(
        &self,
        today: NaiveDate,
        targets: &[GenTarget],
        filters: &GenerationFilters,
        gen_even_if_not_modified: bool,
        period_filter: Option<&[RecurringTaskPeriod]>,
    ) -> EngineResult<GenLogEntry> {
        let now = self.clock.now();
        let (log, changes) = self.db.with_uow(EventSource::Background, now, |uow| {
            let mut total = Materialization::default();
            let mut per_target = serde_json::Map::new();
            for target in targets {
                self.check_cancelled()?;
                let result = self.generate_target(
                    uow,
                    *target,
                    filters,
                    today,
                    gen_even_if_not_modified,
                    period_filter,
                )?;
                per_target.insert(
                    target.as_str().to_string(),
                    serde_json::to_value(&result.counts)?,
                );
                total.absorb(result);
            }
            let log = uow.insert_gen_log(
                today,
                gen_even_if_not_modified,
                targets,
                period_filter,
                &serde_json::to_value(filters)?,
                &serde_json::Value::Object(per_target),
            )?;
            Ok((log, total))
        })?;
        self.flush(&changes)?;
        Ok(log)
    }

    pub fn run_gc(
        &self,
        today: NaiveDate,
        targets: &[GenTarget],
        filters: &GenerationFilters,
    ) -> EngineResult<GcLogEntry> {
        let now = self.clock.now();
        let (log, changes) = self.db.with_uow(EventSource::Background, now, |uow| {
            let mut total = Materialization::default();
            let mut per_target = serde_json::Map::new();
            for target in targets {
                self.check_cancelled()?;
                let mut result = match self.with_retry(|| gc::collect_target(uow, *target, filters, today))
                {
                    Ok(result) => result,
                    Err(err @ EngineError::Storage(_)) => return Err(err),
                    Err(err) => {
                        tracing::warn!(gc_target = target.as_str(), error = %err, "gc target failed");
                        let mut result = Materialization::default();
                        result.counts.errors.push(format!("{}: {err}", target.as_str()));
                        result
                    }
                };
                match self.with_retry(|| gc_extras(uow, *target, filters)) {
                    Ok(extra) => result.absorb(extra),
                    Err(err @ EngineError::Storage(_)) => return Err(err),
                    Err(err @ EngineError::Cancelled(_)) => return Err(err),
                    Err(err) => {
                        tracing::warn!(gc_target = target.as_str(), error = %err, "gc sweep failed");
                        result.counts.errors.push(format!("{}: {err}", target.as_str()));
                    }
                }
                per_target.insert(
                    target.as_str().to_string(),
                    serde_json::to_value(&result.counts)?,
                );
                total.absorb(result);
            }
            let log = uow.insert_gc_log(
                today,
                targets,
                &serde_json::to_value(filters)?,
                &serde_json::Value::Object(per_target),
            )?;
            Ok((log, total))
        })?;
        self.flush(&changes)?;
        Ok(log)
    }

    pub fn refresh_stats(
        &self,
        today: NaiveDate,
        targets: &[StatsTarget],
        filters: &GenerationFilters,
    ) -> EngineResult<StatsSummary> {
        let now = self.clock.now();
        self.db.with_uow(EventSource::Background, now, |uow| {
            let mut summary = StatsSummary::default();
            for target in targets {
                self.check_cancelled()?;
                match target {
                    StatsTarget::Habits => {
                        for habit in uow.find_all::<Habit>(false)? {
                            self.check_cancelled()?;
                            if !GenerationFilters::allows(
                                &filters.habit_ref_ids,
                                habit.envelope.ref_id,
                            ) {
                                continue;
                            }
                            match self.with_retry(|| {
                                stats::refresh_habit_streaks(uow, &habit, today.year(), today)
                            }) {
                                Ok(written) => {
                                    summary.habits_refreshed += 1;
                                    summary.streak_marks_upserted += written;
                                }
                                Err(err @ EngineError::Storage(_)) => return Err(err),
                                Err(err) => summary
                                    .errors
                                    .push(format!("habit {}: {err}", habit.envelope.ref_id)),
                            }
                        }
                    }
                    StatsTarget::BigPlans => {
                        for big_plan in uow.find_all::<BigPlan>(false)? {
                            self.check_cancelled()?;
                            if !GenerationFilters::allows(
                                &filters.big_plan_ref_ids,
                                big_plan.envelope.ref_id,
                            ) {
                                continue;
                            }
                            match self
                                .with_retry(|| stats::refresh_big_plan_stats(uow, big_plan.envelope.ref_id))
                            {
                                Ok(_) => summary.big_plans_refreshed += 1,
                                Err(err @ EngineError::Storage(_)) => return Err(err),
                                Err(err) => summary
                                    .errors
                                    .push(format!("big plan {}: {err}", big_plan.envelope.ref_id)),
                            }
                        }
                    }
                    StatsTarget::Journals => {
                        for journal in uow.find_all::<Journal>(false)? {
                            self.check_cancelled()?;
                            if !GenerationFilters::allows(
                                &filters.journal_ref_ids,
                                journal.envelope.ref_id,
                            ) {
                                continue;
                            }
                            match self.with_retry(|| stats::refresh_journal_report(uow, &journal)) {
                                Ok(_) => summary.journals_refreshed += 1,
                                Err(err @ EngineError::Storage(_)) => return Err(err),
                                Err(err) => summary
                                    .errors
                                    .push(format!("journal {}: {err}", journal.envelope.ref_id)),
                            }
                        }
                    }
                }
            }
            Ok(summary)
        })
    }

    /// Scores a completed task or big plan. Idempotent per entity.
    pub fn record_completion(
        &self,
        kind: EntityKind,
        ref_id: i64,
        today: NaiveDate,
    ) -> EngineResult<Option<ScoreLogEntry>> {
        let now = self.clock.now();
        self.db.with_uow(EventSource::Cli, now, |uow| {
            let workspace = uow.find_workspace()?;
            let (source, difficulty) = match kind {
                EntityKind::InboxTask => {
                    let task: InboxTask = uow.load(ref_id, false)?;
                    // Only a transition to done earns points; a failed task
                    // is completed but never scores.
                    if task.status != InboxTaskStatus::Done {
                        return Err(EngineError::Validation(format!(
                            "inbox task {ref_id} is not done"
                        )));
                    }
                    (ScoreSource::InboxTask, task.difficulty)
                }
                EntityKind::BigPlan => {
                    let big_plan: BigPlan = uow.load(ref_id, false)?;
                    if big_plan.status != BigPlanStatus::Done {
                        return Err(EngineError::Validation(format!(
                            "big plan {ref_id} is not done"
                        )));
                    }
                    (ScoreSource::BigPlan, Some(big_plan.difficulty))
                }
                other => {
                    return Err(EngineError::Validation(format!(
                        "{} completions are not scored",
                        other.as_str()
                    )))
                }
            };
            stats::record_completion(
                uow,
                workspace.envelope.ref_id,
                source,
                ref_id,
                difficulty,
                today,
            )
        })
    }

    pub fn archive(&self, kind: EntityKind, ref_id: i64) -> EngineResult<()> {
        let now = self.clock.now();
        let changes = self
            .db
            .with_uow(EventSource::Cli, now, |uow| archival::archive(uow, kind, ref_id))?;
        self.flush(&changes)
    }

    pub fn remove(&self, kind: EntityKind, ref_id: i64) -> EngineResult<()> {
        let now = self.clock.now();
        let changes = self
            .db
            .with_uow(EventSource::Cli, now, |uow| archival::remove(uow, kind, ref_id))?;
        self.flush(&changes)
    }

    /// Moves a project under a new parent, refusing cycles.
    pub fn reparent_project(
        &self,
        project_ref_id: i64,
        new_parent_ref_id: Option<i64>,
    ) -> EngineResult<()> {
        let now = self.clock.now();
        let name = self.db.with_uow(EventSource::Cli, now, |uow| {
            if let Some(parent_ref_id) = new_parent_ref_id {
                uow.check_project_parent(project_ref_id, parent_ref_id)?;
            }
            let mut project: Project = uow.load(project_ref_id, false)?;
            project.parent_project_ref_id = new_parent_ref_id;
            uow.save(&mut project)?;
            Ok(project.name)
        })?;
        report_updated(
            self.reporter.as_ref(),
            EntityKind::Project,
            project_ref_id,
            &name,
        );
        Ok(())
    }

    pub fn sync_external_schedule(
        &self,
        stream_ref_id: i64,
        sync_start: Option<NaiveDate>,
        sync_end: Option<NaiveDate>,
        source: &dyn ExternalScheduleSource,
    ) -> EngineResult<ScheduleExternalSyncLogEntry> {
        let now = self.clock.now();
        self.db.with_uow(EventSource::Background, now, |uow| {
            sync_stream(uow, stream_ref_id, sync_start, sync_end, source)
        })
    }

    fn generate_target(
        &self,
        uow: &UnitOfWork<'_>,
        target: GenTarget,
        filters: &GenerationFilters,
        today: NaiveDate,
        force: bool,
        period_filter: Option<&[RecurringTaskPeriod]>,
    ) -> EngineResult<Materialization> {
        let mut out = Materialization::default();
        match target {
            GenTarget::Habits => {
                for habit in uow.find_all::<Habit>(false)? {
                    self.check_cancelled()?;
                    if !GenerationFilters::allows(&filters.habit_ref_ids, habit.envelope.ref_id) {
                        continue;
                    }
                    let Some(period) = habit.gen_params.period else {
                        out.counts
                            .errors
                            .push(format!("habit {}: no period", habit.envelope.ref_id));
                        continue;
                    };
                    if !period_allowed(period_filter, period) {
                        continue;
                    }
                    let result = self.with_retry(|| {
                        let (from, to) = generation_window(period, today);
                        let entries = plan_habit(&habit, from, to)?;
                        apply_plan(
                            uow,
                            InboxTaskSource::Habit,
                            habit.envelope.ref_id,
                            &window_timelines(period, from, to),
                            &entries,
                            force,
                        )
                    });
                    absorb_or_record(&mut out, result, "habit", habit.envelope.ref_id)?;
                }
            }
            GenTarget::Chores => {
                for chore in uow.find_all::<Chore>(false)? {
                    self.check_cancelled()?;
                    if !GenerationFilters::allows(&filters.chore_ref_ids, chore.envelope.ref_id) {
                        continue;
                    }
                    let Some(period) = chore.gen_params.period else {
                        out.counts
                            .errors
                            .push(format!("chore {}: no period", chore.envelope.ref_id));
                        continue;
                    };
                    if !period_allowed(period_filter, period) {
                        continue;
                    }
                    let result = self.with_retry(|| {
                        let (from, to) = generation_window(period, today);
                        let entries = plan_chore(&chore, from, to)?;
                        apply_plan(
                            uow,
                            InboxTaskSource::Chore,
                            chore.envelope.ref_id,
                            &window_timelines(period, from, to),
                            &entries,
                            force,
                        )
                    });
                    absorb_or_record(&mut out, result, "chore", chore.envelope.ref_id)?;
                }
            }
            GenTarget::Metrics => {
                let default_project = self.default_project(uow)?;
                for metric in uow.find_all::<Metric>(false)? {
                    self.check_cancelled()?;
                    if !GenerationFilters::allows(&filters.metric_ref_ids, metric.envelope.ref_id) {
                        continue;
                    }
                    let Some(period) = metric.collection_params.as_ref().and_then(|p| p.period)
                    else {
                        continue;
                    };
                    if !period_allowed(period_filter, period) {
                        continue;
                    }
                    let Some(project_ref_id) = metric.collection_project_ref_id.or(default_project)
                    else {
                        out.counts.errors.push(format!(
                            "metric {}: no collection project and no backup project",
                            metric.envelope.ref_id
                        ));
                        continue;
                    };
                    let result = self.with_retry(|| {
                        let (from, to) = generation_window(period, today);
                        let entries = plan_metric(&metric, project_ref_id, from, to)?;
                        apply_plan(
                            uow,
                            InboxTaskSource::Metric,
                            metric.envelope.ref_id,
                            &window_timelines(period, from, to),
                            &entries,
                            force,
                        )
                    });
                    absorb_or_record(&mut out, result, "metric", metric.envelope.ref_id)?;
                }
            }
            GenTarget::Persons => {
                let default_project = self.default_project(uow)?;
                for person in uow.find_all::<Person>(false)? {
                    self.check_cancelled()?;
                    if !GenerationFilters::allows(&filters.person_ref_ids, person.envelope.ref_id) {
                        continue;
                    }
                    let Some(project_ref_id) =
                        person.catch_up_project_ref_id.or(default_project)
                    else {
                        out.counts.errors.push(format!(
                            "person {}: no catch-up project and no backup project",
                            person.envelope.ref_id
                        ));
                        continue;
                    };
                    if let Some(period) =
                        person.catch_up_params.as_ref().and_then(|p| p.period)
                    {
                        if period_allowed(period_filter, period) {
                            let result = self.with_retry(|| {
                                let (from, to) = generation_window(period, today);
                                let entries =
                                    plan_person_catch_up(&person, project_ref_id, from, to)?;
                                apply_plan(
                                    uow,
                                    InboxTaskSource::PersonCatchUp,
                                    person.envelope.ref_id,
                                    &window_timelines(period, from, to),
                                    &entries,
                                    force,
                                )
                            });
                            absorb_or_record(&mut out, result, "person", person.envelope.ref_id)?;
                        }
                    }
                    if person.birthday.is_some()
                        && period_allowed(period_filter, RecurringTaskPeriod::Yearly)
                    {
                        let result = self.with_retry(|| {
                            let (from, to) =
                                generation_window(RecurringTaskPeriod::Yearly, today);
                            let entries = plan_person_birthday(&person, project_ref_id, from, to)?;
                            apply_plan(
                                uow,
                                InboxTaskSource::PersonBirthday,
                                person.envelope.ref_id,
                                &window_timelines(RecurringTaskPeriod::Yearly, from, to),
                                &entries,
                                force,
                            )
                        });
                        absorb_or_record(&mut out, result, "person", person.envelope.ref_id)?;
                    }
                }
            }
            GenTarget::WorkingMem => {
                for prefs in uow.find_all::<WorkingMemPrefs>(false)? {
                    self.check_cancelled()?;
                    let period = prefs.generation_period;
                    if !period_allowed(period_filter, period) {
                        continue;
                    }
                    let result = self.with_retry(|| {
                        let (from, to) = generation_window(period, today);
                        let entries = plan_working_mem_cleanup(&prefs, from, to)?;
                        apply_plan(
                            uow,
                            InboxTaskSource::WorkingMemCleanup,
                            prefs.envelope.ref_id,
                            &window_timelines(period, from, to),
                            &entries,
                            force,
                        )
                    });
                    absorb_or_record(&mut out, result, "working-mem", prefs.envelope.ref_id)?;
                }
            }
            GenTarget::Journals => {
                for settings in uow.find_all::<JournalSettings>(false)? {
                    for period in settings.periods.clone() {
                        self.check_cancelled()?;
                        if !period_allowed(period_filter, period) {
                            continue;
                        }
                        let result = self.with_retry(|| {
                            materialize_journal(uow, &settings, period, today, force)
                        });
                        absorb_or_record(&mut out, result, "journal", settings.envelope.ref_id)?;
                    }
                }
            }
            GenTarget::TimePlans => {
                for settings in uow.find_all::<TimePlanSettings>(false)? {
                    for period in settings.periods.clone() {
                        self.check_cancelled()?;
                        if !period_allowed(period_filter, period) {
                            continue;
                        }
                        let result = self.with_retry(|| {
                            materialize_time_plan(uow, &settings, period, today, force)
                        });
                        absorb_or_record(&mut out, result, "time-plan", settings.envelope.ref_id)?;
                    }
                }
            }
        }
        Ok(out)
    }

    fn default_project(&self, uow: &UnitOfWork<'_>) -> EngineResult<Option<i64>> {
        match uow.find_workspace() {
            Ok(workspace) => Ok(workspace.backup_project_ref_id),
            Err(EngineError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn with_retry<T>(&self, mut op: impl FnMut() -> EngineResult<T>) -> EngineResult<T> {
        let mut attempts = 0;
        loop {
            match op() {
                Err(EngineError::Conflict(msg)) if attempts < CONFLICT_RETRIES => {
                    attempts += 1;
                    tracing::warn!(error = %msg, attempt = attempts, "retrying after version conflict");
                }
                other => return other,
            }
        }
    }

    fn flush(&self, changes: &Materialization) -> EngineResult<()> {
        let upserts: Vec<_> = changes.search_upserts().cloned().collect();
        self.db.upsert_search_entries(&upserts)?;
        self.db.remove_search_entries(&changes.removed)?;
        for (kind, ref_id, name) in &changes.created {
            report_created(self.reporter.as_ref(), *kind, *ref_id, name);
        }
        for (kind, ref_id, name) in &changes.updated {
            report_updated(self.reporter.as_ref(), *kind, *ref_id, name);
        }
        for (kind, ref_id) in &changes.removed {
            report_removed(self.reporter.as_ref(), *kind, *ref_id);
        }
        Ok(())
    }
}

// The big-plan back-link sweep has no generation counterpart in the target
// taxonomy; it rides along with the habit target.
fn gc_extras(
    uow: &UnitOfWork<'_>,
    target: GenTarget,
    filters: &GenerationFilters,
) -> EngineResult<Materialization> {
    if target == GenTarget::Habits {
        gc::sweep_big_plan_links(uow, filters)
    } else {
        Ok(Materialization::default())
    }
}

fn period_allowed(filter: Option<&[RecurringTaskPeriod]>, period: RecurringTaskPeriod) -> bool {
    filter.map_or(true, |periods| periods.contains(&period))
}

fn window_timelines(
    period: RecurringTaskPeriod,
    from: NaiveDate,
    to: NaiveDate,
) -> HashSet<String> {
    instances_in_range(period, from, to)
        .into_iter()
        .map(|instance| instance.timeline)
        .collect()
}

fn absorb_or_record(
    out: &mut Materialization,
    result: EngineResult<Materialization>,
    label: &str,
    ref_id: i64,
) -> EngineResult<()> {
    match result {
        Ok(changes) => {
            out.absorb(changes);
            Ok(())
        }
        Err(err @ EngineError::Storage(_)) => Err(err),
        Err(err @ EngineError::Cancelled(_)) => Err(err),
        Err(err) => {
            tracing::warn!(ref_id, error = %err, "skipping {label}");
            out.counts.errors.push(format!("{label} {ref_id}: {err}"));
            Ok(())
        }
    }
}
