use crate::db::UnitOfWork;
use crate::errors::EngineResult;
use crate::models::{
    ArchivedReason, Envelope, EntityKind, InboxTask, InboxTaskSource, InboxTaskStatus, Journal,
    JournalGenerationApproach, JournalSettings, RecurringTaskPeriod, TargetCounts, TimePlan,
    TimePlanGenerationApproach, TimePlanSettings, TimePlanSource,
};
use crate::period::{bounds, timeline};
use crate::planner::{journal_writing_entry, time_plan_planning_entry, PlanEntry};
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};

/// What one diff-and-apply pass did, with the entity refs it touched. The
/// caller flushes these to the search index and the progress reporter after
/// commit.
#[derive(Debug, Default)]
pub struct Materialization {
    pub counts: TargetCounts,
    pub created: Vec<(EntityKind, i64, String)>,
    pub updated: Vec<(EntityKind, i64, String)>,
    pub removed: Vec<(EntityKind, i64)>,
}

impl Materialization {
    pub fn absorb(&mut self, other: Materialization) {
        self.counts.merge(&other.counts);
        self.created.extend(other.created);
        self.updated.extend(other.updated);
        self.removed.extend(other.removed);
    }

    pub fn search_upserts(&self) -> impl Iterator<Item = &(EntityKind, i64, String)> {
        self.created.iter().chain(self.updated.iter())
    }
}

/// Diffs the planned entries for one generator against its stored tasks and
/// applies the difference.
///
/// `window_timelines` names the period instances the plan covered. Only
/// untouched tasks inside those instances can go stale; tasks from earlier
/// windows are left for the collector.
pub fn apply_plan(
    uow: &UnitOfWork<'_>,
    source: InboxTaskSource,
    source_ref_id: i64,
    window_timelines: &HashSet<String>,
    entries: &[PlanEntry],
    gen_even_if_not_modified: bool,
) -> EngineResult<Materialization> {
    let mut out = Materialization::default();

    let existing = uow.find_generated_inbox_tasks(source, source_ref_id)?;
    let mut by_key: HashMap<(InboxTaskSource, i64, String, i64), InboxTask> = HashMap::new();
    for task in existing {
        let Some(key) = task.recurring_key() else {
            continue;
        };
        // Two live rows with the same key should not exist. Keep the oldest
        // and archive the rest.
        let incoming_is_newer = by_key
            .get(&key)
            .map(|kept| kept.envelope.ref_id < task.envelope.ref_id);
        let mut stale = match incoming_is_newer {
            None => {
                by_key.insert(key, task);
                continue;
            }
            Some(true) => task,
            Some(false) => match by_key.insert(key, task) {
                Some(displaced) => displaced,
                None => continue,
            },
        };
        tracing::warn!(
            stale_ref_id = stale.envelope.ref_id,
            "duplicate recurring task, keeping the oldest row"
        );
        uow.archive_entity(&mut stale, ArchivedReason::GenerationReplaced)?;
        out.counts.archived += 1;
        out.removed
            .push((EntityKind::InboxTask, stale.envelope.ref_id));
    }

    let mut planned_keys: HashSet<(InboxTaskSource, i64, String, i64)> = HashSet::new();
    for entry in entries {
        planned_keys.insert(entry.key());
        match by_key.get_mut(&entry.key()) {
            None => {
                let task = uow.create(InboxTask {
                    envelope: Envelope::new(uow.now()),
                    name: entry.name.clone(),
                    status: InboxTaskStatus::NotStartedGen,
                    project_ref_id: entry.project_ref_id,
                    source: entry.source,
                    source_ref_id: Some(entry.source_ref_id),
                    eisen: entry.eisen,
                    difficulty: entry.difficulty,
                    actionable_date: entry.actionable_date,
                    due_date: Some(entry.due_date),
                    completed_time: None,
                    recurring_timeline: Some(entry.timeline.clone()),
                    recurring_repeat_index: Some(entry.repeat_index),
                })?;
                out.counts.created += 1;
                out.created
                    .push((EntityKind::InboxTask, task.envelope.ref_id, task.name));
            }
            Some(task) if !task.status.is_user_touched() => {
                if overwrite_untouched(task, entry) {
                    uow.save(task)?;
                    out.counts.updated += 1;
                    out.updated.push((
                        EntityKind::InboxTask,
                        task.envelope.ref_id,
                        task.name.clone(),
                    ));
                }
            }
            Some(task) => {
                if gen_even_if_not_modified && tighten_dates(task, entry) {
                    uow.save(task)?;
                    out.counts.updated += 1;
                }
            }
        }
    }

    for (key, task) in by_key.iter_mut() {
        if planned_keys.contains(key)
            || task.status.is_user_touched()
            || !window_timelines.contains(&key.2)
        {
            continue;
        }
        uow.archive_entity(task, ArchivedReason::GenerationReplaced)?;
        out.counts.archived += 1;
        out.removed
            .push((EntityKind::InboxTask, task.envelope.ref_id));
    }

    Ok(out)
}

fn overwrite_untouched(task: &mut InboxTask, entry: &PlanEntry) -> bool {
    let changed = task.name != entry.name
        || task.project_ref_id != entry.project_ref_id
        || task.eisen != entry.eisen
        || task.difficulty != entry.difficulty
        || task.actionable_date != entry.actionable_date
        || task.due_date != Some(entry.due_date);
    if changed {
        task.name = entry.name.clone();
        task.project_ref_id = entry.project_ref_id;
        task.eisen = entry.eisen;
        task.difficulty = entry.difficulty;
        task.actionable_date = entry.actionable_date;
        task.due_date = Some(entry.due_date);
    }
    changed
}

// Only stricter dates flow onto a task the user already owns.
fn tighten_dates(task: &mut InboxTask, entry: &PlanEntry) -> bool {
    let mut changed = false;
    if task.due_date.is_none() || task.due_date > Some(entry.due_date) {
        task.due_date = Some(entry.due_date);
        changed = true;
    }
    if let Some(actionable) = entry.actionable_date {
        if task.actionable_date.is_none() || task.actionable_date > Some(actionable) {
            task.actionable_date = Some(actionable);
            changed = true;
        }
    }
    changed
}

/// Ensures the journal for the period instance containing `today` exists,
/// plus its companion writing task when the approach calls for one.
pub fn materialize_journal(
    uow: &UnitOfWork<'_>,
    settings: &JournalSettings,
    period: RecurringTaskPeriod,
    today: NaiveDate,
    gen_even_if_not_modified: bool,
) -> EngineResult<Materialization> {
    let mut out = Materialization::default();
    if settings.generation_approach == JournalGenerationApproach::None {
        return Ok(out);
    }

    let instance_timeline = timeline(period, today);
    let journal = match uow.find_journal(period, &instance_timeline)? {
        Some(journal) => journal,
        None => {
            let journal = uow.create(Journal {
                envelope: Envelope::new(uow.now()),
                right_now: today,
                period,
                timeline: instance_timeline.clone(),
                sources: settings.sources.clone(),
            })?;
            out.counts.created += 1;
            out.created.push((
                EntityKind::Journal,
                journal.envelope.ref_id,
                journal.timeline.clone(),
            ));
            journal
        }
    };

    if settings.generation_approach == JournalGenerationApproach::BothJournalAndTask {
        let entry = journal_writing_entry(settings, &journal);
        let mut window = HashSet::new();
        window.insert(entry.timeline.clone());
        out.absorb(apply_plan(
            uow,
            InboxTaskSource::Journal,
            journal.envelope.ref_id,
            &window,
            std::slice::from_ref(&entry),
            gen_even_if_not_modified,
        )?);
    }
    Ok(out)
}

/// Journal's sibling for time plans.
pub fn materialize_time_plan(
    uow: &UnitOfWork<'_>,
    settings: &TimePlanSettings,
    period: RecurringTaskPeriod,
    today: NaiveDate,
    gen_even_if_not_modified: bool,
) -> EngineResult<Materialization> {
    let mut out = Materialization::default();
    if settings.generation_approach == TimePlanGenerationApproach::None {
        return Ok(out);
    }

    let instance_timeline = timeline(period, today);
    let time_plan = match uow.find_time_plan(period, &instance_timeline)? {
        Some(time_plan) => time_plan,
        None => {
            let (start_date, end_date) = bounds(period, today);
            let time_plan = uow.create(TimePlan {
                envelope: Envelope::new(uow.now()),
                right_now: today,
                period,
                timeline: instance_timeline.clone(),
                start_date,
                end_date,
                source: TimePlanSource::Generated,
            })?;
            out.counts.created += 1;
            out.created.push((
                EntityKind::TimePlan,
                time_plan.envelope.ref_id,
                time_plan.timeline.clone(),
            ));
            time_plan
        }
    };

    if settings.generation_approach == TimePlanGenerationApproach::BothTimePlanAndTask {
        let entry = time_plan_planning_entry(settings, &time_plan);
        let mut window = HashSet::new();
        window.insert(entry.timeline.clone());
        out.absorb(apply_plan(
            uow,
            InboxTaskSource::TimePlan,
            time_plan.envelope.ref_id,
            &window,
            std::slice::from_ref(&entry),
            gen_even_if_not_modified,
        )?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{Difficulty, Eisen, EventSource};
    use chrono::{DateTime, TimeZone, Utc};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 8, 0, 0).unwrap()
    }

    fn day(year: i32, month: u32, dom: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, dom).expect("date")
    }

    fn entry(timeline: &str, repeat_index: i64, name: &str, due: NaiveDate) -> PlanEntry {
        PlanEntry {
            source: InboxTaskSource::Habit,
            source_ref_id: 7,
            project_ref_id: 1,
            period: RecurringTaskPeriod::Daily,
            timeline: timeline.to_string(),
            repeat_index,
            name: name.to_string(),
            due_date: due,
            actionable_date: None,
            eisen: Some(Eisen::Important),
            difficulty: Some(Difficulty::Easy),
        }
    }

    fn window(timelines: &[&str]) -> HashSet<String> {
        timelines.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn second_run_over_the_same_plan_is_a_noop() {
        let db = Database::in_memory().expect("db");
        let entries = vec![
            entry("2024-03-04", 0, "Run", day(2024, 3, 4)),
            entry("2024-03-05", 0, "Run", day(2024, 3, 5)),
        ];
        let win = window(&["2024-03-04", "2024-03-05"]);

        let first = db
            .with_uow(EventSource::Background, now(), |uow| {
                apply_plan(uow, InboxTaskSource::Habit, 7, &win, &entries, false)
            })
            .expect("first run");
        assert_eq!(first.counts.created, 2);

        let second = db
            .with_uow(EventSource::Background, now(), |uow| {
                apply_plan(uow, InboxTaskSource::Habit, 7, &win, &entries, false)
            })
            .expect("second run");
        assert!(second.counts.is_noop());
    }

    #[test]
    fn untouched_tasks_follow_the_plan_touched_ones_do_not() {
        let db = Database::in_memory().expect("db");
        let win = window(&["2024-03-04"]);
        let original = vec![entry("2024-03-04", 0, "Run", day(2024, 3, 4))];

        db.with_uow(EventSource::Background, now(), |uow| {
            apply_plan(uow, InboxTaskSource::Habit, 7, &win, &original, false)
        })
        .expect("seed");

        // User grabs the task.
        db.with_uow(EventSource::Cli, now(), |uow| {
            let mut tasks = uow.find_generated_inbox_tasks(InboxTaskSource::Habit, 7)?;
            let task = &mut tasks[0];
            task.status = InboxTaskStatus::InProgress;
            uow.save(task)
        })
        .expect("touch");

        let renamed = vec![entry("2024-03-04", 0, "Run far", day(2024, 3, 4))];
        let result = db
            .with_uow(EventSource::Background, now(), |uow| {
                apply_plan(uow, InboxTaskSource::Habit, 7, &win, &renamed, false)
            })
            .expect("re-run");
        assert!(result.counts.is_noop());

        db.with_uow(EventSource::Cli, now(), |uow| {
            let tasks = uow.find_generated_inbox_tasks(InboxTaskSource::Habit, 7)?;
            assert_eq!(tasks[0].name, "Run");
            assert_eq!(tasks[0].status, InboxTaskStatus::InProgress);
            Ok(())
        })
        .expect("check");
    }

    #[test]
    fn forced_regeneration_only_tightens_dates_on_touched_tasks() {
        let db = Database::in_memory().expect("db");
        let win = window(&["2024-03-04"]);
        let original = vec![entry("2024-03-04", 0, "Run", day(2024, 3, 6))];

        db.with_uow(EventSource::Background, now(), |uow| {
            apply_plan(uow, InboxTaskSource::Habit, 7, &win, &original, false)?;
            let mut tasks = uow.find_generated_inbox_tasks(InboxTaskSource::Habit, 7)?;
            tasks[0].status = InboxTaskStatus::InProgress;
            uow.save(&mut tasks[0])
        })
        .expect("seed");

        // A later due date never propagates onto a touched task.
        let relaxed = vec![entry("2024-03-04", 0, "Run renamed", day(2024, 3, 8))];
        let result = db
            .with_uow(EventSource::Background, now(), |uow| {
                apply_plan(uow, InboxTaskSource::Habit, 7, &win, &relaxed, true)
            })
            .expect("relaxed");
        assert!(result.counts.is_noop());

        // An earlier one does.
        let stricter = vec![entry("2024-03-04", 0, "Run renamed", day(2024, 3, 4))];
        let result = db
            .with_uow(EventSource::Background, now(), |uow| {
                apply_plan(uow, InboxTaskSource::Habit, 7, &win, &stricter, true)
            })
            .expect("stricter");
        assert_eq!(result.counts.updated, 1);

        db.with_uow(EventSource::Cli, now(), |uow| {
            let tasks = uow.find_generated_inbox_tasks(InboxTaskSource::Habit, 7)?;
            assert_eq!(tasks[0].due_date, Some(day(2024, 3, 4)));
            // Names stay as the user left them.
            assert_eq!(tasks[0].name, "Run");
            Ok(())
        })
        .expect("check");
    }

    #[test]
    fn dropped_repeats_archive_the_stale_untouched_rows() {
        let db = Database::in_memory().expect("db");
        let win = window(&["2024-03-04"]);
        let three = vec![
            entry("2024-03-04", 0, "Run #1/3", day(2024, 3, 4)),
            entry("2024-03-04", 1, "Run #2/3", day(2024, 3, 4)),
            entry("2024-03-04", 2, "Run #3/3", day(2024, 3, 4)),
        ];

        db.with_uow(EventSource::Background, now(), |uow| {
            apply_plan(uow, InboxTaskSource::Habit, 7, &win, &three, false)
        })
        .expect("seed");

        let one = vec![entry("2024-03-04", 0, "Run", day(2024, 3, 4))];
        let result = db
            .with_uow(EventSource::Background, now(), |uow| {
                apply_plan(uow, InboxTaskSource::Habit, 7, &win, &one, false)
            })
            .expect("shrink");
        assert_eq!(result.counts.archived, 2);
        assert_eq!(result.counts.updated, 1);

        db.with_uow(EventSource::Cli, now(), |uow| {
            let live = uow.find_generated_inbox_tasks(InboxTaskSource::Habit, 7)?;
            assert_eq!(live.len(), 1);
            assert_eq!(live[0].name, "Run");
            Ok(())
        })
        .expect("check");
    }

    #[test]
    fn tasks_outside_the_window_are_left_alone() {
        let db = Database::in_memory().expect("db");
        let yesterday_win = window(&["2024-03-03"]);
        let yesterday = vec![entry("2024-03-03", 0, "Run", day(2024, 3, 3))];
        db.with_uow(EventSource::Background, now(), |uow| {
            apply_plan(uow, InboxTaskSource::Habit, 7, &yesterday_win, &yesterday, false)
        })
        .expect("seed");

        let today_win = window(&["2024-03-04"]);
        let today = vec![entry("2024-03-04", 0, "Run", day(2024, 3, 4))];
        let result = db
            .with_uow(EventSource::Background, now(), |uow| {
                apply_plan(uow, InboxTaskSource::Habit, 7, &today_win, &today, false)
            })
            .expect("next day");
        assert_eq!(result.counts.created, 1);
        assert_eq!(result.counts.archived, 0);

        db.with_uow(EventSource::Cli, now(), |uow| {
            let live = uow.find_generated_inbox_tasks(InboxTaskSource::Habit, 7)?;
            assert_eq!(live.len(), 2);
            Ok(())
        })
        .expect("check");
    }

    #[test]
    fn journal_materializes_once_with_its_writing_task() {
        let db = Database::in_memory().expect("db");
        let settings = JournalSettings {
            envelope: Envelope::new(now()),
            generation_approach: JournalGenerationApproach::BothJournalAndTask,
            periods: vec![RecurringTaskPeriod::Weekly],
            sources: vec![InboxTaskSource::User, InboxTaskSource::Habit],
            writing_task_project_ref_id: 1,
            writing_task_eisen: Some(Eisen::Important),
            writing_task_difficulty: Some(Difficulty::Medium),
            days_until_gc: 7,
        };

        let first = db
            .with_uow(EventSource::Background, now(), |uow| {
                materialize_journal(uow, &settings, RecurringTaskPeriod::Weekly, day(2024, 3, 4), false)
            })
            .expect("first");
        // One journal and one writing task.
        assert_eq!(first.counts.created, 2);

        // Later in the same week, from a different day.
        let second = db
            .with_uow(EventSource::Background, now(), |uow| {
                materialize_journal(uow, &settings, RecurringTaskPeriod::Weekly, day(2024, 3, 6), false)
            })
            .expect("second");
        assert!(second.counts.is_noop());

        db.with_uow(EventSource::Cli, now(), |uow| {
            let journal = uow
                .find_journal(RecurringTaskPeriod::Weekly, "2024-W10")?
                .expect("journal");
            let tasks =
                uow.find_generated_inbox_tasks(InboxTaskSource::Journal, journal.envelope.ref_id)?;
            assert_eq!(tasks.len(), 1);
            assert_eq!(tasks[0].name, "Write journal entry for 2024-W10");
            Ok(())
        })
        .expect("check");
    }

    #[test]
    fn duplicate_rows_for_one_key_heal_to_the_oldest() {
        let db = Database::in_memory().expect("db");
        let win = window(&["2024-03-04"]);
        let plan = vec![entry("2024-03-04", 0, "Run", day(2024, 3, 4))];

        let first_ref_id = db
            .with_uow(EventSource::Background, now(), |uow| {
                let result = apply_plan(uow, InboxTaskSource::Habit, 7, &win, &plan, false)?;
                Ok(result.created[0].1)
            })
            .expect("seed");

        // Slip a second live row in under the same key.
        db.with_uow(EventSource::Cli, now(), |uow| {
            let original: InboxTask = uow.load(first_ref_id, false)?;
            let mut duplicate = original.clone();
            duplicate.envelope = Envelope::new(now());
            uow.create(duplicate)?;
            Ok(())
        })
        .expect("duplicate");

        let result = db
            .with_uow(EventSource::Background, now(), |uow| {
                apply_plan(uow, InboxTaskSource::Habit, 7, &win, &plan, false)
            })
            .expect("heal");
        assert_eq!(result.counts.archived, 1);

        db.with_uow(EventSource::Cli, now(), |uow| {
            let live = uow.find_generated_inbox_tasks(InboxTaskSource::Habit, 7)?;
            assert_eq!(live.len(), 1);
            assert_eq!(live[0].envelope.ref_id, first_ref_id);
            Ok(())
        })
        .expect("check");
    }
}
