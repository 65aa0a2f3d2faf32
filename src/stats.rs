use crate::db::UnitOfWork;
use crate::errors::{EngineError, EngineResult};
use crate::models::{
    BigPlanStats, Difficulty, Habit, HabitStreakMark, HabitStreakStatus, InboxTask,
    InboxTaskStatus, Journal, JournalStats, RecurringTaskPeriod, ScoreLogEntry, ScoreSource,
};
use crate::period::{bounds, timeline};
use crate::planner::plan_habit;
use chrono::{Datelike, NaiveDate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};

const LUCKY_PUPPY_CHANCE: f64 = 0.1;
const LIFETIME_TIMELINE: &str = "lifetime";

/// Recomputes the streak marks for one habit over one year. Returns the
/// number of marks written.
pub fn refresh_habit_streaks(
    uow: &UnitOfWork<'_>,
    habit: &Habit,
    year: i32,
    today: NaiveDate,
) -> EngineResult<usize> {
    let from = NaiveDate::from_ymd_opt(year, 1, 1)
        .ok_or_else(|| EngineError::Validation(format!("year {year} is out of range")))?;
    let to = NaiveDate::from_ymd_opt(year, 12, 31)
        .ok_or_else(|| EngineError::Validation(format!("year {year} is out of range")))?;
    let period = habit.gen_params.period.ok_or_else(|| {
        EngineError::Validation(format!("habit {} has no period", habit.envelope.ref_id))
    })?;

    let mut schedule: BTreeMap<String, Vec<NaiveDate>> = BTreeMap::new();
    for entry in plan_habit(habit, from, to)? {
        let slots = schedule.entry(entry.timeline.clone()).or_default();
        let index = entry.repeat_index as usize;
        if slots.len() <= index {
            slots.resize(index + 1, entry.due_date);
        }
        slots[index] = entry.due_date;
    }

    let tasks = uow.find_generated_inbox_tasks(
        crate::models::InboxTaskSource::Habit,
        habit.envelope.ref_id,
    )?;
    let mut by_key: HashMap<(String, i64), InboxTask> = HashMap::new();
    for task in tasks {
        if let (Some(tl), Some(index)) = (task.recurring_timeline.clone(), task.recurring_repeat_index)
        {
            by_key.insert((tl, index), task);
        }
    }

    let mut written = 0;
    for (instance_timeline, slots) in schedule {
        let mut statuses = Vec::with_capacity(slots.len());
        let mut mark_date = slots[0];
        for (index, due) in slots.iter().enumerate() {
            mark_date = bounds(period, *due).0;
            let status = match by_key.get(&(instance_timeline.clone(), index as i64)) {
                Some(task) => match task.status {
                    InboxTaskStatus::Done => HabitStreakStatus::Done,
                    InboxTaskStatus::NotDone => HabitStreakStatus::NotDone,
                    _ if *due < today => HabitStreakStatus::Missed,
                    _ => HabitStreakStatus::Scheduled,
                },
                None if *due < today => HabitStreakStatus::Missed,
                None => HabitStreakStatus::Scheduled,
            };
            statuses.push(status);
        }
        uow.upsert_streak_mark(&HabitStreakMark {
            habit_ref_id: habit.envelope.ref_id,
            year,
            date: mark_date,
            statuses,
        })?;
        written += 1;
    }
    Ok(written)
}

/// Recounts the inbox tasks under one big plan.
pub fn refresh_big_plan_stats(
    uow: &UnitOfWork<'_>,
    big_plan_ref_id: i64,
) -> EngineResult<BigPlanStats> {
    let tasks = uow.find_inbox_tasks_for_big_plan(big_plan_ref_id)?;
    let stats = BigPlanStats {
        big_plan_ref_id,
        all_inbox_tasks_cnt: tasks.len() as i64,
        completed_inbox_tasks_cnt: tasks
            .iter()
            .filter(|task| task.status.is_completed())
            .count() as i64,
    };
    uow.upsert_big_plan_stats(&stats)?;
    Ok(stats)
}

/// Builds the journal's report: status counts per source over the journal's
/// period instance, covering tasks completed or created inside it.
pub fn refresh_journal_report(
    uow: &UnitOfWork<'_>,
    journal: &Journal,
) -> EngineResult<JournalStats> {
    let (start, end) = bounds(journal.period, journal.right_now);
    let completed = uow.find_inbox_tasks_completed_between(start, end)?;
    let created: Vec<InboxTask> = uow.find_where(
        "archived = 0 AND completed_time IS NULL AND created_time >= ?1 AND created_time < ?2",
        &[
            &start.format("%Y-%m-%d").to_string(),
            &(end + chrono::Days::new(1)).format("%Y-%m-%d").to_string(),
        ],
    )?;

    let mut by_source: BTreeMap<&'static str, BTreeMap<&'static str, i64>> = BTreeMap::new();
    let mut total: BTreeMap<&'static str, i64> = BTreeMap::new();
    for task in completed.iter().chain(created.iter()) {
        if !journal.sources.contains(&task.source) {
            continue;
        }
        *by_source
            .entry(task.source.as_str())
            .or_default()
            .entry(task.status.as_str())
            .or_default() += 1;
        *total.entry(task.status.as_str()).or_default() += 1;
    }

    let stats = JournalStats {
        journal_ref_id: journal.envelope.ref_id,
        report: serde_json::json!({
            "timeline": journal.timeline,
            "bySource": by_source,
            "total": total,
        }),
    };
    uow.upsert_journal_stats(&stats)?;
    Ok(stats)
}

/// Appends a score for a completed entity and raises the period bests.
/// A second call for the same entity is a no-op and returns `None`.
pub fn record_completion(
    uow: &UnitOfWork<'_>,
    workspace_ref_id: i64,
    source: ScoreSource,
    entity_ref_id: i64,
    difficulty: Option<Difficulty>,
    today: NaiveDate,
) -> EngineResult<Option<ScoreLogEntry>> {
    let base = match source {
        ScoreSource::InboxTask => difficulty.map_or(1, Difficulty::score_points),
        ScoreSource::BigPlan => difficulty.map_or(1, Difficulty::score_points) * 5,
    };
    let lucky = lucky_puppy(workspace_ref_id, today);
    let entry = ScoreLogEntry {
        id: 0,
        created_time: uow.now(),
        source,
        source_entity_ref_id: entity_ref_id,
        difficulty,
        score_delta: if lucky { base * 2 } else { base },
        had_lucky_puppy_bonus: lucky,
        timeline_daily: timeline(RecurringTaskPeriod::Daily, today),
        timeline_weekly: timeline(RecurringTaskPeriod::Weekly, today),
        timeline_monthly: timeline(RecurringTaskPeriod::Monthly, today),
        timeline_quarterly: timeline(RecurringTaskPeriod::Quarterly, today),
        timeline_yearly: timeline(RecurringTaskPeriod::Yearly, today),
    };
    if !uow.insert_score_log(&entry)? {
        return Ok(None);
    }

    let mut sums: HashMap<RecurringTaskPeriod, i64> = HashMap::new();
    for sub in RecurringTaskPeriod::all() {
        sums.insert(sub, uow.sum_score(sub, entry.timeline_for(sub))?);
    }

    for sub in RecurringTaskPeriod::all() {
        uow.raise_period_best(None, LIFETIME_TIMELINE, sub, sums[&sub])?;
    }
    for container in RecurringTaskPeriod::all() {
        let container_timeline = entry.timeline_for(container);
        for sub in RecurringTaskPeriod::all() {
            if period_rank(sub) >= period_rank(container) {
                continue;
            }
            uow.raise_period_best(Some(container), container_timeline, sub, sums[&sub])?;
        }
    }
    Ok(Some(entry))
}

fn period_rank(period: RecurringTaskPeriod) -> u8 {
    match period {
        RecurringTaskPeriod::Daily => 0,
        RecurringTaskPeriod::Weekly => 1,
        RecurringTaskPeriod::Monthly => 2,
        RecurringTaskPeriod::Quarterly => 3,
        RecurringTaskPeriod::Yearly => 4,
    }
}

// One coin flip per workspace per day, stable across calls.
fn lucky_puppy(workspace_ref_id: i64, today: NaiveDate) -> bool {
    let seed = (workspace_ref_id as u64)
        .rotate_left(32)
        .wrapping_add(today.num_days_from_ce() as u64);
    StdRng::seed_from_u64(seed).random_bool(LUCKY_PUPPY_CHANCE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{
        ArchivedReason, Envelope, EventSource, InboxTaskSource, RecurringTaskGenParams,
        RepeatsStrategy,
    };
    use chrono::{DateTime, TimeZone, Utc};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).unwrap()
    }

    fn day(year: i32, month: u32, dom: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, dom).expect("date")
    }

    fn task(source: InboxTaskSource, source_ref_id: Option<i64>) -> InboxTask {
        InboxTask {
            envelope: Envelope::new(now()),
            name: "Task".to_string(),
            status: InboxTaskStatus::NotStartedGen,
            project_ref_id: 1,
            source,
            source_ref_id,
            eisen: None,
            difficulty: None,
            actionable_date: None,
            due_date: None,
            completed_time: None,
            recurring_timeline: None,
            recurring_repeat_index: None,
        }
    }

    #[test]
    fn big_plan_recount_is_stable_across_runs() {
        let db = Database::in_memory().expect("db");

        db.with_uow(EventSource::Background, now(), |uow| {
            for index in 0..4 {
                let mut child = task(InboxTaskSource::BigPlan, Some(99));
                if index < 3 {
                    child.status = InboxTaskStatus::Done;
                    child.completed_time = Some(now());
                }
                uow.create(child)?;
            }
            Ok(())
        })
        .expect("seed");

        let first = db
            .with_uow(EventSource::Background, now(), |uow| {
                refresh_big_plan_stats(uow, 99)
            })
            .expect("first");
        assert_eq!(first.all_inbox_tasks_cnt, 4);
        assert_eq!(first.completed_inbox_tasks_cnt, 3);

        let second = db
            .with_uow(EventSource::Background, now(), |uow| {
                refresh_big_plan_stats(uow, 99)
            })
            .expect("second");
        assert_eq!(first, second);
    }

    #[test]
    fn streak_marks_mix_done_missed_and_scheduled() {
        let db = Database::in_memory().expect("db");
        let today = day(2024, 3, 10);

        db.with_uow(EventSource::Background, now(), |uow| {
            let habit = uow.create(Habit {
                envelope: Envelope::new(now()),
                name: "Stretch".to_string(),
                project_ref_id: 1,
                gen_params: RecurringTaskGenParams::for_period(RecurringTaskPeriod::Daily),
                repeats_in_period_count: None,
                repeats_strategy: None,
                suspended: false,
            })?;

            let mut done = task(InboxTaskSource::Habit, Some(habit.envelope.ref_id));
            done.status = InboxTaskStatus::Done;
            done.completed_time = Some(now());
            done.due_date = Some(day(2024, 3, 8));
            done.recurring_timeline = Some("2024-03-08".to_string());
            done.recurring_repeat_index = Some(0);
            uow.create(done)?;

            let written = refresh_habit_streaks(uow, &habit, 2024, today)?;
            assert_eq!(written, 366);

            let marks = uow.find_streak_marks(habit.envelope.ref_id, 2024)?;
            let by_date: std::collections::HashMap<NaiveDate, Vec<HabitStreakStatus>> =
                marks.into_iter().map(|m| (m.date, m.statuses)).collect();
            assert_eq!(by_date[&day(2024, 3, 8)], vec![HabitStreakStatus::Done]);
            assert_eq!(by_date[&day(2024, 3, 9)], vec![HabitStreakStatus::Missed]);
            assert_eq!(by_date[&day(2024, 3, 10)], vec![HabitStreakStatus::Scheduled]);
            assert_eq!(by_date[&day(2024, 12, 31)], vec![HabitStreakStatus::Scheduled]);
            Ok(())
        })
        .expect("streaks");
    }

    #[test]
    fn streak_marks_carry_one_status_per_repeat() {
        let db = Database::in_memory().expect("db");

        db.with_uow(EventSource::Background, now(), |uow| {
            let habit = uow.create(Habit {
                envelope: Envelope::new(now()),
                name: "Drink water".to_string(),
                project_ref_id: 1,
                gen_params: RecurringTaskGenParams::for_period(RecurringTaskPeriod::Daily),
                repeats_in_period_count: Some(3),
                repeats_strategy: Some(RepeatsStrategy::AllSame),
                suspended: false,
            })?;
            refresh_habit_streaks(uow, &habit, 2024, day(2024, 3, 10))?;

            let marks = uow.find_streak_marks(habit.envelope.ref_id, 2024)?;
            assert!(marks.iter().all(|mark| mark.statuses.len() == 3));
            Ok(())
        })
        .expect("repeats");
    }

    #[test]
    fn journal_report_counts_by_source_and_status() {
        let db = Database::in_memory().expect("db");

        db.with_uow(EventSource::Background, now(), |uow| {
            let journal = uow.create(Journal {
                envelope: Envelope::new(now()),
                right_now: day(2024, 3, 6),
                period: RecurringTaskPeriod::Weekly,
                timeline: "2024-W10".to_string(),
                sources: vec![InboxTaskSource::User, InboxTaskSource::Habit],
            })?;

            let mut done = task(InboxTaskSource::Habit, Some(1));
            done.status = InboxTaskStatus::Done;
            done.completed_time = Some(now());
            uow.create(done)?;

            let mut open = task(InboxTaskSource::User, None);
            open.status = InboxTaskStatus::InProgress;
            uow.create(open)?;

            // Out-of-scope source, never counted.
            let mut slack = task(InboxTaskSource::SlackTask, None);
            slack.status = InboxTaskStatus::Done;
            slack.completed_time = Some(now());
            uow.create(slack)?;

            let stats = refresh_journal_report(uow, &journal)?;
            assert_eq!(stats.report["bySource"]["habit"]["done"], 1);
            assert_eq!(stats.report["bySource"]["user"]["in-progress"], 1);
            assert_eq!(stats.report["total"]["done"], 1);
            assert!(stats.report["bySource"].get("slack-task").is_none());
            Ok(())
        })
        .expect("report");
    }

    #[test]
    fn completion_scores_once_and_raises_bests() {
        let db = Database::in_memory().expect("db");
        let today = day(2024, 3, 10);

        db.with_uow(EventSource::Cli, now(), |uow| {
            let first = record_completion(
                uow,
                1,
                ScoreSource::InboxTask,
                42,
                Some(Difficulty::Medium),
                today,
            )?;
            let entry = first.expect("scored");
            let base = if entry.had_lucky_puppy_bonus { 4 } else { 2 };
            assert_eq!(entry.score_delta, base);

            let again = record_completion(
                uow,
                1,
                ScoreSource::InboxTask,
                42,
                Some(Difficulty::Medium),
                today,
            )?;
            assert!(again.is_none());

            let best = uow
                .find_period_best(None, LIFETIME_TIMELINE, RecurringTaskPeriod::Daily)?
                .expect("best");
            assert_eq!(best.total_score, entry.score_delta);

            let weekly_best = uow
                .find_period_best(
                    Some(RecurringTaskPeriod::Yearly),
                    "2024",
                    RecurringTaskPeriod::Weekly,
                )?
                .expect("weekly best under the year");
            assert_eq!(weekly_best.total_score, entry.score_delta);
            Ok(())
        })
        .expect("scoring");
    }

    #[test]
    fn big_plan_completions_score_five_times_the_difficulty() {
        let db = Database::in_memory().expect("db");
        let today = day(2024, 3, 10);

        db.with_uow(EventSource::Cli, now(), |uow| {
            let entry = record_completion(
                uow,
                1,
                ScoreSource::BigPlan,
                7,
                Some(Difficulty::Hard),
                today,
            )?
            .expect("scored");
            let base = if entry.had_lucky_puppy_bonus { 50 } else { 25 };
            assert_eq!(entry.score_delta, base);
            Ok(())
        })
        .expect("scoring");
    }

    #[test]
    fn lucky_puppy_is_deterministic_per_day() {
        let today = day(2024, 3, 10);
        assert_eq!(lucky_puppy(1, today), lucky_puppy(1, today));
        let flips: Vec<bool> = (0..60)
            .map(|offset| lucky_puppy(1, today + chrono::Days::new(offset)))
            .collect();
        assert!(!flips.iter().all(|flip| *flip));
    }

    #[test]
    fn archived_tasks_do_not_count_toward_big_plan_stats() {
        let db = Database::in_memory().expect("db");

        db.with_uow(EventSource::Background, now(), |uow| {
            let mut gone = uow.create(task(InboxTaskSource::BigPlan, Some(5)))?;
            uow.archive_entity(&mut gone, ArchivedReason::User)?;
            uow.create(task(InboxTaskSource::BigPlan, Some(5)))?;

            let stats = refresh_big_plan_stats(uow, 5)?;
            assert_eq!(stats.all_inbox_tasks_cnt, 1);
            Ok(())
        })
        .expect("stats");
    }
}
