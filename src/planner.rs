use crate::errors::{EngineError, EngineResult};
use crate::models::{
    Chore, Difficulty, Eisen, Habit, InboxTaskSource, Journal, JournalSettings, Metric, Person,
    RecurringTaskGenParams, RecurringTaskPeriod, RepeatsStrategy, TimePlan, TimePlanSettings,
    WorkingMemPrefs,
};
use crate::period::{birthday_in_year, bounds, instances_in_range, lookahead_days, PeriodInstance};
use crate::skip::is_skipped;
use chrono::{Datelike, Days, NaiveDate};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    pub source: InboxTaskSource,
    pub source_ref_id: i64,
    pub project_ref_id: i64,
    pub period: RecurringTaskPeriod,
    pub timeline: String,
    pub repeat_index: i64,
    pub name: String,
    pub due_date: NaiveDate,
    pub actionable_date: Option<NaiveDate>,
    pub eisen: Option<Eisen>,
    pub difficulty: Option<Difficulty>,
}

impl PlanEntry {
    pub fn key(&self) -> (InboxTaskSource, i64, String, i64) {
        (
            self.source,
            self.source_ref_id,
            self.timeline.clone(),
            self.repeat_index,
        )
    }
}

/// The generation window for a period: `[today, today + lookahead]`.
pub fn generation_window(period: RecurringTaskPeriod, today: NaiveDate) -> (NaiveDate, NaiveDate) {
    (today, today + Days::new(lookahead_days(period)))
}

pub fn plan_habit(habit: &Habit, from: NaiveDate, to: NaiveDate) -> EngineResult<Vec<PlanEntry>> {
    if habit.envelope.archived || habit.suspended {
        return Ok(Vec::new());
    }
    let period = required_period(&habit.gen_params)?;
    let repeats = match habit.repeats_in_period_count {
        Some(count) if count > 1 => {
            if habit.repeats_strategy != Some(RepeatsStrategy::AllSame) {
                return Err(EngineError::Validation(format!(
                    "habit {} repeats {count} times per period but has no all-same strategy",
                    habit.envelope.ref_id
                )));
            }
            count
        }
        _ => 1,
    };

    let mut entries = Vec::new();
    for instance in open_instances(&habit.gen_params, period, from, to) {
        let (due, actionable) = resolve_dates(&habit.gen_params, &instance)?;
        for repeat_index in 0..repeats {
            let name = if repeats > 1 {
                format!("{} #{}/{}", habit.name, repeat_index + 1, repeats)
            } else {
                habit.name.clone()
            };
            entries.push(PlanEntry {
                source: InboxTaskSource::Habit,
                source_ref_id: habit.envelope.ref_id,
                project_ref_id: habit.project_ref_id,
                period,
                timeline: instance.timeline.clone(),
                repeat_index: i64::from(repeat_index),
                name,
                due_date: due,
                actionable_date: actionable,
                eisen: habit.gen_params.eisen,
                difficulty: habit.gen_params.difficulty,
            });
        }
    }
    Ok(entries)
}

pub fn plan_chore(chore: &Chore, from: NaiveDate, to: NaiveDate) -> EngineResult<Vec<PlanEntry>> {
    if chore.envelope.archived || chore.suspended {
        return Ok(Vec::new());
    }
    let period = required_period(&chore.gen_params)?;

    let mut entries = Vec::new();
    for instance in open_instances(&chore.gen_params, period, from, to) {
        if let Some(start_at) = chore.start_at_date {
            if instance.end_date < start_at {
                continue;
            }
        }
        if let Some(end_at) = chore.end_at_date {
            if instance.start_date > end_at {
                continue;
            }
        }
        let (due, actionable) = resolve_dates(&chore.gen_params, &instance)?;
        entries.push(PlanEntry {
            source: InboxTaskSource::Chore,
            source_ref_id: chore.envelope.ref_id,
            project_ref_id: chore.project_ref_id,
            period,
            timeline: instance.timeline,
            repeat_index: 0,
            name: chore.name.clone(),
            due_date: due,
            actionable_date: actionable,
            eisen: chore.gen_params.eisen,
            difficulty: chore.gen_params.difficulty,
        });
    }
    Ok(entries)
}

pub fn plan_metric(
    metric: &Metric,
    default_project_ref_id: i64,
    from: NaiveDate,
    to: NaiveDate,
) -> EngineResult<Vec<PlanEntry>> {
    if metric.envelope.archived {
        return Ok(Vec::new());
    }
    let Some(params) = &metric.collection_params else {
        return Ok(Vec::new());
    };
    let period = required_period(params)?;
    let project_ref_id = metric
        .collection_project_ref_id
        .unwrap_or(default_project_ref_id);

    let mut entries = Vec::new();
    for instance in open_instances(params, period, from, to) {
        let (due, actionable) = resolve_dates(params, &instance)?;
        entries.push(PlanEntry {
            source: InboxTaskSource::Metric,
            source_ref_id: metric.envelope.ref_id,
            project_ref_id,
            period,
            timeline: instance.timeline,
            repeat_index: 0,
            name: format!("Collect value for {}", metric.name),
            due_date: due,
            actionable_date: actionable,
            eisen: params.eisen,
            difficulty: params.difficulty,
        });
    }
    Ok(entries)
}

pub fn plan_person_catch_up(
    person: &Person,
    default_project_ref_id: i64,
    from: NaiveDate,
    to: NaiveDate,
) -> EngineResult<Vec<PlanEntry>> {
    if person.envelope.archived {
        return Ok(Vec::new());
    }
    let Some(params) = &person.catch_up_params else {
        return Ok(Vec::new());
    };
    let period = required_period(params)?;
    let project_ref_id = person
        .catch_up_project_ref_id
        .unwrap_or(default_project_ref_id);

    let mut entries = Vec::new();
    for instance in open_instances(params, period, from, to) {
        let (due, actionable) = resolve_dates(params, &instance)?;
        entries.push(PlanEntry {
            source: InboxTaskSource::PersonCatchUp,
            source_ref_id: person.envelope.ref_id,
            project_ref_id,
            period,
            timeline: instance.timeline,
            repeat_index: 0,
            name: format!("Catch up with {}", person.name),
            due_date: due,
            actionable_date: actionable,
            eisen: params.eisen,
            difficulty: params.difficulty,
        });
    }
    Ok(entries)
}

pub fn plan_person_birthday(
    person: &Person,
    default_project_ref_id: i64,
    from: NaiveDate,
    to: NaiveDate,
) -> EngineResult<Vec<PlanEntry>> {
    if person.envelope.archived {
        return Ok(Vec::new());
    }
    let Some(birthday) = person.birthday else {
        return Ok(Vec::new());
    };
    let project_ref_id = person
        .catch_up_project_ref_id
        .unwrap_or(default_project_ref_id);

    let mut entries = Vec::new();
    for instance in instances_in_range(RecurringTaskPeriod::Yearly, from, to) {
        let year = instance.start_date.year();
        let date = birthday_in_year(birthday.day, birthday.month, year)?;
        if date < from || date > to {
            continue;
        }
        entries.push(PlanEntry {
            source: InboxTaskSource::PersonBirthday,
            source_ref_id: person.envelope.ref_id,
            project_ref_id,
            period: RecurringTaskPeriod::Yearly,
            timeline: instance.timeline,
            repeat_index: 0,
            name: format!("Wish happy birthday to {}", person.name),
            due_date: date,
            actionable_date: Some(date),
            eisen: None,
            difficulty: None,
        });
    }
    Ok(entries)
}

pub fn plan_working_mem_cleanup(
    prefs: &WorkingMemPrefs,
    from: NaiveDate,
    to: NaiveDate,
) -> EngineResult<Vec<PlanEntry>> {
    if prefs.envelope.archived {
        return Ok(Vec::new());
    }
    let period = prefs.generation_period;
    if !matches!(
        period,
        RecurringTaskPeriod::Daily | RecurringTaskPeriod::Weekly
    ) {
        return Err(EngineError::Validation(format!(
            "working memory cleanup only runs daily or weekly, not {}",
            period.as_str()
        )));
    }

    let params = RecurringTaskGenParams::for_period(period);
    let mut entries = Vec::new();
    for instance in instances_in_range(period, from, to) {
        let (due, actionable) = resolve_dates(&params, &instance)?;
        entries.push(PlanEntry {
            source: InboxTaskSource::WorkingMemCleanup,
            source_ref_id: prefs.envelope.ref_id,
            project_ref_id: prefs.cleanup_project_ref_id,
            period,
            timeline: instance.timeline,
            repeat_index: 0,
            name: "Clean up working memory".to_string(),
            due_date: due,
            actionable_date: actionable,
            eisen: Some(Eisen::Important),
            difficulty: Some(Difficulty::Easy),
        });
    }
    Ok(entries)
}

/// The companion writing task for a generated journal.
pub fn journal_writing_entry(settings: &JournalSettings, journal: &Journal) -> PlanEntry {
    let (start, end) = bounds(journal.period, journal.right_now);
    PlanEntry {
        source: InboxTaskSource::Journal,
        source_ref_id: journal.envelope.ref_id,
        project_ref_id: settings.writing_task_project_ref_id,
        period: journal.period,
        timeline: journal.timeline.clone(),
        repeat_index: 0,
        name: format!("Write journal entry for {}", journal.timeline),
        due_date: end,
        actionable_date: Some(start),
        eisen: settings.writing_task_eisen,
        difficulty: settings.writing_task_difficulty,
    }
}

/// The companion planning task for a generated time plan.
pub fn time_plan_planning_entry(settings: &TimePlanSettings, time_plan: &TimePlan) -> PlanEntry {
    PlanEntry {
        source: InboxTaskSource::TimePlan,
        source_ref_id: time_plan.envelope.ref_id,
        project_ref_id: settings.planning_task_project_ref_id,
        period: time_plan.period,
        timeline: time_plan.timeline.clone(),
        repeat_index: 0,
        name: format!("Plan your time for {}", time_plan.timeline),
        due_date: time_plan.end_date,
        actionable_date: Some(time_plan.start_date),
        eisen: settings.planning_task_eisen,
        difficulty: settings.planning_task_difficulty,
    }
}

fn required_period(params: &RecurringTaskGenParams) -> EngineResult<RecurringTaskPeriod> {
    params
        .period
        .ok_or_else(|| EngineError::Validation("recurring source has no period".to_string()))
}

fn open_instances(
    params: &RecurringTaskGenParams,
    period: RecurringTaskPeriod,
    from: NaiveDate,
    to: NaiveDate,
) -> Vec<PeriodInstance> {
    instances_in_range(period, from, to)
        .into_iter()
        .filter(|instance| !is_skipped(params.skip_rule.as_ref(), period, instance.start_date))
        .collect()
}

fn resolve_dates(
    params: &RecurringTaskGenParams,
    instance: &PeriodInstance,
) -> EngineResult<(NaiveDate, Option<NaiveDate>)> {
    let due = crate::period::resolve_due(params, instance.start_date, instance.end_date)?;
    let actionable =
        crate::period::resolve_actionable(params, instance.start_date, instance.end_date, due)?;
    Ok((due, actionable))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ArchivedReason, Envelope, PersonBirthday, PersonRelationship, SkipParity, SkipRule,
    };
    use chrono::{TimeZone, Utc};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("date")
    }

    fn envelope(ref_id: i64) -> Envelope {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Envelope {
            ref_id,
            version: 1,
            archived: false,
            archived_reason: None,
            created_time: created,
            last_modified_time: created,
            archived_time: None,
        }
    }

    fn daily_habit(ref_id: i64, name: &str) -> Habit {
        Habit {
            envelope: envelope(ref_id),
            name: name.to_string(),
            project_ref_id: 1,
            gen_params: RecurringTaskGenParams {
                period: Some(RecurringTaskPeriod::Daily),
                eisen: Some(Eisen::Important),
                ..RecurringTaskGenParams::default()
            },
            repeats_in_period_count: None,
            repeats_strategy: None,
            suspended: false,
        }
    }

    #[test]
    fn daily_habit_yields_one_entry_per_day() {
        let habit = daily_habit(7, "Meditate");
        let entries = plan_habit(&habit, date(2024, 3, 1), date(2024, 3, 3)).expect("plan");
        let timelines: Vec<&str> = entries.iter().map(|e| e.timeline.as_str()).collect();
        assert_eq!(timelines, vec!["2024-03-01", "2024-03-02", "2024-03-03"]);
        for entry in &entries {
            assert_eq!(entry.source, InboxTaskSource::Habit);
            assert_eq!(entry.source_ref_id, 7);
            assert_eq!(entry.eisen, Some(Eisen::Important));
            assert_eq!(entry.repeat_index, 0);
        }
    }

    #[test]
    fn odd_skip_rule_keeps_only_even_weeks() {
        let mut habit = daily_habit(2, "Review");
        habit.gen_params.period = Some(RecurringTaskPeriod::Weekly);
        habit.gen_params.skip_rule = Some(SkipRule::Parity(SkipParity::Odd));
        // Window spanning ISO weeks 2024-W07 through 2024-W09.
        let entries = plan_habit(&habit, date(2024, 2, 12), date(2024, 3, 3)).expect("plan");
        let timelines: Vec<&str> = entries.iter().map(|e| e.timeline.as_str()).collect();
        assert_eq!(timelines, vec!["2024-W08"]);
    }

    #[test]
    fn repeats_share_dates_and_carry_indexed_names() {
        let mut habit = daily_habit(3, "H3");
        habit.repeats_in_period_count = Some(3);
        habit.repeats_strategy = Some(RepeatsStrategy::AllSame);
        let entries = plan_habit(&habit, date(2024, 3, 1), date(2024, 3, 1)).expect("plan");
        assert_eq!(entries.len(), 3);
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["H3 #1/3", "H3 #2/3", "H3 #3/3"]);
        let indices: Vec<i64> = entries.iter().map(|e| e.repeat_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(entries.iter().all(|e| e.due_date == date(2024, 3, 1)));
    }

    #[test]
    fn repeats_without_strategy_are_rejected() {
        let mut habit = daily_habit(4, "Broken");
        habit.repeats_in_period_count = Some(2);
        let err = plan_habit(&habit, date(2024, 3, 1), date(2024, 3, 1)).expect_err("invalid");
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn suspended_and_archived_sources_plan_nothing() {
        let mut habit = daily_habit(5, "Paused");
        habit.suspended = true;
        assert!(plan_habit(&habit, date(2024, 3, 1), date(2024, 3, 3))
            .expect("plan")
            .is_empty());

        let mut habit = daily_habit(6, "Gone");
        habit.envelope.archived = true;
        habit.envelope.archived_reason = Some(ArchivedReason::User);
        assert!(plan_habit(&habit, date(2024, 3, 1), date(2024, 3, 3))
            .expect("plan")
            .is_empty());
    }

    #[test]
    fn chore_respects_its_active_range() {
        let chore = Chore {
            envelope: envelope(9),
            name: "Change filters".to_string(),
            project_ref_id: 1,
            gen_params: RecurringTaskGenParams::for_period(RecurringTaskPeriod::Daily),
            start_at_date: Some(date(2024, 3, 2)),
            end_at_date: Some(date(2024, 3, 2)),
            must_do: false,
            suspended: false,
        };
        let entries = plan_chore(&chore, date(2024, 3, 1), date(2024, 3, 3)).expect("plan");
        let timelines: Vec<&str> = entries.iter().map(|e| e.timeline.as_str()).collect();
        assert_eq!(timelines, vec!["2024-03-02"]);
    }

    #[test]
    fn metric_without_collection_params_plans_nothing() {
        let metric = Metric {
            envelope: envelope(11),
            name: "Weight".to_string(),
            unit: Some("kg".to_string()),
            collection_project_ref_id: None,
            collection_params: None,
        };
        assert!(plan_metric(&metric, 1, date(2024, 3, 1), date(2024, 3, 3))
            .expect("plan")
            .is_empty());
    }

    #[test]
    fn birthday_is_planned_only_when_the_window_contains_it() {
        let person = Person {
            envelope: envelope(21),
            name: "Ana".to_string(),
            relationship: PersonRelationship::Friend,
            catch_up_project_ref_id: None,
            catch_up_params: None,
            birthday: Some(PersonBirthday { day: 29, month: 2 }),
        };
        let hit = plan_person_birthday(&person, 1, date(2023, 2, 1), date(2023, 3, 3))
            .expect("plan");
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].due_date, date(2023, 2, 28));
        assert_eq!(hit[0].timeline, "2023");

        let miss = plan_person_birthday(&person, 1, date(2023, 6, 1), date(2023, 7, 1))
            .expect("plan");
        assert!(miss.is_empty());
    }

    #[test]
    fn planning_is_pure_over_identical_inputs() {
        let habit = daily_habit(30, "Stretch");
        let first = plan_habit(&habit, date(2024, 3, 1), date(2024, 3, 5)).expect("plan");
        let second = plan_habit(&habit, date(2024, 3, 1), date(2024, 3, 5)).expect("plan");
        assert_eq!(first, second);
    }
}
