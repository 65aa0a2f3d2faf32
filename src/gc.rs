use crate::db::UnitOfWork;
use crate::errors::EngineResult;
use crate::materializer::Materialization;
use crate::models::{
    ArchivedReason, Chore, EntityKind, GenTarget, GenerationFilters, Habit, InboxTask,
    InboxTaskSource, Journal, JournalSettings, Metric, Person, TimePlan, TimePlanSettings,
    TimePlanSource, WorkingMemPrefs,
};
use crate::period::bounds;
use chrono::{Days, NaiveDate};
use std::collections::HashMap;

/// Collects one GC target: archives generated tasks whose source entity is
/// gone, and retires journals/time plans past their retention window.
pub fn collect_target(
    uow: &UnitOfWork<'_>,
    target: GenTarget,
    filters: &GenerationFilters,
    today: NaiveDate,
) -> EngineResult<Materialization> {
    match target {
        GenTarget::Habits => gc_source_tasks(
            uow,
            &[InboxTaskSource::Habit],
            &filters.habit_ref_ids,
            |uow, ref_id| source_is_gone::<Habit>(uow, ref_id),
        ),
        GenTarget::Chores => gc_source_tasks(
            uow,
            &[InboxTaskSource::Chore],
            &filters.chore_ref_ids,
            |uow, ref_id| source_is_gone::<Chore>(uow, ref_id),
        ),
        GenTarget::Metrics => gc_source_tasks(
            uow,
            &[InboxTaskSource::Metric],
            &filters.metric_ref_ids,
            |uow, ref_id| source_is_gone::<Metric>(uow, ref_id),
        ),
        GenTarget::Persons => gc_source_tasks(
            uow,
            &[
                InboxTaskSource::PersonCatchUp,
                InboxTaskSource::PersonBirthday,
            ],
            &filters.person_ref_ids,
            |uow, ref_id| source_is_gone::<Person>(uow, ref_id),
        ),
        GenTarget::WorkingMem => gc_source_tasks(
            uow,
            &[InboxTaskSource::WorkingMemCleanup],
            &None,
            |uow, ref_id| source_is_gone::<WorkingMemPrefs>(uow, ref_id),
        ),
        GenTarget::Journals => gc_journals(uow, filters, today),
        GenTarget::TimePlans => gc_time_plans(uow, today),
    }
}

/// Inbox tasks with `source = big-plan` whose big plan has been archived get
/// their back-link rewritten: untouched ones are retired outright, started
/// ones are detached and moved to the workspace backup project when one is
/// configured.
pub fn sweep_big_plan_links(
    uow: &UnitOfWork<'_>,
    filters: &GenerationFilters,
) -> EngineResult<Materialization> {
    let mut out = Materialization::default();
    let backup_project_ref_id = uow.find_workspace()?.backup_project_ref_id;

    let tasks = uow.find_inbox_tasks_by_source(InboxTaskSource::BigPlan)?;
    let mut gone: HashMap<i64, bool> = HashMap::new();
    for mut task in tasks {
        let Some(big_plan_ref_id) = task.source_ref_id else {
            continue;
        };
        if !GenerationFilters::allows(&filters.big_plan_ref_ids, big_plan_ref_id) {
            continue;
        }
        let dangling = match gone.get(&big_plan_ref_id) {
            Some(flag) => *flag,
            None => {
                let flag = source_is_gone::<crate::models::BigPlan>(uow, big_plan_ref_id)?;
                gone.insert(big_plan_ref_id, flag);
                flag
            }
        };
        if !dangling {
            continue;
        }
        if task.status.is_user_touched() {
            task.source = InboxTaskSource::User;
            task.source_ref_id = None;
            if let Some(backup) = backup_project_ref_id {
                task.project_ref_id = backup;
            }
            uow.save(&mut task)?;
            out.counts.updated += 1;
            out.updated
                .push((EntityKind::InboxTask, task.envelope.ref_id, task.name.clone()));
        } else {
            uow.archive_entity(&mut task, ArchivedReason::Gc)?;
            out.counts.archived += 1;
            out.removed
                .push((EntityKind::InboxTask, task.envelope.ref_id));
        }
    }
    Ok(out)
}

fn source_is_gone<T: crate::db::EntityRecord>(
    uow: &UnitOfWork<'_>,
    ref_id: i64,
) -> EngineResult<bool> {
    Ok(uow
        .try_load::<T>(ref_id, true)?
        .map_or(true, |entity| entity.envelope().archived))
}

fn gc_source_tasks(
    uow: &UnitOfWork<'_>,
    sources: &[InboxTaskSource],
    filter: &Option<Vec<i64>>,
    is_gone: impl Fn(&UnitOfWork<'_>, i64) -> EngineResult<bool>,
) -> EngineResult<Materialization> {
    let mut out = Materialization::default();
    let mut gone: HashMap<i64, bool> = HashMap::new();
    for source in sources {
        for mut task in uow.find_inbox_tasks_by_source(*source)? {
            let Some(source_ref_id) = task.source_ref_id else {
                continue;
            };
            if !GenerationFilters::allows(filter, source_ref_id) {
                continue;
            }
            if task.status.is_user_touched() {
                continue;
            }
            let dangling = match gone.get(&source_ref_id) {
                Some(flag) => *flag,
                None => {
                    let flag = is_gone(uow, source_ref_id)?;
                    gone.insert(source_ref_id, flag);
                    flag
                }
            };
            if dangling {
                archive_task(uow, &mut task, &mut out)?;
            }
        }
    }
    Ok(out)
}

fn gc_journals(
    uow: &UnitOfWork<'_>,
    filters: &GenerationFilters,
    today: NaiveDate,
) -> EngineResult<Materialization> {
    let mut out = Materialization::default();
    let retention = uow
        .find_all::<JournalSettings>(false)?
        .pop()
        .map(|settings| settings.days_until_gc);

    for mut journal in uow.find_all::<Journal>(false)? {
        if !GenerationFilters::allows(&filters.journal_ref_ids, journal.envelope.ref_id) {
            continue;
        }
        let Some(days) = retention else {
            break;
        };
        let (_, end) = bounds(journal.period, journal.right_now);
        if today <= end + Days::new(days.unsigned_abs()) {
            continue;
        }
        let ref_id = journal.envelope.ref_id;
        uow.archive_entity(&mut journal, ArchivedReason::Gc)?;
        out.counts.archived += 1;
        out.removed.push((EntityKind::Journal, ref_id));
        tracing::info!(ref_id, timeline = %journal.timeline, "retired journal");
    }

    // Writing tasks whose journal is gone follow it out.
    out.absorb(gc_source_tasks(
        uow,
        &[InboxTaskSource::Journal],
        &None,
        |uow, ref_id| source_is_gone::<Journal>(uow, ref_id),
    )?);
    Ok(out)
}

fn gc_time_plans(uow: &UnitOfWork<'_>, today: NaiveDate) -> EngineResult<Materialization> {
    let mut out = Materialization::default();
    let retention = uow
        .find_all::<TimePlanSettings>(false)?
        .pop()
        .map(|settings| settings.days_until_gc);

    for mut time_plan in uow.find_all::<TimePlan>(false)? {
        // User-created plans are theirs to retire.
        if time_plan.source != TimePlanSource::Generated {
            continue;
        }
        let Some(days) = retention else {
            break;
        };
        if today <= time_plan.end_date + Days::new(days.unsigned_abs()) {
            continue;
        }
        let ref_id = time_plan.envelope.ref_id;
        uow.archive_entity(&mut time_plan, ArchivedReason::Gc)?;
        out.counts.archived += 1;
        out.removed.push((EntityKind::TimePlan, ref_id));
        tracing::info!(ref_id, timeline = %time_plan.timeline, "retired time plan");
    }

    out.absorb(gc_source_tasks(
        uow,
        &[InboxTaskSource::TimePlan],
        &None,
        |uow, ref_id| source_is_gone::<TimePlan>(uow, ref_id),
    )?);
    Ok(out)
}

fn archive_task(
    uow: &UnitOfWork<'_>,
    task: &mut InboxTask,
    out: &mut Materialization,
) -> EngineResult<()> {
    uow.archive_entity(task, ArchivedReason::Gc)?;
    out.counts.archived += 1;
    out.removed
        .push((EntityKind::InboxTask, task.envelope.ref_id));
    Ok(())
}
