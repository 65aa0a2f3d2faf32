use crate::db::UnitOfWork;
use crate::errors::EngineResult;
use crate::materializer::Materialization;
use crate::models::{ArchivedReason, EntityKind};
use once_cell::sync::Lazy;
use std::collections::HashMap;

/// One owned-link edge: `child` rows match when `filter` holds for the
/// parent's ref id (`?1`).
struct OwnsLink {
    child: EntityKind,
    filter: &'static str,
}

static OWNED_LINKS: Lazy<HashMap<EntityKind, Vec<OwnsLink>>> = Lazy::new(|| {
    let mut links: HashMap<EntityKind, Vec<OwnsLink>> = HashMap::new();
    links.insert(
        EntityKind::Project,
        vec![
            OwnsLink {
                child: EntityKind::Project,
                filter: "parent_project_ref_id = ?1",
            },
            OwnsLink {
                child: EntityKind::Habit,
                filter: "project_ref_id = ?1",
            },
            OwnsLink {
                child: EntityKind::Chore,
                filter: "project_ref_id = ?1",
            },
            OwnsLink {
                child: EntityKind::BigPlan,
                filter: "project_ref_id = ?1",
            },
            OwnsLink {
                child: EntityKind::InboxTask,
                filter: "project_ref_id = ?1",
            },
        ],
    );
    links.insert(
        EntityKind::Habit,
        vec![OwnsLink {
            child: EntityKind::InboxTask,
            filter: "source = 'habit' AND source_ref_id = ?1",
        }],
    );
    links.insert(
        EntityKind::Chore,
        vec![OwnsLink {
            child: EntityKind::InboxTask,
            filter: "source = 'chore' AND source_ref_id = ?1",
        }],
    );
    links.insert(
        EntityKind::Metric,
        vec![OwnsLink {
            child: EntityKind::InboxTask,
            filter: "source = 'metric' AND source_ref_id = ?1",
        }],
    );
    links.insert(
        EntityKind::Person,
        vec![OwnsLink {
            child: EntityKind::InboxTask,
            filter:
                "source IN ('person-catch-up', 'person-birthday') AND source_ref_id = ?1",
        }],
    );
    links.insert(
        EntityKind::BigPlan,
        vec![
            OwnsLink {
                child: EntityKind::BigPlanMilestone,
                filter: "big_plan_ref_id = ?1",
            },
            OwnsLink {
                child: EntityKind::InboxTask,
                filter: "source = 'big-plan' AND source_ref_id = ?1",
            },
        ],
    );
    links.insert(
        EntityKind::Journal,
        vec![OwnsLink {
            child: EntityKind::InboxTask,
            filter: "source = 'journal' AND source_ref_id = ?1",
        }],
    );
    links.insert(
        EntityKind::TimePlan,
        vec![OwnsLink {
            child: EntityKind::InboxTask,
            filter: "source = 'time-plan' AND source_ref_id = ?1",
        }],
    );
    links.insert(
        EntityKind::WorkingMemPrefs,
        vec![OwnsLink {
            child: EntityKind::InboxTask,
            filter: "source = 'working-mem-cleanup' AND source_ref_id = ?1",
        }],
    );
    links
});

/// Archives an entity and everything it owns, children first.
pub fn archive(
    uow: &UnitOfWork<'_>,
    kind: EntityKind,
    ref_id: i64,
) -> EngineResult<Materialization> {
    let mut out = Materialization::default();
    archive_inner(uow, kind, ref_id, &mut out)?;
    Ok(out)
}

fn archive_inner(
    uow: &UnitOfWork<'_>,
    kind: EntityKind,
    ref_id: i64,
    out: &mut Materialization,
) -> EngineResult<()> {
    for link in OWNED_LINKS.get(&kind).map(Vec::as_slice).unwrap_or(&[]) {
        for child_ref_id in uow.child_ref_ids(link.child, link.filter, ref_id, false)? {
            archive_inner(uow, link.child, child_ref_id, out)?;
        }
    }
    if uow.archive_row(kind, ref_id, ArchivedReason::User)? {
        out.counts.archived += 1;
        out.removed.push((kind, ref_id));
    }
    Ok(())
}

/// Hard-deletes an entity and everything it owns, children first. Archived
/// children go too.
pub fn remove(
    uow: &UnitOfWork<'_>,
    kind: EntityKind,
    ref_id: i64,
) -> EngineResult<Materialization> {
    let mut out = Materialization::default();
    remove_inner(uow, kind, ref_id, &mut out)?;
    Ok(out)
}

fn remove_inner(
    uow: &UnitOfWork<'_>,
    kind: EntityKind,
    ref_id: i64,
    out: &mut Materialization,
) -> EngineResult<()> {
    for link in OWNED_LINKS.get(&kind).map(Vec::as_slice).unwrap_or(&[]) {
        for child_ref_id in uow.child_ref_ids(link.child, link.filter, ref_id, true)? {
            remove_inner(uow, link.child, child_ref_id, out)?;
        }
    }
    if uow.remove_row(kind, ref_id)? {
        out.counts.removed += 1;
        out.removed.push((kind, ref_id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{
        BigPlan, BigPlanMilestone, BigPlanStatus, Difficulty, Eisen, Envelope, EventSource,
        Habit, InboxTask, InboxTaskSource, InboxTaskStatus, Project, RecurringTaskGenParams,
        RecurringTaskPeriod,
    };
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).unwrap()
    }

    fn seed_tree(db: &Database) -> (i64, i64, i64) {
        db.with_uow(EventSource::Cli, now(), |uow| {
            let project = uow.create(Project {
                envelope: Envelope::new(now()),
                name: "Health".to_string(),
                parent_project_ref_id: None,
            })?;
            let habit = uow.create(Habit {
                envelope: Envelope::new(now()),
                name: "Run".to_string(),
                project_ref_id: project.envelope.ref_id,
                gen_params: RecurringTaskGenParams::for_period(RecurringTaskPeriod::Daily),
                repeats_in_period_count: None,
                repeats_strategy: None,
                suspended: false,
            })?;
            let task = uow.create(InboxTask {
                envelope: Envelope::new(now()),
                name: "Run".to_string(),
                status: InboxTaskStatus::NotStartedGen,
                project_ref_id: project.envelope.ref_id,
                source: InboxTaskSource::Habit,
                source_ref_id: Some(habit.envelope.ref_id),
                eisen: None,
                difficulty: None,
                actionable_date: None,
                due_date: None,
                completed_time: None,
                recurring_timeline: Some("2024-03-10".to_string()),
                recurring_repeat_index: Some(0),
            })?;
            Ok((
                project.envelope.ref_id,
                habit.envelope.ref_id,
                task.envelope.ref_id,
            ))
        })
        .expect("seed")
    }

    #[test]
    fn archiving_a_habit_archives_its_tasks_first() {
        let db = Database::in_memory().expect("db");
        let (_, habit_ref_id, task_ref_id) = seed_tree(&db);

        let result = db
            .with_uow(EventSource::Cli, now(), |uow| {
                archive(uow, EntityKind::Habit, habit_ref_id)
            })
            .expect("archive");
        assert_eq!(result.counts.archived, 2);

        db.with_uow(EventSource::Cli, now(), |uow| {
            let habit: Habit = uow.load(habit_ref_id, true)?;
            let task: InboxTask = uow.load(task_ref_id, true)?;
            assert!(habit.envelope.archived);
            assert!(task.envelope.archived);
            assert_eq!(task.envelope.archived_reason, Some(ArchivedReason::User));

            // Child's archive event precedes the parent's.
            let habit_events = uow.events_for(EntityKind::Habit, habit_ref_id)?;
            let task_events = uow.events_for(EntityKind::InboxTask, task_ref_id)?;
            let habit_archive = habit_events.last().expect("habit event").session_index;
            let task_archive = task_events.last().expect("task event").session_index;
            assert!(task_archive < habit_archive);
            Ok(())
        })
        .expect("check");
    }

    #[test]
    fn archiving_a_project_walks_the_whole_subtree() {
        let db = Database::in_memory().expect("db");
        let (project_ref_id, habit_ref_id, task_ref_id) = seed_tree(&db);

        let result = db
            .with_uow(EventSource::Cli, now(), |uow| {
                archive(uow, EntityKind::Project, project_ref_id)
            })
            .expect("archive");
        // Project, habit, and the task. The task sits under both the habit
        // and the project, whichever path reaches it first archives it.
        assert_eq!(result.counts.archived, 3);

        db.with_uow(EventSource::Cli, now(), |uow| {
            for (kind, ref_id) in [
                (EntityKind::Project, project_ref_id),
                (EntityKind::Habit, habit_ref_id),
                (EntityKind::InboxTask, task_ref_id),
            ] {
                let events = uow.events_for(kind, ref_id)?;
                assert_eq!(
                    events.last().expect("event").kind,
                    crate::models::EntityEventKind::Archived
                );
            }
            Ok(())
        })
        .expect("check");
    }

    #[test]
    fn remove_deletes_archived_children_too() {
        let db = Database::in_memory().expect("db");

        let big_plan_ref_id = db
            .with_uow(EventSource::Cli, now(), |uow| {
                let big_plan = uow.create(BigPlan {
                    envelope: Envelope::new(now()),
                    name: "Ship it".to_string(),
                    project_ref_id: 1,
                    status: BigPlanStatus::InProgress,
                    eisen: Eisen::Important,
                    difficulty: Difficulty::Medium,
                    actionable_date: None,
                    due_date: None,
                })?;
                let mut milestone = uow.create(BigPlanMilestone {
                    envelope: Envelope::new(now()),
                    big_plan_ref_id: big_plan.envelope.ref_id,
                    date: NaiveDate::from_ymd_opt(2024, 4, 1).expect("date"),
                    description: "Beta".to_string(),
                })?;
                uow.archive_entity(&mut milestone, ArchivedReason::User)?;
                Ok(big_plan.envelope.ref_id)
            })
            .expect("seed");

        let result = db
            .with_uow(EventSource::Cli, now(), |uow| {
                remove(uow, EntityKind::BigPlan, big_plan_ref_id)
            })
            .expect("remove");
        assert_eq!(result.counts.removed, 2);

        db.with_uow(EventSource::Cli, now(), |uow| {
            assert!(uow.try_load::<BigPlan>(big_plan_ref_id, true)?.is_none());
            let milestones: Vec<BigPlanMilestone> = uow.find_all(true)?;
            assert!(milestones.is_empty());
            assert!(uow.events_for(EntityKind::BigPlan, big_plan_ref_id)?.is_empty());
            Ok(())
        })
        .expect("check");
    }
}
