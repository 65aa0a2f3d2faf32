use crate::errors::{EngineError, EngineResult};
use crate::models::{
    ArchivedReason, BigPlan, BigPlanMilestone, BigPlanStats, Chore, Envelope, EntityEvent,
    EntityEventKind, EntityKind, EventSource, GcLogEntry, GenLogEntry, GenTarget, Habit,
    HabitStreakMark, InboxTask, InboxTaskSource, Journal, JournalSettings, JournalStats, Metric,
    Person, PersonBirthday, Project, RecurringTaskPeriod, ScheduleExternalEvent,
    ScheduleExternalSyncLogEntry, ScoreLogEntry, ScorePeriodBest, ScoreSource, TimePlan,
    TimePlanSettings, Workspace, WorkingMemPrefs,
};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::cell::Cell;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

const SCHEMA_SQL: &str = include_str!("schema.sql");
const ENVELOPE_COLUMNS: &str =
    "ref_id, version, archived, archived_reason, created_time, last_modified_time, archived_time";
const MAX_LOG_PAGE: u32 = 1000;

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new(path: &Path) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Runs `work` inside one transaction. The connection mutex doubles as
    /// the per-workspace serialization key: no two runs interleave.
    pub fn with_uow<T>(
        &self,
        source: EventSource,
        now: DateTime<Utc>,
        work: impl FnOnce(&UnitOfWork<'_>) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| EngineError::Storage("database mutex poisoned".to_string()))?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        let uow = UnitOfWork {
            conn: &conn,
            source,
            now,
            session_index: Cell::new(0),
        };
        match work(&uow) {
            Ok(value) => {
                conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                    tracing::warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    pub fn upsert_search_entries(
        &self,
        entries: &[(EntityKind, i64, String)],
    ) -> EngineResult<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| EngineError::Storage("database mutex poisoned".to_string()))?;
        for (kind, ref_id, name) in entries {
            conn.execute(
                "INSERT INTO search_index (entity_tag, ref_id, name) VALUES (?1, ?2, ?3)
                 ON CONFLICT (entity_tag, ref_id) DO UPDATE SET name = excluded.name",
                params![kind.as_str(), ref_id, name],
            )?;
        }
        Ok(())
    }

    pub fn remove_search_entries(&self, entries: &[(EntityKind, i64)]) -> EngineResult<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| EngineError::Storage("database mutex poisoned".to_string()))?;
        for (kind, ref_id) in entries {
            conn.execute(
                "DELETE FROM search_index WHERE entity_tag = ?1 AND ref_id = ?2",
                params![kind.as_str(), ref_id],
            )?;
        }
        Ok(())
    }

    pub fn search_names(&self, query: &str) -> EngineResult<Vec<(EntityKind, i64, String)>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| EngineError::Storage("database mutex poisoned".to_string()))?;
        let mut statement = conn.prepare(
            "SELECT entity_tag, ref_id, name FROM search_index WHERE name LIKE ?1 ORDER BY name",
        )?;
        let rows = statement.query_map([format!("%{query}%")], |row| {
            Ok((
                token::<EntityKind>(row.get::<_, String>(0)?)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn find_last_gen_logs(&self, limit: u32) -> EngineResult<Vec<GenLogEntry>> {
        let limit = check_log_limit(limit)?;
        let conn = self
            .conn
            .lock()
            .map_err(|_| EngineError::Storage("database mutex poisoned".to_string()))?;
        let mut statement = conn.prepare(
            "SELECT id, created_time, source, today, gen_even_if_not_modified, targets_json,
                    period_filter_json, filter_ref_ids_json, per_target_counts_json
             FROM gen_log ORDER BY created_time DESC, id DESC LIMIT ?1",
        )?;
        let rows = statement.query_map([limit], parse_gen_log_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn find_last_gc_logs(&self, limit: u32) -> EngineResult<Vec<GcLogEntry>> {
        let limit = check_log_limit(limit)?;
        let conn = self
            .conn
            .lock()
            .map_err(|_| EngineError::Storage("database mutex poisoned".to_string()))?;
        let mut statement = conn.prepare(
            "SELECT id, created_time, source, today, targets_json, filter_ref_ids_json,
                    per_target_counts_json
             FROM gc_log ORDER BY created_time DESC, id DESC LIMIT ?1",
        )?;
        let rows = statement.query_map([limit], parse_gc_log_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn find_last_sync_logs(
        &self,
        stream_ref_id: i64,
        limit: u32,
    ) -> EngineResult<Vec<ScheduleExternalSyncLogEntry>> {
        let limit = check_log_limit(limit)?;
        let conn = self
            .conn
            .lock()
            .map_err(|_| EngineError::Storage("database mutex poisoned".to_string()))?;
        let mut statement = conn.prepare(
            "SELECT id, created_time, stream_ref_id, sync_start, sync_end, entities_upserted,
                    even_more_entity_records, errors_json
             FROM schedule_sync_log WHERE stream_ref_id = ?1
             ORDER BY created_time DESC, id DESC LIMIT ?2",
        )?;
        let rows = statement.query_map(params![stream_ref_id, limit], parse_sync_log_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn check_log_limit(limit: u32) -> EngineResult<u32> {
    if limit == 0 || limit > MAX_LOG_PAGE {
        return Err(EngineError::Validation(format!(
            "log page size {limit} must be between 1 and {MAX_LOG_PAGE}"
        )));
    }
    Ok(limit)
}

/// One transactional session. Every write appends an envelope event with a
/// session index that is contiguous within the session.
pub struct UnitOfWork<'a> {
    conn: &'a Connection,
    source: EventSource,
    now: DateTime<Utc>,
    session_index: Cell<i64>,
}

pub(crate) trait EntityRecord: serde::Serialize + Sized {
    const KIND: EntityKind;
    fn envelope(&self) -> &Envelope;
    fn envelope_mut(&mut self) -> &mut Envelope;
    fn payload_columns() -> &'static [&'static str];
    fn payload_values(&self) -> EngineResult<Vec<SqlValue>>;
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
}

impl<'a> UnitOfWork<'a> {
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    fn next_session_index(&self) -> i64 {
        let index = self.session_index.get();
        self.session_index.set(index + 1);
        index
    }

    fn append_event(
        &self,
        kind: EntityKind,
        entity_ref_id: i64,
        event_kind: EntityEventKind,
        entity_version: i64,
        payload: &serde_json::Value,
    ) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO entity_events (
               entity_kind, entity_ref_id, session_index, kind, source, entity_version,
               payload_json, created_time
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                kind.as_str(),
                entity_ref_id,
                self.next_session_index(),
                event_kind.as_str(),
                self.source.as_str(),
                entity_version,
                serde_json::to_string(payload)?,
                self.now.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn events_for(&self, kind: EntityKind, ref_id: i64) -> EngineResult<Vec<EntityEvent>> {
        let mut statement = self.conn.prepare(
            "SELECT id, entity_kind, entity_ref_id, session_index, kind, source, entity_version,
                    payload_json, created_time
             FROM entity_events WHERE entity_kind = ?1 AND entity_ref_id = ?2 ORDER BY id ASC",
        )?;
        let rows = statement.query_map(params![kind.as_str(), ref_id], |row| {
            Ok(EntityEvent {
                id: row.get(0)?,
                entity_kind: token(row.get::<_, String>(1)?)?,
                entity_ref_id: row.get(2)?,
                session_index: row.get(3)?,
                kind: token(row.get::<_, String>(4)?)?,
                source: token(row.get::<_, String>(5)?)?,
                entity_version: row.get(6)?,
                payload: json_value(row.get::<_, String>(7)?),
                created_time: parse_time(&row.get::<_, String>(8)?)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub(crate) fn create<T: EntityRecord>(&self, mut entity: T) -> EngineResult<T> {
        {
            let envelope = entity.envelope_mut();
            envelope.version = 1;
            envelope.archived = false;
            envelope.archived_reason = None;
            envelope.created_time = self.now;
            envelope.last_modified_time = self.now;
            envelope.archived_time = None;
        }
        let columns = T::payload_columns();
        let placeholders: Vec<String> = (1..=columns.len() + 6).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {} (version, archived, archived_reason, created_time, last_modified_time, archived_time, {}) VALUES ({})",
            T::KIND.table(),
            columns.join(", "),
            placeholders.join(", "),
        );
        let mut values: Vec<SqlValue> = vec![
            SqlValue::Integer(1),
            SqlValue::Integer(0),
            SqlValue::Null,
            SqlValue::Text(self.now.to_rfc3339()),
            SqlValue::Text(self.now.to_rfc3339()),
            SqlValue::Null,
        ];
        values.extend(entity.payload_values()?);
        self.conn
            .execute(&sql, rusqlite::params_from_iter(values))?;
        entity.envelope_mut().ref_id = self.conn.last_insert_rowid();

        let payload = serde_json::to_value(&entity)?;
        self.append_event(
            T::KIND,
            entity.envelope().ref_id,
            EntityEventKind::Created,
            1,
            &payload,
        )?;
        Ok(entity)
    }

    pub(crate) fn save<T: EntityRecord>(&self, entity: &mut T) -> EngineResult<()> {
        self.save_with_event(entity, EntityEventKind::Updated)
    }

    pub(crate) fn archive_entity<T: EntityRecord>(
        &self,
        entity: &mut T,
        reason: ArchivedReason,
    ) -> EngineResult<()> {
        {
            let envelope = entity.envelope_mut();
            envelope.archived = true;
            envelope.archived_reason = Some(reason);
            envelope.archived_time = Some(self.now);
        }
        self.save_with_event(entity, EntityEventKind::Archived)
    }

    fn save_with_event<T: EntityRecord>(
        &self,
        entity: &mut T,
        event_kind: EntityEventKind,
    ) -> EngineResult<()> {
        let old_version = entity.envelope().version;
        let new_version = old_version + 1;
        {
            let envelope = entity.envelope_mut();
            envelope.version = new_version;
            envelope.last_modified_time = self.now;
        }

        let columns = T::payload_columns();
        let mut assignments = vec![
            "version = ?1".to_string(),
            "archived = ?2".to_string(),
            "archived_reason = ?3".to_string(),
            "last_modified_time = ?4".to_string(),
            "archived_time = ?5".to_string(),
        ];
        for (offset, column) in columns.iter().enumerate() {
            assignments.push(format!("{column} = ?{}", offset + 6));
        }
        let ref_param = columns.len() + 6;
        let version_param = columns.len() + 7;
        let sql = format!(
            "UPDATE {} SET {} WHERE ref_id = ?{ref_param} AND version = ?{version_param}",
            T::KIND.table(),
            assignments.join(", "),
        );

        let envelope = entity.envelope();
        let mut values: Vec<SqlValue> = vec![
            SqlValue::Integer(new_version),
            SqlValue::Integer(i64::from(envelope.archived)),
            opt_text(envelope.archived_reason.map(|r| r.as_str().to_string())),
            SqlValue::Text(envelope.last_modified_time.to_rfc3339()),
            opt_text(envelope.archived_time.map(|t| t.to_rfc3339())),
        ];
        values.extend(entity.payload_values()?);
        values.push(SqlValue::Integer(envelope.ref_id));
        values.push(SqlValue::Integer(old_version));

        let changed = self
            .conn
            .execute(&sql, rusqlite::params_from_iter(values))?;
        if changed == 0 {
            entity.envelope_mut().version = old_version;
            let stored: Option<i64> = self
                .conn
                .query_row(
                    &format!("SELECT version FROM {} WHERE ref_id = ?1", T::KIND.table()),
                    [entity.envelope().ref_id],
                    |row| row.get(0),
                )
                .optional()?;
            return match stored {
                Some(version) => Err(EngineError::Conflict(format!(
                    "{} {} is at version {version}, tried to save from {old_version}",
                    T::KIND.as_str(),
                    entity.envelope().ref_id
                ))),
                None => Err(EngineError::NotFound(format!(
                    "{} {} does not exist",
                    T::KIND.as_str(),
                    entity.envelope().ref_id
                ))),
            };
        }

        let payload = serde_json::to_value(&*entity)?;
        self.append_event(
            T::KIND,
            entity.envelope().ref_id,
            event_kind,
            new_version,
            &payload,
        )?;
        Ok(())
    }

    pub(crate) fn load<T: EntityRecord>(
        &self,
        ref_id: i64,
        allow_archived: bool,
    ) -> EngineResult<T> {
        self.try_load::<T>(ref_id, allow_archived)?.ok_or_else(|| {
            EngineError::NotFound(format!("{} {ref_id} does not exist", T::KIND.as_str()))
        })
    }

    pub(crate) fn try_load<T: EntityRecord>(
        &self,
        ref_id: i64,
        allow_archived: bool,
    ) -> EngineResult<Option<T>> {
        let sql = format!("{} WHERE ref_id = ?1", select_sql::<T>());
        let entity: Option<T> = self
            .conn
            .query_row(&sql, [ref_id], |row| T::from_row(row))
            .optional()?;
        match entity {
            Some(entity) if entity.envelope().archived && !allow_archived => {
                Err(EngineError::NotFound(format!(
                    "{} {ref_id} is archived",
                    T::KIND.as_str()
                )))
            }
            other => Ok(other),
        }
    }

    pub(crate) fn find_where<T: EntityRecord>(
        &self,
        clause: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> EngineResult<Vec<T>> {
        let sql = format!("{} WHERE {clause} ORDER BY ref_id ASC", select_sql::<T>());
        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map(rusqlite::params_from_iter(params.iter()), |row| {
            T::from_row(row)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub(crate) fn find_all<T: EntityRecord>(&self, allow_archived: bool) -> EngineResult<Vec<T>> {
        if allow_archived {
            self.find_where("1 = 1", &[])
        } else {
            self.find_where("archived = 0", &[])
        }
    }

    // Untyped envelope operations used by the recursive archiver/remover.

    pub(crate) fn archive_row(
        &self,
        kind: EntityKind,
        ref_id: i64,
        reason: ArchivedReason,
    ) -> EngineResult<bool> {
        let now = self.now.to_rfc3339();
        let changed = self.conn.execute(
            &format!(
                "UPDATE {} SET archived = 1, archived_reason = ?1, archived_time = ?2,
                        last_modified_time = ?2, version = version + 1
                 WHERE ref_id = ?3 AND archived = 0",
                kind.table()
            ),
            params![reason.as_str(), now, ref_id],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        let version: i64 = self.conn.query_row(
            &format!("SELECT version FROM {} WHERE ref_id = ?1", kind.table()),
            [ref_id],
            |row| row.get(0),
        )?;
        self.append_event(
            kind,
            ref_id,
            EntityEventKind::Archived,
            version,
            &serde_json::json!({ "archivedReason": reason.as_str() }),
        )?;
        Ok(true)
    }

    pub(crate) fn remove_row(&self, kind: EntityKind, ref_id: i64) -> EngineResult<bool> {
        let changed = self.conn.execute(
            &format!("DELETE FROM {} WHERE ref_id = ?1", kind.table()),
            [ref_id],
        )?;
        self.conn.execute(
            "DELETE FROM entity_events WHERE entity_kind = ?1 AND entity_ref_id = ?2",
            params![kind.as_str(), ref_id],
        )?;
        Ok(changed > 0)
    }

    pub(crate) fn child_ref_ids(
        &self,
        kind: EntityKind,
        filter: &str,
        parent_ref_id: i64,
        include_archived: bool,
    ) -> EngineResult<Vec<i64>> {
        let archived_clause = if include_archived {
            ""
        } else {
            " AND archived = 0"
        };
        let sql = format!(
            "SELECT ref_id FROM {} WHERE {filter}{archived_clause} ORDER BY ref_id ASC",
            kind.table()
        );
        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map([parent_ref_id], |row| row.get::<_, i64>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub(crate) fn entity_name(&self, kind: EntityKind, ref_id: i64) -> EngineResult<Option<String>> {
        let column = match kind {
            EntityKind::Workspace
            | EntityKind::Project
            | EntityKind::Habit
            | EntityKind::Chore
            | EntityKind::Metric
            | EntityKind::Person
            | EntityKind::BigPlan
            | EntityKind::InboxTask => "name",
            EntityKind::BigPlanMilestone => "description",
            EntityKind::Journal | EntityKind::TimePlan => "timeline",
            EntityKind::WorkingMemPrefs
            | EntityKind::JournalSettings
            | EntityKind::TimePlanSettings => return Ok(None),
        };
        let name: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT {column} FROM {} WHERE ref_id = ?1", kind.table()),
                [ref_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(name)
    }

    // Typed finders.

    pub fn find_workspace(&self) -> EngineResult<Workspace> {
        let mut all: Vec<Workspace> = self.find_where("archived = 0", &[])?;
        all.pop()
            .ok_or_else(|| EngineError::NotFound("no workspace exists".to_string()))
    }

    pub fn find_generated_inbox_tasks(
        &self,
        source: InboxTaskSource,
        source_ref_id: i64,
    ) -> EngineResult<Vec<InboxTask>> {
        self.find_where(
            "archived = 0 AND source = ?1 AND source_ref_id = ?2 AND recurring_timeline IS NOT NULL",
            &[&source.as_str(), &source_ref_id],
        )
    }

    pub fn find_inbox_tasks_by_source(
        &self,
        source: InboxTaskSource,
    ) -> EngineResult<Vec<InboxTask>> {
        self.find_where("archived = 0 AND source = ?1", &[&source.as_str()])
    }

    pub fn find_inbox_tasks_for_big_plan(
        &self,
        big_plan_ref_id: i64,
    ) -> EngineResult<Vec<InboxTask>> {
        self.find_where(
            "archived = 0 AND source = ?1 AND source_ref_id = ?2",
            &[&InboxTaskSource::BigPlan.as_str(), &big_plan_ref_id],
        )
    }

    pub fn find_inbox_tasks_completed_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> EngineResult<Vec<InboxTask>> {
        let start_str = start
            .and_hms_opt(0, 0, 0)
            .unwrap_or_default()
            .and_utc()
            .to_rfc3339();
        let end_str = (end + chrono::Days::new(1))
            .and_hms_opt(0, 0, 0)
            .unwrap_or_default()
            .and_utc()
            .to_rfc3339();
        self.find_where(
            "archived = 0 AND completed_time IS NOT NULL AND completed_time >= ?1 AND completed_time < ?2",
            &[&start_str, &end_str],
        )
    }

    pub fn find_journal(
        &self,
        period: RecurringTaskPeriod,
        timeline: &str,
    ) -> EngineResult<Option<Journal>> {
        let mut found: Vec<Journal> = self.find_where(
            "archived = 0 AND period = ?1 AND timeline = ?2",
            &[&period.as_str(), &timeline],
        )?;
        Ok(found.pop())
    }

    pub fn find_time_plan(
        &self,
        period: RecurringTaskPeriod,
        timeline: &str,
    ) -> EngineResult<Option<TimePlan>> {
        let mut found: Vec<TimePlan> = self.find_where(
            "archived = 0 AND period = ?1 AND timeline = ?2",
            &[&period.as_str(), &timeline],
        )?;
        Ok(found.pop())
    }

    // Rollup tables.

    pub fn upsert_streak_mark(&self, mark: &HabitStreakMark) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO habit_streak_marks (habit_ref_id, year, date, statuses_json)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (habit_ref_id, date) DO UPDATE
             SET year = excluded.year, statuses_json = excluded.statuses_json",
            params![
                mark.habit_ref_id,
                mark.year,
                date_str(mark.date),
                serde_json::to_string(&mark.statuses)?,
            ],
        )?;
        Ok(())
    }

    pub fn find_streak_marks(
        &self,
        habit_ref_id: i64,
        year: i32,
    ) -> EngineResult<Vec<HabitStreakMark>> {
        let mut statement = self.conn.prepare(
            "SELECT habit_ref_id, year, date, statuses_json FROM habit_streak_marks
             WHERE habit_ref_id = ?1 AND year = ?2 ORDER BY date ASC",
        )?;
        let rows = statement.query_map(params![habit_ref_id, year], |row| {
            Ok(HabitStreakMark {
                habit_ref_id: row.get(0)?,
                year: row.get(1)?,
                date: parse_date(&row.get::<_, String>(2)?)?,
                statuses: json_from_str(&row.get::<_, String>(3)?)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn upsert_big_plan_stats(&self, stats: &BigPlanStats) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO big_plan_stats (big_plan_ref_id, all_inbox_tasks_cnt, completed_inbox_tasks_cnt)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (big_plan_ref_id) DO UPDATE
             SET all_inbox_tasks_cnt = excluded.all_inbox_tasks_cnt,
                 completed_inbox_tasks_cnt = excluded.completed_inbox_tasks_cnt",
            params![
                stats.big_plan_ref_id,
                stats.all_inbox_tasks_cnt,
                stats.completed_inbox_tasks_cnt,
            ],
        )?;
        Ok(())
    }

    pub fn find_big_plan_stats(&self, big_plan_ref_id: i64) -> EngineResult<Option<BigPlanStats>> {
        self.conn
            .query_row(
                "SELECT big_plan_ref_id, all_inbox_tasks_cnt, completed_inbox_tasks_cnt
                 FROM big_plan_stats WHERE big_plan_ref_id = ?1",
                [big_plan_ref_id],
                |row| {
                    Ok(BigPlanStats {
                        big_plan_ref_id: row.get(0)?,
                        all_inbox_tasks_cnt: row.get(1)?,
                        completed_inbox_tasks_cnt: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(EngineError::from)
    }

    pub fn upsert_journal_stats(&self, stats: &JournalStats) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO journal_stats (journal_ref_id, report_json) VALUES (?1, ?2)
             ON CONFLICT (journal_ref_id) DO UPDATE SET report_json = excluded.report_json",
            params![stats.journal_ref_id, serde_json::to_string(&stats.report)?],
        )?;
        Ok(())
    }

    pub fn find_journal_stats(&self, journal_ref_id: i64) -> EngineResult<Option<JournalStats>> {
        self.conn
            .query_row(
                "SELECT journal_ref_id, report_json FROM journal_stats WHERE journal_ref_id = ?1",
                [journal_ref_id],
                |row| {
                    Ok(JournalStats {
                        journal_ref_id: row.get(0)?,
                        report: json_value(row.get::<_, String>(1)?),
                    })
                },
            )
            .optional()
            .map_err(EngineError::from)
    }

    /// Appends a score entry. Returns false when the entity was already
    /// scored (the log is append-only and one-per-entity).
    pub fn insert_score_log(&self, entry: &ScoreLogEntry) -> EngineResult<bool> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO score_log (
               created_time, source, source_entity_ref_id, difficulty, score_delta,
               had_lucky_puppy_bonus, timeline_daily, timeline_weekly, timeline_monthly,
               timeline_quarterly, timeline_yearly
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                entry.created_time.to_rfc3339(),
                entry.source.as_str(),
                entry.source_entity_ref_id,
                entry.difficulty.map(|d| d.as_str()),
                entry.score_delta,
                entry.had_lucky_puppy_bonus,
                entry.timeline_daily,
                entry.timeline_weekly,
                entry.timeline_monthly,
                entry.timeline_quarterly,
                entry.timeline_yearly,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn sum_score(&self, sub_period: RecurringTaskPeriod, timeline: &str) -> EngineResult<i64> {
        let column = score_timeline_column(sub_period);
        let total: i64 = self.conn.query_row(
            &format!("SELECT COALESCE(SUM(score_delta), 0) FROM score_log WHERE {column} = ?1"),
            [timeline],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// Stores `total` as the new best when it beats the recorded one.
    pub fn raise_period_best(
        &self,
        period: Option<RecurringTaskPeriod>,
        timeline: &str,
        sub_period: RecurringTaskPeriod,
        total: i64,
    ) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO score_period_bests (period, timeline, sub_period, total_score)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (period, timeline, sub_period) DO UPDATE
             SET total_score = excluded.total_score
             WHERE excluded.total_score > score_period_bests.total_score",
            params![
                period.map(|p| p.as_str()).unwrap_or("lifetime"),
                timeline,
                sub_period.as_str(),
                total,
            ],
        )?;
        Ok(())
    }

    pub fn find_period_best(
        &self,
        period: Option<RecurringTaskPeriod>,
        timeline: &str,
        sub_period: RecurringTaskPeriod,
    ) -> EngineResult<Option<ScorePeriodBest>> {
        self.conn
            .query_row(
                "SELECT period, timeline, sub_period, total_score FROM score_period_bests
                 WHERE period = ?1 AND timeline = ?2 AND sub_period = ?3",
                params![
                    period.map(|p| p.as_str()).unwrap_or("lifetime"),
                    timeline,
                    sub_period.as_str(),
                ],
                |row| {
                    let period_raw: String = row.get(0)?;
                    Ok(ScorePeriodBest {
                        period: if period_raw == "lifetime" {
                            None
                        } else {
                            Some(token(period_raw)?)
                        },
                        timeline: row.get(1)?,
                        sub_period: token(row.get::<_, String>(2)?)?,
                        total_score: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(EngineError::from)
    }

    // Run logs.

    pub fn insert_gen_log(
        &self,
        today: NaiveDate,
        gen_even_if_not_modified: bool,
        targets: &[GenTarget],
        period_filter: Option<&[RecurringTaskPeriod]>,
        filter_ref_ids: &serde_json::Value,
        per_target_counts: &serde_json::Value,
    ) -> EngineResult<GenLogEntry> {
        self.conn.execute(
            "INSERT INTO gen_log (
               created_time, source, today, gen_even_if_not_modified, targets_json,
               period_filter_json, filter_ref_ids_json, per_target_counts_json
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                self.now.to_rfc3339(),
                self.source.as_str(),
                date_str(today),
                gen_even_if_not_modified,
                serde_json::to_string(targets)?,
                period_filter
                    .map(|periods| serde_json::to_string(periods))
                    .transpose()?,
                serde_json::to_string(filter_ref_ids)?,
                serde_json::to_string(per_target_counts)?,
            ],
        )?;
        Ok(GenLogEntry {
            id: self.conn.last_insert_rowid(),
            created_time: self.now,
            source: self.source,
            today,
            gen_even_if_not_modified,
            targets: targets.to_vec(),
            period_filter: period_filter.map(<[RecurringTaskPeriod]>::to_vec),
            filter_ref_ids: filter_ref_ids.clone(),
            per_target_counts: per_target_counts.clone(),
        })
    }

    pub fn insert_gc_log(
        &self,
        today: NaiveDate,
        targets: &[GenTarget],
        filter_ref_ids: &serde_json::Value,
        per_target_counts: &serde_json::Value,
    ) -> EngineResult<GcLogEntry> {
        self.conn.execute(
            "INSERT INTO gc_log (
               created_time, source, today, targets_json, filter_ref_ids_json,
               per_target_counts_json
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                self.now.to_rfc3339(),
                self.source.as_str(),
                date_str(today),
                serde_json::to_string(targets)?,
                serde_json::to_string(filter_ref_ids)?,
                serde_json::to_string(per_target_counts)?,
            ],
        )?;
        Ok(GcLogEntry {
            id: self.conn.last_insert_rowid(),
            created_time: self.now,
            source: self.source,
            today,
            targets: targets.to_vec(),
            filter_ref_ids: filter_ref_ids.clone(),
            per_target_counts: per_target_counts.clone(),
        })
    }

    pub fn insert_sync_log(
        &self,
        stream_ref_id: i64,
        sync_start: Option<NaiveDate>,
        sync_end: Option<NaiveDate>,
        entities_upserted: i64,
        even_more_entity_records: bool,
        errors: &[String],
    ) -> EngineResult<ScheduleExternalSyncLogEntry> {
        self.conn.execute(
            "INSERT INTO schedule_sync_log (
               created_time, stream_ref_id, sync_start, sync_end, entities_upserted,
               even_more_entity_records, errors_json
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                self.now.to_rfc3339(),
                stream_ref_id,
                sync_start.map(date_str),
                sync_end.map(date_str),
                entities_upserted,
                even_more_entity_records,
                serde_json::to_string(errors)?,
            ],
        )?;
        Ok(ScheduleExternalSyncLogEntry {
            id: self.conn.last_insert_rowid(),
            created_time: self.now,
            stream_ref_id,
            sync_start,
            sync_end,
            entities_upserted,
            even_more_entity_records,
            errors: errors.to_vec(),
        })
    }

    /// Upserts an external schedule event by `(stream, external_uid)`.
    /// Returns true when the row was created or its content changed.
    pub fn upsert_schedule_event(
        &self,
        stream_ref_id: i64,
        external_uid: &str,
        name: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let existing: Option<(String, String, String)> = self
            .conn
            .query_row(
                "SELECT name, start_time, end_time FROM schedule_external_events
                 WHERE stream_ref_id = ?1 AND external_uid = ?2",
                params![stream_ref_id, external_uid],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        if let Some((old_name, old_start, old_end)) = existing {
            if old_name == name
                && old_start == start_time.to_rfc3339()
                && old_end == end_time.to_rfc3339()
            {
                return Ok(false);
            }
        }
        self.conn.execute(
            "INSERT INTO schedule_external_events (
               stream_ref_id, external_uid, name, start_time, end_time, last_synced_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (stream_ref_id, external_uid) DO UPDATE
             SET name = excluded.name, start_time = excluded.start_time,
                 end_time = excluded.end_time, last_synced_at = excluded.last_synced_at",
            params![
                stream_ref_id,
                external_uid,
                name,
                start_time.to_rfc3339(),
                end_time.to_rfc3339(),
                self.now.to_rfc3339(),
            ],
        )?;
        Ok(true)
    }

    pub fn find_schedule_events(
        &self,
        stream_ref_id: i64,
    ) -> EngineResult<Vec<ScheduleExternalEvent>> {
        let mut statement = self.conn.prepare(
            "SELECT id, stream_ref_id, external_uid, name, start_time, end_time, last_synced_at
             FROM schedule_external_events WHERE stream_ref_id = ?1 ORDER BY external_uid ASC",
        )?;
        let rows = statement.query_map([stream_ref_id], |row| {
            Ok(ScheduleExternalEvent {
                id: row.get(0)?,
                stream_ref_id: row.get(1)?,
                external_uid: row.get(2)?,
                name: row.get(3)?,
                start_time: parse_time(&row.get::<_, String>(4)?)?,
                end_time: parse_time(&row.get::<_, String>(5)?)?,
                last_synced_at: parse_time(&row.get::<_, String>(6)?)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Walks project parents from `candidate_parent_ref_id` up and refuses
    /// re-parenting that would revisit `project_ref_id`.
    pub fn check_project_parent(
        &self,
        project_ref_id: i64,
        candidate_parent_ref_id: i64,
    ) -> EngineResult<()> {
        let mut cursor = Some(candidate_parent_ref_id);
        let mut hops = 0;
        while let Some(current) = cursor {
            if current == project_ref_id {
                return Err(EngineError::Invariant(format!(
                    "project {project_ref_id} cannot become a child of {candidate_parent_ref_id}: the parent chain loops back"
                )));
            }
            hops += 1;
            if hops > 1_000 {
                return Err(EngineError::Invariant(
                    "project parent chain exceeds 1000 links".to_string(),
                ));
            }
            let parent: Option<Project> = self.try_load(current, true)?;
            cursor = parent.and_then(|p| p.parent_project_ref_id);
        }
        Ok(())
    }
}

fn select_sql<T: EntityRecord>() -> String {
    format!(
        "SELECT {ENVELOPE_COLUMNS}, {} FROM {}",
        T::payload_columns().join(", "),
        T::KIND.table()
    )
}

fn score_timeline_column(period: RecurringTaskPeriod) -> &'static str {
    match period {
        RecurringTaskPeriod::Daily => "timeline_daily",
        RecurringTaskPeriod::Weekly => "timeline_weekly",
        RecurringTaskPeriod::Monthly => "timeline_monthly",
        RecurringTaskPeriod::Quarterly => "timeline_quarterly",
        RecurringTaskPeriod::Yearly => "timeline_yearly",
    }
}

// Row/column conversion helpers.

fn conversion_err(err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
}

fn token<T: serde::de::DeserializeOwned>(raw: String) -> rusqlite::Result<T> {
    serde_json::from_value(serde_json::Value::String(raw)).map_err(conversion_err)
}

fn opt_token<T: serde::de::DeserializeOwned>(raw: Option<String>) -> rusqlite::Result<Option<T>> {
    raw.map(token).transpose()
}

fn json_from_str<T: serde::de::DeserializeOwned>(raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(conversion_err)
}

fn opt_json_from_str<T: serde::de::DeserializeOwned>(
    raw: Option<String>,
) -> rusqlite::Result<Option<T>> {
    raw.map(|value| json_from_str(&value)).transpose()
}

fn json_value(raw: String) -> serde_json::Value {
    serde_json::from_str(&raw).unwrap_or(serde_json::json!({}))
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|time| time.with_timezone(&Utc))
        .map_err(conversion_err)
}

fn opt_time(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|value| parse_time(&value)).transpose()
}

fn parse_date(raw: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(conversion_err)
}

fn opt_date(raw: Option<String>) -> rusqlite::Result<Option<NaiveDate>> {
    raw.map(|value| parse_date(&value)).transpose()
}

fn date_str(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn opt_text(value: Option<String>) -> SqlValue {
    match value {
        Some(value) => SqlValue::Text(value),
        None => SqlValue::Null,
    }
}

fn opt_int(value: Option<i64>) -> SqlValue {
    match value {
        Some(value) => SqlValue::Integer(value),
        None => SqlValue::Null,
    }
}

fn read_envelope(row: &Row<'_>) -> rusqlite::Result<Envelope> {
    Ok(Envelope {
        ref_id: row.get("ref_id")?,
        version: row.get("version")?,
        archived: row.get("archived")?,
        archived_reason: opt_token(row.get::<_, Option<String>>("archived_reason")?)?,
        created_time: parse_time(&row.get::<_, String>("created_time")?)?,
        last_modified_time: parse_time(&row.get::<_, String>("last_modified_time")?)?,
        archived_time: opt_time(row.get::<_, Option<String>>("archived_time")?)?,
    })
}

fn parse_gen_log_row(row: &Row<'_>) -> rusqlite::Result<GenLogEntry> {
    Ok(GenLogEntry {
        id: row.get(0)?,
        created_time: parse_time(&row.get::<_, String>(1)?)?,
        source: token(row.get::<_, String>(2)?)?,
        today: parse_date(&row.get::<_, String>(3)?)?,
        gen_even_if_not_modified: row.get(4)?,
        targets: json_from_str(&row.get::<_, String>(5)?)?,
        period_filter: opt_json_from_str(row.get::<_, Option<String>>(6)?)?,
        filter_ref_ids: json_value(row.get::<_, String>(7)?),
        per_target_counts: json_value(row.get::<_, String>(8)?),
    })
}

fn parse_gc_log_row(row: &Row<'_>) -> rusqlite::Result<GcLogEntry> {
    Ok(GcLogEntry {
        id: row.get(0)?,
        created_time: parse_time(&row.get::<_, String>(1)?)?,
        source: token(row.get::<_, String>(2)?)?,
        today: parse_date(&row.get::<_, String>(3)?)?,
        targets: json_from_str(&row.get::<_, String>(4)?)?,
        filter_ref_ids: json_value(row.get::<_, String>(5)?),
        per_target_counts: json_value(row.get::<_, String>(6)?),
    })
}

fn parse_sync_log_row(row: &Row<'_>) -> rusqlite::Result<ScheduleExternalSyncLogEntry> {
    Ok(ScheduleExternalSyncLogEntry {
        id: row.get(0)?,
        created_time: parse_time(&row.get::<_, String>(1)?)?,
        stream_ref_id: row.get(2)?,
        sync_start: opt_date(row.get::<_, Option<String>>(3)?)?,
        sync_end: opt_date(row.get::<_, Option<String>>(4)?)?,
        entities_upserted: row.get(5)?,
        even_more_entity_records: row.get(6)?,
        errors: json_from_str(&row.get::<_, String>(7)?)?,
    })
}

// Entity mappings.

impl EntityRecord for Workspace {
    const KIND: EntityKind = EntityKind::Workspace;

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }

    fn payload_columns() -> &'static [&'static str] {
        &["name", "backup_project_ref_id"]
    }

    fn payload_values(&self) -> EngineResult<Vec<SqlValue>> {
        Ok(vec![
            SqlValue::Text(self.name.clone()),
            opt_int(self.backup_project_ref_id),
        ])
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            envelope: read_envelope(row)?,
            name: row.get("name")?,
            backup_project_ref_id: row.get("backup_project_ref_id")?,
        })
    }
}

impl EntityRecord for Project {
    const KIND: EntityKind = EntityKind::Project;

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }

    fn payload_columns() -> &'static [&'static str] {
        &["name", "parent_project_ref_id"]
    }

    fn payload_values(&self) -> EngineResult<Vec<SqlValue>> {
        Ok(vec![
            SqlValue::Text(self.name.clone()),
            opt_int(self.parent_project_ref_id),
        ])
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            envelope: read_envelope(row)?,
            name: row.get("name")?,
            parent_project_ref_id: row.get("parent_project_ref_id")?,
        })
    }
}

impl EntityRecord for Habit {
    const KIND: EntityKind = EntityKind::Habit;

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }

    fn payload_columns() -> &'static [&'static str] {
        &[
            "name",
            "project_ref_id",
            "gen_params_json",
            "repeats_in_period_count",
            "repeats_strategy",
            "suspended",
        ]
    }

    fn payload_values(&self) -> EngineResult<Vec<SqlValue>> {
        Ok(vec![
            SqlValue::Text(self.name.clone()),
            SqlValue::Integer(self.project_ref_id),
            SqlValue::Text(serde_json::to_string(&self.gen_params)?),
            opt_int(self.repeats_in_period_count.map(i64::from)),
            opt_text(self.repeats_strategy.map(|s| s.as_str().to_string())),
            SqlValue::Integer(i64::from(self.suspended)),
        ])
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            envelope: read_envelope(row)?,
            name: row.get("name")?,
            project_ref_id: row.get("project_ref_id")?,
            gen_params: json_from_str(&row.get::<_, String>("gen_params_json")?)?,
            repeats_in_period_count: row.get("repeats_in_period_count")?,
            repeats_strategy: opt_token(row.get::<_, Option<String>>("repeats_strategy")?)?,
            suspended: row.get("suspended")?,
        })
    }
}

impl EntityRecord for Chore {
    const KIND: EntityKind = EntityKind::Chore;

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }

    fn payload_columns() -> &'static [&'static str] {
        &[
            "name",
            "project_ref_id",
            "gen_params_json",
            "start_at_date",
            "end_at_date",
            "must_do",
            "suspended",
        ]
    }

    fn payload_values(&self) -> EngineResult<Vec<SqlValue>> {
        Ok(vec![
            SqlValue::Text(self.name.clone()),
            SqlValue::Integer(self.project_ref_id),
            SqlValue::Text(serde_json::to_string(&self.gen_params)?),
            opt_text(self.start_at_date.map(date_str)),
            opt_text(self.end_at_date.map(date_str)),
            SqlValue::Integer(i64::from(self.must_do)),
            SqlValue::Integer(i64::from(self.suspended)),
        ])
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            envelope: read_envelope(row)?,
            name: row.get("name")?,
            project_ref_id: row.get("project_ref_id")?,
            gen_params: json_from_str(&row.get::<_, String>("gen_params_json")?)?,
            start_at_date: opt_date(row.get::<_, Option<String>>("start_at_date")?)?,
            end_at_date: opt_date(row.get::<_, Option<String>>("end_at_date")?)?,
            must_do: row.get("must_do")?,
            suspended: row.get("suspended")?,
        })
    }
}

impl EntityRecord for Metric {
    const KIND: EntityKind = EntityKind::Metric;

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }

    fn payload_columns() -> &'static [&'static str] {
        &["name", "unit", "collection_project_ref_id", "collection_params_json"]
    }

    fn payload_values(&self) -> EngineResult<Vec<SqlValue>> {
        let params_json = self
            .collection_params
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        Ok(vec![
            SqlValue::Text(self.name.clone()),
            opt_text(self.unit.clone()),
            opt_int(self.collection_project_ref_id),
            opt_text(params_json),
        ])
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            envelope: read_envelope(row)?,
            name: row.get("name")?,
            unit: row.get("unit")?,
            collection_project_ref_id: row.get("collection_project_ref_id")?,
            collection_params: opt_json_from_str(
                row.get::<_, Option<String>>("collection_params_json")?,
            )?,
        })
    }
}

impl EntityRecord for Person {
    const KIND: EntityKind = EntityKind::Person;

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }

    fn payload_columns() -> &'static [&'static str] {
        &[
            "name",
            "relationship",
            "catch_up_project_ref_id",
            "catch_up_params_json",
            "birthday_day",
            "birthday_month",
        ]
    }

    fn payload_values(&self) -> EngineResult<Vec<SqlValue>> {
        let params_json = self
            .catch_up_params
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        Ok(vec![
            SqlValue::Text(self.name.clone()),
            SqlValue::Text(self.relationship.as_str().to_string()),
            opt_int(self.catch_up_project_ref_id),
            opt_text(params_json),
            opt_int(self.birthday.map(|b| i64::from(b.day))),
            opt_int(self.birthday.map(|b| i64::from(b.month))),
        ])
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let birthday_day: Option<u32> = row.get("birthday_day")?;
        let birthday_month: Option<u32> = row.get("birthday_month")?;
        Ok(Self {
            envelope: read_envelope(row)?,
            name: row.get("name")?,
            relationship: token(row.get::<_, String>("relationship")?)?,
            catch_up_project_ref_id: row.get("catch_up_project_ref_id")?,
            catch_up_params: opt_json_from_str(
                row.get::<_, Option<String>>("catch_up_params_json")?,
            )?,
            birthday: match (birthday_day, birthday_month) {
                (Some(day), Some(month)) => Some(PersonBirthday { day, month }),
                _ => None,
            },
        })
    }
}

impl EntityRecord for BigPlan {
    const KIND: EntityKind = EntityKind::BigPlan;

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }

    fn payload_columns() -> &'static [&'static str] {
        &[
            "name",
            "project_ref_id",
            "status",
            "eisen",
            "difficulty",
            "actionable_date",
            "due_date",
        ]
    }

    fn payload_values(&self) -> EngineResult<Vec<SqlValue>> {
        Ok(vec![
            SqlValue::Text(self.name.clone()),
            SqlValue::Integer(self.project_ref_id),
            SqlValue::Text(self.status.as_str().to_string()),
            SqlValue::Text(self.eisen.as_str().to_string()),
            SqlValue::Text(self.difficulty.as_str().to_string()),
            opt_text(self.actionable_date.map(date_str)),
            opt_text(self.due_date.map(date_str)),
        ])
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            envelope: read_envelope(row)?,
            name: row.get("name")?,
            project_ref_id: row.get("project_ref_id")?,
            status: token(row.get::<_, String>("status")?)?,
            eisen: token(row.get::<_, String>("eisen")?)?,
            difficulty: token(row.get::<_, String>("difficulty")?)?,
            actionable_date: opt_date(row.get::<_, Option<String>>("actionable_date")?)?,
            due_date: opt_date(row.get::<_, Option<String>>("due_date")?)?,
        })
    }
}

impl EntityRecord for BigPlanMilestone {
    const KIND: EntityKind = EntityKind::BigPlanMilestone;

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }

    fn payload_columns() -> &'static [&'static str] {
        &["big_plan_ref_id", "date", "description"]
    }

    fn payload_values(&self) -> EngineResult<Vec<SqlValue>> {
        Ok(vec![
            SqlValue::Integer(self.big_plan_ref_id),
            SqlValue::Text(date_str(self.date)),
            SqlValue::Text(self.description.clone()),
        ])
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            envelope: read_envelope(row)?,
            big_plan_ref_id: row.get("big_plan_ref_id")?,
            date: parse_date(&row.get::<_, String>("date")?)?,
            description: row.get("description")?,
        })
    }
}

impl EntityRecord for InboxTask {
    const KIND: EntityKind = EntityKind::InboxTask;

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }

    fn payload_columns() -> &'static [&'static str] {
        &[
            "name",
            "status",
            "project_ref_id",
            "source",
            "source_ref_id",
            "eisen",
            "difficulty",
            "actionable_date",
            "due_date",
            "completed_time",
            "recurring_timeline",
            "recurring_repeat_index",
        ]
    }

    fn payload_values(&self) -> EngineResult<Vec<SqlValue>> {
        Ok(vec![
            SqlValue::Text(self.name.clone()),
            SqlValue::Text(self.status.as_str().to_string()),
            SqlValue::Integer(self.project_ref_id),
            SqlValue::Text(self.source.as_str().to_string()),
            opt_int(self.source_ref_id),
            opt_text(self.eisen.map(|e| e.as_str().to_string())),
            opt_text(self.difficulty.map(|d| d.as_str().to_string())),
            opt_text(self.actionable_date.map(date_str)),
            opt_text(self.due_date.map(date_str)),
            opt_text(self.completed_time.map(|t| t.to_rfc3339())),
            opt_text(self.recurring_timeline.clone()),
            opt_int(self.recurring_repeat_index),
        ])
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            envelope: read_envelope(row)?,
            name: row.get("name")?,
            status: token(row.get::<_, String>("status")?)?,
            project_ref_id: row.get("project_ref_id")?,
            source: token(row.get::<_, String>("source")?)?,
            source_ref_id: row.get("source_ref_id")?,
            eisen: opt_token(row.get::<_, Option<String>>("eisen")?)?,
            difficulty: opt_token(row.get::<_, Option<String>>("difficulty")?)?,
            actionable_date: opt_date(row.get::<_, Option<String>>("actionable_date")?)?,
            due_date: opt_date(row.get::<_, Option<String>>("due_date")?)?,
            completed_time: opt_time(row.get::<_, Option<String>>("completed_time")?)?,
            recurring_timeline: row.get("recurring_timeline")?,
            recurring_repeat_index: row.get("recurring_repeat_index")?,
        })
    }
}

impl EntityRecord for Journal {
    const KIND: EntityKind = EntityKind::Journal;

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }

    fn payload_columns() -> &'static [&'static str] {
        &["right_now", "period", "timeline", "sources_json"]
    }

    fn payload_values(&self) -> EngineResult<Vec<SqlValue>> {
        Ok(vec![
            SqlValue::Text(date_str(self.right_now)),
            SqlValue::Text(self.period.as_str().to_string()),
            SqlValue::Text(self.timeline.clone()),
            SqlValue::Text(serde_json::to_string(&self.sources)?),
        ])
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            envelope: read_envelope(row)?,
            right_now: parse_date(&row.get::<_, String>("right_now")?)?,
            period: token(row.get::<_, String>("period")?)?,
            timeline: row.get("timeline")?,
            sources: json_from_str(&row.get::<_, String>("sources_json")?)?,
        })
    }
}

impl EntityRecord for TimePlan {
    const KIND: EntityKind = EntityKind::TimePlan;

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }

    fn payload_columns() -> &'static [&'static str] {
        &["right_now", "period", "timeline", "start_date", "end_date", "source"]
    }

    fn payload_values(&self) -> EngineResult<Vec<SqlValue>> {
        Ok(vec![
            SqlValue::Text(date_str(self.right_now)),
            SqlValue::Text(self.period.as_str().to_string()),
            SqlValue::Text(self.timeline.clone()),
            SqlValue::Text(date_str(self.start_date)),
            SqlValue::Text(date_str(self.end_date)),
            SqlValue::Text(self.source.as_str().to_string()),
        ])
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            envelope: read_envelope(row)?,
            right_now: parse_date(&row.get::<_, String>("right_now")?)?,
            period: token(row.get::<_, String>("period")?)?,
            timeline: row.get("timeline")?,
            start_date: parse_date(&row.get::<_, String>("start_date")?)?,
            end_date: parse_date(&row.get::<_, String>("end_date")?)?,
            source: token(row.get::<_, String>("source")?)?,
        })
    }
}

impl EntityRecord for WorkingMemPrefs {
    const KIND: EntityKind = EntityKind::WorkingMemPrefs;

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }

    fn payload_columns() -> &'static [&'static str] {
        &["generation_period", "cleanup_project_ref_id"]
    }

    fn payload_values(&self) -> EngineResult<Vec<SqlValue>> {
        Ok(vec![
            SqlValue::Text(self.generation_period.as_str().to_string()),
            SqlValue::Integer(self.cleanup_project_ref_id),
        ])
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            envelope: read_envelope(row)?,
            generation_period: token(row.get::<_, String>("generation_period")?)?,
            cleanup_project_ref_id: row.get("cleanup_project_ref_id")?,
        })
    }
}

impl EntityRecord for JournalSettings {
    const KIND: EntityKind = EntityKind::JournalSettings;

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }

    fn payload_columns() -> &'static [&'static str] {
        &[
            "generation_approach",
            "periods_json",
            "sources_json",
            "writing_task_project_ref_id",
            "writing_task_eisen",
            "writing_task_difficulty",
            "days_until_gc",
        ]
    }

    fn payload_values(&self) -> EngineResult<Vec<SqlValue>> {
        Ok(vec![
            SqlValue::Text(self.generation_approach.as_str().to_string()),
            SqlValue::Text(serde_json::to_string(&self.periods)?),
            SqlValue::Text(serde_json::to_string(&self.sources)?),
            SqlValue::Integer(self.writing_task_project_ref_id),
            opt_text(self.writing_task_eisen.map(|e| e.as_str().to_string())),
            opt_text(self.writing_task_difficulty.map(|d| d.as_str().to_string())),
            SqlValue::Integer(self.days_until_gc),
        ])
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            envelope: read_envelope(row)?,
            generation_approach: token(row.get::<_, String>("generation_approach")?)?,
            periods: json_from_str(&row.get::<_, String>("periods_json")?)?,
            sources: json_from_str(&row.get::<_, String>("sources_json")?)?,
            writing_task_project_ref_id: row.get("writing_task_project_ref_id")?,
            writing_task_eisen: opt_token(row.get::<_, Option<String>>("writing_task_eisen")?)?,
            writing_task_difficulty: opt_token(
                row.get::<_, Option<String>>("writing_task_difficulty")?,
            )?,
            days_until_gc: row.get("days_until_gc")?,
        })
    }
}

impl EntityRecord for TimePlanSettings {
    const KIND: EntityKind = EntityKind::TimePlanSettings;

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }

    fn payload_columns() -> &'static [&'static str] {
        &[
            "generation_approach",
            "periods_json",
            "planning_task_project_ref_id",
            "planning_task_eisen",
            "planning_task_difficulty",
            "days_until_gc",
        ]
    }

    fn payload_values(&self) -> EngineResult<Vec<SqlValue>> {
        Ok(vec![
            SqlValue::Text(self.generation_approach.as_str().to_string()),
            SqlValue::Text(serde_json::to_string(&self.periods)?),
            SqlValue::Integer(self.planning_task_project_ref_id),
            opt_text(self.planning_task_eisen.map(|e| e.as_str().to_string())),
            opt_text(self.planning_task_difficulty.map(|d| d.as_str().to_string())),
            SqlValue::Integer(self.days_until_gc),
        ])
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            envelope: read_envelope(row)?,
            generation_approach: token(row.get::<_, String>("generation_approach")?)?,
            periods: json_from_str(&row.get::<_, String>("periods_json")?)?,
            planning_task_project_ref_id: row.get("planning_task_project_ref_id")?,
            planning_task_eisen: opt_token(row.get::<_, Option<String>>("planning_task_eisen")?)?,
            planning_task_difficulty: opt_token(
                row.get::<_, Option<String>>("planning_task_difficulty")?,
            )?,
            days_until_gc: row.get("days_until_gc")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Eisen, InboxTaskStatus, RecurringTaskGenParams};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn new_habit(name: &str) -> Habit {
        Habit {
            envelope: Envelope::new(now()),
            name: name.to_string(),
            project_ref_id: 1,
            gen_params: RecurringTaskGenParams::for_period(RecurringTaskPeriod::Daily),
            repeats_in_period_count: None,
            repeats_strategy: None,
            suspended: false,
        }
    }

    #[test]
    fn create_save_load_round_trip_with_version_bumps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("test.db")).expect("db");

        let habit = db
            .with_uow(EventSource::Cli, now(), |uow| uow.create(new_habit("Run")))
            .expect("create");
        assert_eq!(habit.envelope.version, 1);
        assert!(habit.envelope.ref_id > 0);

        db.with_uow(EventSource::Cli, now(), |uow| {
            let mut loaded: Habit = uow.load(habit.envelope.ref_id, false)?;
            loaded.name = "Run far".to_string();
            uow.save(&mut loaded)?;
            assert_eq!(loaded.envelope.version, 2);

            let reloaded: Habit = uow.load(habit.envelope.ref_id, false)?;
            assert_eq!(reloaded.name, "Run far");
            assert_eq!(reloaded.envelope.version, 2);
            Ok(())
        })
        .expect("save");
    }

    #[test]
    fn stale_version_save_is_a_conflict() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("test.db")).expect("db");

        let habit = db
            .with_uow(EventSource::Cli, now(), |uow| uow.create(new_habit("Row")))
            .expect("create");

        let err = db
            .with_uow(EventSource::Cli, now(), |uow| {
                let mut fresh: Habit = uow.load(habit.envelope.ref_id, false)?;
                uow.save(&mut fresh)?;

                let mut stale = habit.clone();
                stale.name = "Row stale".to_string();
                uow.save(&mut stale)
            })
            .expect_err("stale save");
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[test]
    fn events_carry_contiguous_session_indices() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("test.db")).expect("db");

        let (first, second) = db
            .with_uow(EventSource::Background, now(), |uow| {
                let first = uow.create(new_habit("One"))?;
                let mut second = uow.create(new_habit("Two"))?;
                second.suspended = true;
                uow.save(&mut second)?;
                Ok((first, second))
            })
            .expect("writes");

        db.with_uow(EventSource::Background, now(), |uow| {
            let events_one = uow.events_for(EntityKind::Habit, first.envelope.ref_id)?;
            let events_two = uow.events_for(EntityKind::Habit, second.envelope.ref_id)?;
            assert_eq!(events_one.len(), 1);
            assert_eq!(events_two.len(), 2);
            let mut all: Vec<i64> = events_one
                .iter()
                .chain(events_two.iter())
                .map(|e| e.session_index)
                .collect();
            all.sort_unstable();
            assert_eq!(all, vec![0, 1, 2]);
            assert!(events_two[0].session_index < events_two[1].session_index);
            Ok(())
        })
        .expect("events");
    }

    #[test]
    fn failed_uow_rolls_back_everything() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("test.db")).expect("db");

        let result: EngineResult<()> = db.with_uow(EventSource::Cli, now(), |uow| {
            uow.create(new_habit("Ghost"))?;
            Err(EngineError::Validation("forced failure".to_string()))
        });
        assert!(result.is_err());

        db.with_uow(EventSource::Cli, now(), |uow| {
            let habits: Vec<Habit> = uow.find_all(true)?;
            assert!(habits.is_empty());
            Ok(())
        })
        .expect("read");
    }

    #[test]
    fn generated_task_finder_filters_on_source_and_timeline() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("test.db")).expect("db");

        let task = InboxTask {
            envelope: Envelope::new(now()),
            name: "Exercise".to_string(),
            status: InboxTaskStatus::NotStartedGen,
            project_ref_id: 1,
            source: InboxTaskSource::Habit,
            source_ref_id: Some(10),
            eisen: Some(Eisen::Important),
            difficulty: None,
            actionable_date: None,
            due_date: None,
            completed_time: None,
            recurring_timeline: Some("2024-03-01".to_string()),
            recurring_repeat_index: Some(0),
        };
        let mut ad_hoc = task.clone();
        ad_hoc.source = InboxTaskSource::User;
        ad_hoc.source_ref_id = None;
        ad_hoc.recurring_timeline = None;
        ad_hoc.recurring_repeat_index = None;

        db.with_uow(EventSource::Cli, now(), |uow| {
            uow.create(task.clone())?;
            uow.create(ad_hoc)?;
            Ok(())
        })
        .expect("seed");

        db.with_uow(EventSource::Cli, now(), |uow| {
            let found = uow.find_generated_inbox_tasks(InboxTaskSource::Habit, 10)?;
            assert_eq!(found.len(), 1);
            assert_eq!(found[0].recurring_timeline.as_deref(), Some("2024-03-01"));
            Ok(())
        })
        .expect("find");
    }

    #[test]
    fn project_cycle_check_refuses_loops() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("test.db")).expect("db");

        db.with_uow(EventSource::Cli, now(), |uow| {
            let root = uow.create(Project {
                envelope: Envelope::new(now()),
                name: "Life".to_string(),
                parent_project_ref_id: None,
            })?;
            let child = uow.create(Project {
                envelope: Envelope::new(now()),
                name: "Health".to_string(),
                parent_project_ref_id: Some(root.envelope.ref_id),
            })?;

            uow.check_project_parent(child.envelope.ref_id, root.envelope.ref_id)?;
            let err = uow
                .check_project_parent(root.envelope.ref_id, child.envelope.ref_id)
                .expect_err("cycle");
            assert!(matches!(err, EngineError::Invariant(_)));
            Ok(())
        })
        .expect("projects");
    }

    #[test]
    fn score_log_is_append_only_and_idempotent_per_entity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("test.db")).expect("db");

        let entry = ScoreLogEntry {
            id: 0,
            created_time: now(),
            source: ScoreSource::InboxTask,
            source_entity_ref_id: 42,
            difficulty: None,
            score_delta: 2,
            had_lucky_puppy_bonus: false,
            timeline_daily: "2024-03-01".to_string(),
            timeline_weekly: "2024-W09".to_string(),
            timeline_monthly: "2024-M03".to_string(),
            timeline_quarterly: "2024-Q1".to_string(),
            timeline_yearly: "2024".to_string(),
        };

        db.with_uow(EventSource::Cli, now(), |uow| {
            assert!(uow.insert_score_log(&entry)?);
            assert!(!uow.insert_score_log(&entry)?);
            assert_eq!(uow.sum_score(RecurringTaskPeriod::Weekly, "2024-W09")?, 2);
            Ok(())
        })
        .expect("score");
    }

    #[test]
    fn period_best_only_raises() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("test.db")).expect("db");

        db.with_uow(EventSource::Cli, now(), |uow| {
            uow.raise_period_best(None, "lifetime", RecurringTaskPeriod::Daily, 5)?;
            uow.raise_period_best(None, "lifetime", RecurringTaskPeriod::Daily, 3)?;
            let best = uow
                .find_period_best(None, "lifetime", RecurringTaskPeriod::Daily)?
                .expect("best");
            assert_eq!(best.total_score, 5);

            uow.raise_period_best(None, "lifetime", RecurringTaskPeriod::Daily, 9)?;
            let best = uow
                .find_period_best(None, "lifetime", RecurringTaskPeriod::Daily)?
                .expect("best");
            assert_eq!(best.total_score, 9);
            Ok(())
        })
        .expect("bests");
    }

    #[test]
    fn log_page_size_is_bounded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("test.db")).expect("db");
        assert!(db.find_last_gen_logs(1001).is_err());
        assert!(db.find_last_gen_logs(0).is_err());
        assert!(db.find_last_gen_logs(1).expect("logs").is_empty());
    }
}
