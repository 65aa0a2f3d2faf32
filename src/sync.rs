use crate::db::UnitOfWork;
use crate::errors::EngineResult;
use crate::models::ScheduleExternalSyncLogEntry;
use chrono::{DateTime, NaiveDate, Utc};

const MAX_SYNC_PAGES: usize = 10;

#[derive(Debug, Clone)]
pub struct ExternalEventRecord {
    pub external_uid: String,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ExternalSchedulePage {
    pub events: Vec<ExternalEventRecord>,
    pub next_cursor: Option<String>,
}

/// A paged feed of external calendar events for one stream.
pub trait ExternalScheduleSource {
    fn fetch_page(
        &self,
        stream_ref_id: i64,
        sync_start: Option<NaiveDate>,
        sync_end: Option<NaiveDate>,
        cursor: Option<&str>,
    ) -> EngineResult<ExternalSchedulePage>;
}

/// Pulls pages from the source and upserts them by `(stream, external_uid)`.
/// The run is bounded; a leftover cursor is recorded as
/// `even_more_entity_records` so the next run can pick up.
pub fn sync_stream(
    uow: &UnitOfWork<'_>,
    stream_ref_id: i64,
    sync_start: Option<NaiveDate>,
    sync_end: Option<NaiveDate>,
    source: &dyn ExternalScheduleSource,
) -> EngineResult<ScheduleExternalSyncLogEntry> {
    let mut upserted = 0i64;
    let mut errors = Vec::new();
    let mut cursor: Option<String> = None;
    let mut more = false;

    for page_index in 0..MAX_SYNC_PAGES {
        let page = source.fetch_page(stream_ref_id, sync_start, sync_end, cursor.as_deref())?;
        for event in &page.events {
            match uow.upsert_schedule_event(
                stream_ref_id,
                &event.external_uid,
                &event.name,
                event.start_time,
                event.end_time,
            ) {
                Ok(true) => upserted += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(
                        stream_ref_id,
                        external_uid = %event.external_uid,
                        error = %err,
                        "failed to upsert external event"
                    );
                    errors.push(format!("event {}: {err}", event.external_uid));
                }
            }
        }
        match page.next_cursor {
            Some(next) => {
                cursor = Some(next);
                more = page_index + 1 == MAX_SYNC_PAGES;
            }
            None => {
                more = false;
                break;
            }
        }
    }

    uow.insert_sync_log(stream_ref_id, sync_start, sync_end, upserted, more, &errors)
}
