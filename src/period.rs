use crate::errors::{EngineError, EngineResult};
use crate::models::{RecurringTaskGenParams, RecurringTaskPeriod};
use chrono::{Datelike, Days, NaiveDate, Weekday};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodInstance {
    pub period: RecurringTaskPeriod,
    pub timeline: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

pub fn timeline(period: RecurringTaskPeriod, date: NaiveDate) -> String {
    match period {
        RecurringTaskPeriod::Daily => date.format("%Y-%m-%d").to_string(),
        RecurringTaskPeriod::Weekly => {
            let iso = date.iso_week();
            format!("{:04}-W{:02}", iso.year(), iso.week())
        }
        RecurringTaskPeriod::Monthly => format!("{:04}-M{:02}", date.year(), date.month()),
        RecurringTaskPeriod::Quarterly => {
            format!("{:04}-Q{}", date.year(), quarter_of(date))
        }
        RecurringTaskPeriod::Yearly => format!("{:04}", date.year()),
    }
}

pub fn bounds(period: RecurringTaskPeriod, date: NaiveDate) -> (NaiveDate, NaiveDate) {
    match period {
        RecurringTaskPeriod::Daily => (date, date),
        RecurringTaskPeriod::Weekly => {
            let iso = date.iso_week();
            let monday = NaiveDate::from_isoywd_opt(iso.year(), iso.week(), Weekday::Mon)
                .unwrap_or(date);
            let sunday = monday + Days::new(6);
            (monday, sunday)
        }
        RecurringTaskPeriod::Monthly => {
            let first = first_of_month(date.year(), date.month());
            (first, last_of_month(date.year(), date.month()))
        }
        RecurringTaskPeriod::Quarterly => {
            let first_month = (quarter_of(date) - 1) * 3 + 1;
            let first = first_of_month(date.year(), first_month);
            (first, last_of_month(date.year(), first_month + 2))
        }
        RecurringTaskPeriod::Yearly => (
            first_of_month(date.year(), 1),
            last_of_month(date.year(), 12),
        ),
    }
}

pub fn instance_for(period: RecurringTaskPeriod, date: NaiveDate) -> PeriodInstance {
    let (start_date, end_date) = bounds(period, date);
    PeriodInstance {
        period,
        timeline: timeline(period, date),
        start_date,
        end_date,
    }
}

/// Every period instance whose interval intersects `[from, to]`, in order.
pub fn instances_in_range(
    period: RecurringTaskPeriod,
    from: NaiveDate,
    to: NaiveDate,
) -> Vec<PeriodInstance> {
    let mut out = Vec::new();
    let mut cursor = from;
    while cursor <= to {
        let instance = instance_for(period, cursor);
        let next = instance.end_date + Days::new(1);
        out.push(instance);
        cursor = next;
    }
    out
}

pub fn lookahead_days(period: RecurringTaskPeriod) -> u64 {
    match period {
        RecurringTaskPeriod::Daily => 0,
        RecurringTaskPeriod::Weekly => 3,
        RecurringTaskPeriod::Monthly => 7,
        RecurringTaskPeriod::Quarterly => 14,
        RecurringTaskPeriod::Yearly => 30,
    }
}

pub fn resolve_due(
    params: &RecurringTaskGenParams,
    start: NaiveDate,
    end: NaiveDate,
) -> EngineResult<NaiveDate> {
    let period = params
        .period
        .ok_or_else(|| EngineError::Validation("gen params are missing a period".to_string()))?;
    resolve_offset(period, params.due_at_day, params.due_at_month, start, end)
        .map(|date| date.unwrap_or(end))
}

pub fn resolve_actionable(
    params: &RecurringTaskGenParams,
    start: NaiveDate,
    end: NaiveDate,
    due: NaiveDate,
) -> EngineResult<Option<NaiveDate>> {
    let period = params
        .period
        .ok_or_else(|| EngineError::Validation("gen params are missing a period".to_string()))?;
    let resolved = resolve_offset(
        period,
        params.actionable_from_day,
        params.actionable_from_month,
        start,
        end,
    )?;
    Ok(resolved.map(|date| if date > due { due } else { date }))
}

fn resolve_offset(
    period: RecurringTaskPeriod,
    at_day: Option<u32>,
    at_month: Option<u32>,
    start: NaiveDate,
    end: NaiveDate,
) -> EngineResult<Option<NaiveDate>> {
    if at_day.is_none() && at_month.is_none() {
        return Ok(None);
    }

    match period {
        RecurringTaskPeriod::Daily => Ok(Some(start)),
        RecurringTaskPeriod::Weekly => {
            let day = at_day.unwrap_or(1);
            if day < 1 || day > 7 {
                return Err(EngineError::Validation(format!(
                    "day offset {day} is outside the week"
                )));
            }
            let date = start + Days::new(u64::from(day - 1));
            Ok(Some(date.min(end)))
        }
        RecurringTaskPeriod::Monthly | RecurringTaskPeriod::Quarterly | RecurringTaskPeriod::Yearly => {
            let months_in_period = months_between(start, end);
            let month_index = match at_month {
                Some(index) => {
                    if index < 1 || index > months_in_period {
                        return Err(EngineError::Validation(format!(
                            "month offset {index} is outside the {} period",
                            period.as_str()
                        )));
                    }
                    index
                }
                None => months_in_period,
            };
            let (year, month) = add_months(start.year(), start.month(), month_index - 1);
            let last = last_of_month(year, month);
            let day = match at_day {
                Some(day) => {
                    if day < 1 || day > 31 {
                        return Err(EngineError::Validation(format!(
                            "day offset {day} is outside the month"
                        )));
                    }
                    day.min(last.day())
                }
                None => last.day(),
            };
            NaiveDate::from_ymd_opt(year, month, day)
                .map(Some)
                .ok_or_else(|| {
                    EngineError::Invariant(format!("no date for {year:04}-{month:02}-{day:02}"))
                })
        }
    }
}

pub fn quarter_of(date: NaiveDate) -> u32 {
    (date.month() - 1) / 3 + 1
}

pub fn first_of_month(year: i32, month: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MIN)
}

pub fn last_of_month(year: i32, month: u32) -> NaiveDate {
    let (next_year, next_month) = add_months(year, month, 1);
    first_of_month(next_year, next_month) - Days::new(1)
}

fn add_months(year: i32, month: u32, offset: u32) -> (i32, u32) {
    let zero_based = (month - 1) + offset;
    (year + (zero_based / 12) as i32, zero_based % 12 + 1)
}

fn months_between(start: NaiveDate, end: NaiveDate) -> u32 {
    let span = (end.year() - start.year()) * 12 + end.month() as i32 - start.month() as i32;
    (span + 1).max(1) as u32
}

/// A person's birthday projected into `year`, with Feb 29 collapsing to
/// Feb 28 on non-leap years.
pub fn birthday_in_year(day: u32, month: u32, year: i32) -> EngineResult<NaiveDate> {
    if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
        return Ok(date);
    }
    if month == 2 && day == 29 {
        return NaiveDate::from_ymd_opt(year, 2, 28).ok_or_else(|| {
            EngineError::Invariant(format!("no Feb 28 in year {year}"))
        });
    }
    Err(EngineError::Validation(format!(
        "birthday {month:02}-{day:02} is not a valid calendar date"
    )))
}
