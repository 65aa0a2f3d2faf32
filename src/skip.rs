use crate::models::{RecurringTaskPeriod, SkipParity, SkipRule};
use crate::period::quarter_of;
use chrono::{Datelike, NaiveDate};

/// Position of a period instance inside its enclosing calendar cycle. This
/// is what parity and membership skip rules test against.
pub fn sub_index(period: RecurringTaskPeriod, date: NaiveDate) -> u32 {
    match period {
        RecurringTaskPeriod::Daily => 0,
        RecurringTaskPeriod::Weekly => date.iso_week().week(),
        RecurringTaskPeriod::Monthly => date.month(),
        RecurringTaskPeriod::Quarterly => quarter_of(date),
        RecurringTaskPeriod::Yearly => date.year().unsigned_abs(),
    }
}

pub fn is_skipped(
    rule: Option<&SkipRule>,
    period: RecurringTaskPeriod,
    date: NaiveDate,
) -> bool {
    let Some(rule) = rule else {
        return false;
    };
    let index = sub_index(period, date);
    match rule {
        SkipRule::Parity(SkipParity::Even) => index % 2 == 0,
        SkipRule::Parity(SkipParity::Odd) => index % 2 == 1,
        SkipRule::Days(days) => days.contains(&index),
    }
}
