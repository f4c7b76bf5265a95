//! Day-of-week scheduling gate.

use chrono::{Datelike, Local, Weekday};
use std::collections::HashSet;

/// Whether a domain with the given weekday set is due today (local time).
pub fn is_scheduled_today(days: &HashSet<Weekday>) -> bool {
    is_scheduled_on(days, Local::now().weekday())
}

/// Whether `weekday` is one of `days`.
pub fn is_scheduled_on(days: &HashSet<Weekday>, weekday: Weekday) -> bool {
    days.contains(&weekday)
}
