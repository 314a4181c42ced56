//! Cron schedule for the delivery job.
//!
//! Accepts the classic 5-field form (`min hour dom month dow`) as well as the
//! 6/7-field form with seconds (and year). A 5-field expression fires at
//! second zero.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone};
use cron::Schedule;

#[derive(Clone)]
pub struct DailySchedule {
    expression: String,
    schedule: Schedule,
}

impl DailySchedule {
    /// # Errors
    ///
    /// Returns the cron parse error for malformed expressions.
    pub fn parse(expression: &str) -> Result<Self, cron::error::Error> {
        let expression = expression.trim();
        let normalized = if expression.split_whitespace().count() == 5 {
            format!("0 {expression}")
        } else {
            expression.to_string()
        };

        let schedule = Schedule::from_str(&normalized)?;

        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    /// First occurrence strictly after `after`, in the same time zone.
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.schedule.after(after).next()
    }

    /// The expression as configured.
    pub fn expression(&self) -> &str {
        &self.expression
    }
}

impl fmt::Debug for DailySchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DailySchedule")
            .field(&self.expression)
            .finish()
    }
}

impl fmt::Display for DailySchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}
