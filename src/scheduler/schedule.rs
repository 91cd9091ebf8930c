//! Recurring job schedules for the maintenance loop.
use time::{Duration, OffsetDateTime, Time};

/// When a maintenance job fires.
#[derive(Debug, Clone, Copy)]
pub enum JobSchedule {
    /// Fixed period since the last run. Fires immediately on first check.
    Every(Duration),
    /// Once a day at the given UTC time. A missed run fires at the next
    /// check past the fire time.
    DailyAt { hour: u8, minute: u8 },
}

impl JobSchedule {
    /// Should the job run now, given when it last ran?
    pub fn due(&self, last_run: Option<OffsetDateTime>, now: OffsetDateTime) -> bool {
        match self {
            Self::Every(period) => match last_run {
                None => true,
                Some(last) => now - last >= *period,
            },

            Self::DailyAt { hour, minute } => {
                let fire_time = match Time::from_hms(*hour, *minute, 0) {
                    Ok(time) => time,
                    Err(_) => return false,
                };
                let today = now.replace_time(fire_time);

                now >= today && last_run.map(|last| last < today).unwrap_or(true)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_every() {
        let schedule = JobSchedule::Every(Duration::hours(1));
        let now = datetime!(2026-03-01 12:00 UTC);

        assert!(schedule.due(None, now));
        assert!(!schedule.due(Some(datetime!(2026-03-01 11:30 UTC)), now));
        assert!(schedule.due(Some(datetime!(2026-03-01 11:00 UTC)), now));
        assert!(schedule.due(Some(datetime!(2026-03-01 09:00 UTC)), now));
    }

    #[test]
    fn test_daily_at() {
        let schedule = JobSchedule::DailyAt { hour: 3, minute: 0 };

        // Before the fire time, nothing happens.
        assert!(!schedule.due(None, datetime!(2026-03-01 02:59 UTC)));

        // Past the fire time with no prior run.
        assert!(schedule.due(None, datetime!(2026-03-01 03:00 UTC)));
        assert!(schedule.due(None, datetime!(2026-03-01 17:00 UTC)));

        // Already ran today.
        assert!(!schedule.due(
            Some(datetime!(2026-03-01 03:00:01 UTC)),
            datetime!(2026-03-01 17:00 UTC)
        ));

        // Ran yesterday, due again past today's fire time.
        assert!(schedule.due(
            Some(datetime!(2026-02-28 03:00:01 UTC)),
            datetime!(2026-03-01 03:00:30 UTC)
        ));
    }
}
