//! Schedule-to-cron mapping and due-time arithmetic.
//!
//! Integration schedules are stored as structured fields (frequency, time of
//! day, days, timezone) and compiled here into cron expressions evaluated in
//! the integration's own timezone. The `cron` crate wants a seconds field,
//! so every expression is prefixed with `0`.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use partsync_protocol::defaults::OVERDUE_GRACE_SECS;
use partsync_protocol::types::{Integration, SyncFrequency, SyncSchedule};
use std::str::FromStr;
use tracing::warn;

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Compile a schedule into a cron expression. `None` for manual schedules.
pub fn cron_expression(schedule: &SyncSchedule) -> Option<String> {
    let (hour, minute) = time_of_day(schedule);

    let expression = match schedule.frequency {
        SyncFrequency::Manual => return None,
        SyncFrequency::Hourly => format!("0 {} * * * *", minute),
        SyncFrequency::EveryNHours => {
            let step = schedule.every_hours.unwrap_or(1).clamp(1, 12);
            format!("0 {} */{} * * *", minute, step)
        }
        SyncFrequency::Daily => format!("0 {} {} * * *", minute, hour),
        SyncFrequency::Weekly => {
            let days = if schedule.days_of_week.is_empty() {
                "MON".to_string()
            } else {
                schedule
                    .days_of_week
                    .iter()
                    .map(|d| DAY_NAMES[(*d as usize) % 7])
                    .collect::<Vec<_>>()
                    .join(",")
            };
            format!("0 {} {} * * {}", minute, hour, days)
        }
        SyncFrequency::Monthly => {
            let day = schedule.day_of_month.unwrap_or(1).clamp(1, 28);
            format!("0 {} {} {} * *", minute, hour, day)
        }
    };
    Some(expression)
}

/// The next fire instant after `after`, evaluated in the schedule's
/// timezone. `None` for manual or unparseable schedules.
pub fn next_fire(schedule: &SyncSchedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let expression = cron_expression(schedule)?;
    let parsed = match Schedule::from_str(&expression) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(expression = %expression, error = %e, "bad cron expression");
            return None;
        }
    };

    let tz = timezone(schedule);
    parsed
        .after(&after.with_timezone(&tz))
        .next()
        .map(|next| next.with_timezone(&Utc))
}

/// Whether an integration's next run is overdue:
/// `now > lastSync + interval + grace`. Never synced means due; manual
/// schedules are never due.
pub fn is_sync_due(integration: &Integration, now: DateTime<Utc>) -> bool {
    let Some(interval) = integration.schedule.interval() else {
        return false;
    };
    let Some(last_sync) = &integration.last_sync else {
        return true;
    };
    now > last_sync.date + interval + chrono::Duration::seconds(OVERDUE_GRACE_SECS)
}

fn timezone(schedule: &SyncSchedule) -> Tz {
    schedule
        .timezone
        .as_deref()
        .and_then(|name| name.parse::<Tz>().ok())
        .unwrap_or(Tz::UTC)
}

fn time_of_day(schedule: &SyncSchedule) -> (u8, u8) {
    let Some(raw) = schedule.time_of_day.as_deref() else {
        return (0, 0);
    };
    let mut parts = raw.splitn(2, ':');
    let hour = parts
        .next()
        .and_then(|p| p.trim().parse::<u8>().ok())
        .unwrap_or(0)
        .min(23);
    let minute = parts
        .next()
        .and_then(|p| p.trim().parse::<u8>().ok())
        .unwrap_or(0)
        .min(59);
    (hour, minute)
}

#[cfg(test)]
mod tests {
    use super::*;
    use partsync_protocol::types::{
        IntegrationKind, IntegrationStats, IntegrationStatus, LastSync, SyncStatus,
    };

    fn schedule(frequency: SyncFrequency) -> SyncSchedule {
        SyncSchedule {
            enabled: true,
            frequency,
            time_of_day: Some("02:30".to_string()),
            ..Default::default()
        }
    }

    fn integration_with(frequency: SyncFrequency, last_sync: Option<LastSync>) -> Integration {
        Integration {
            id: "i1".to_string(),
            name: "Supplier".to_string(),
            kind: IntegrationKind::Ftp,
            ftp: None,
            schedule: schedule(frequency),
            status: IntegrationStatus::Active,
            last_sync,
            stats: IntegrationStats::default(),
        }
    }

    fn last_sync_at(date: DateTime<Utc>) -> LastSync {
        LastSync {
            date,
            status: SyncStatus::Completed,
            duration_ms: 1000,
            records: 10,
            error: None,
        }
    }

    #[test]
    fn expressions_follow_the_frequency_mapping() {
        assert_eq!(cron_expression(&schedule(SyncFrequency::Manual)), None);
        assert_eq!(
            cron_expression(&schedule(SyncFrequency::Hourly)).unwrap(),
            "0 30 * * * *"
        );
        assert_eq!(
            cron_expression(&schedule(SyncFrequency::Daily)).unwrap(),
            "0 30 2 * * *"
        );

        let mut every_six = schedule(SyncFrequency::EveryNHours);
        every_six.every_hours = Some(6);
        assert_eq!(
            cron_expression(&every_six).unwrap(),
            "0 30 */6 * * *"
        );

        let mut monthly = schedule(SyncFrequency::Monthly);
        monthly.day_of_month = Some(15);
        assert_eq!(
            cron_expression(&monthly).unwrap(),
            "0 30 2 15 * *"
        );
    }

    #[test]
    fn weekly_defaults_to_monday() {
        assert_eq!(
            cron_expression(&schedule(SyncFrequency::Weekly)).unwrap(),
            "0 30 2 * * MON"
        );

        let mut weekend = schedule(SyncFrequency::Weekly);
        weekend.days_of_week = vec![0, 6];
        assert_eq!(
            cron_expression(&weekend).unwrap(),
            "0 30 2 * * SUN,SAT"
        );
    }

    #[test]
    fn next_fire_respects_the_timezone() {
        let mut daily = schedule(SyncFrequency::Daily);
        daily.timezone = Some("Asia/Dubai".to_string());

        let after = DateTime::parse_from_rfc3339("2025-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let next = next_fire(&daily, after).unwrap();

        // 02:30 in Dubai (UTC+4) is 22:30 UTC the previous day.
        assert_eq!(next.to_rfc3339(), "2025-06-01T22:30:00+00:00");
    }

    #[test]
    fn next_fire_is_always_in_the_future() {
        let daily = schedule(SyncFrequency::Daily);
        let now = Utc::now();
        let next = next_fire(&daily, now).unwrap();
        assert!(next > now);
        assert_eq!(next_fire(&schedule(SyncFrequency::Manual), now), None);
    }

    #[test]
    fn due_check_is_monotone_in_now() {
        let last = Utc::now() - chrono::Duration::hours(20);
        let integration =
            integration_with(SyncFrequency::Daily, Some(last_sync_at(last)));

        // daily interval + 2h grace = due 26h after last sync.
        let now_before = last + chrono::Duration::hours(25);
        let now_after = last + chrono::Duration::hours(27);
        assert!(!is_sync_due(&integration, now_before));
        assert!(is_sync_due(&integration, now_after));

        // Once due, staying due as now advances.
        assert!(is_sync_due(&integration, now_after + chrono::Duration::hours(5)));
    }

    #[test]
    fn never_synced_is_due_and_manual_never_is() {
        let fresh = integration_with(SyncFrequency::Daily, None);
        assert!(is_sync_due(&fresh, Utc::now()));

        let manual = integration_with(SyncFrequency::Manual, None);
        assert!(!is_sync_due(&manual, Utc::now()));
    }

    #[test]
    fn overdue_daily_sync_is_detected_after_grace() {
        // Last synced 27 hours ago with a daily schedule: overdue.
        let integration = integration_with(
            SyncFrequency::Daily,
            Some(last_sync_at(Utc::now() - chrono::Duration::hours(27))),
        );
        assert!(is_sync_due(&integration, Utc::now()));
    }
}
