//! Pure computation of a job's next fire time (§4.1).

use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::error::AgendaError;
use crate::job::Job;

/// `computeNextRunAt(job, now) -> instant | null`.
///
/// Pure with respect to `job` and `now`: callers own persisting the result.
pub fn compute_next_run_at(
    job: &Job,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, AgendaError> {
    let tz = resolve_timezone(job)?;

    if let Some(interval) = job.recurrence.interval.as_deref() {
        return compute_from_interval(job, interval, tz, now);
    }

    if let Some(phrase) = job.recurrence.at.as_deref() {
        return compute_from_clock_phrase(job, phrase, tz, now).map(Some);
    }

    // One-shot: leave unchanged.
    Ok(job.next_run_at)
}

fn resolve_timezone(job: &Job) -> Result<Tz, AgendaError> {
    match job.recurrence.timezone.as_deref() {
        None => Ok(Tz::UTC),
        Some(name) => name.parse::<Tz>().map_err(|_| AgendaError::InvalidRecurrence {
            name: job.name.clone(),
            reason: format!("unknown IANA timezone {name:?}"),
        }),
    }
}

/// Parses `interval` as a `cron` schedule, accepting both the standard
/// 5-field form (`"0 6 * * *"`, no seconds) and the `cron` crate's native
/// 6-field form (`"0 0 6 * * *"`) — prepending a `"0 "` seconds field when
/// exactly 5 fields are present.
fn parse_cron(interval: &str) -> Option<Schedule> {
    let normalized = if interval.split_whitespace().count() == 5 {
        format!("0 {interval}")
    } else {
        interval.to_string()
    };
    Schedule::from_str(&normalized).ok()
}

fn compute_from_interval(
    job: &Job,
    interval: &str,
    tz: Tz,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, AgendaError> {
    let mut candidate = if let Some(schedule) = parse_cron(interval) {
        next_cron_fire(job, &schedule, tz, now)?
    } else if let Some(duration) = parse_human_interval(interval) {
        match job.last_run_at {
            Some(last) => last + duration,
            // First fire: the reference time (`now`, or `last_run_at` when
            // the caller pre-seeded it via `skipImmediate`) is the fire
            // itself.
            None => now,
        }
    } else {
        return Err(AgendaError::InvalidRecurrence {
            name: job.name.clone(),
            reason: format!("{interval:?} is neither a cron expression nor a human interval"),
        });
    };

    if let Some(start) = job.recurrence.start_date {
        if start > candidate {
            let start_of_day = start_of_day_in_tz(start, tz);
            candidate = if let Some(schedule) = parse_cron(interval) {
                schedule
                    .after(&start_of_day.with_timezone(&tz))
                    .next()
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or(start_of_day)
            } else {
                start_of_day
            };
        }
    }

    if job.last_run_at.is_some() && now > job.last_run_at.unwrap() {
        if let Some(skip) = job.recurrence.skip_days.as_deref() {
            if let Some(skip_duration) = parse_human_interval(skip) {
                candidate += skip_duration;
            }
        }
    }

    if let Some(end) = job.recurrence.end_date {
        if end < candidate {
            return Ok(None);
        }
    }

    Ok(Some(candidate))
}

/// Evaluates the next cron fire strictly after `last_run_at ?? now`,
/// retrying with `last_run_at + 1s` to defend against same-second
/// collisions (§4.1 step 1b).
fn next_cron_fire(
    job: &Job,
    schedule: &Schedule,
    tz: Tz,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, AgendaError> {
    let reference = job.last_run_at.unwrap_or(now).with_timezone(&tz);

    let mut candidate = schedule
        .after(&reference)
        .next()
        .map(|d| d.with_timezone(&Utc))
        .ok_or_else(|| AgendaError::InvalidRecurrence {
            name: job.name.clone(),
            reason: "cron schedule never fires again".to_string(),
        })?;

    let collides_with_last = job.last_run_at == Some(candidate);
    let collides_with_previous_next = job
        .next_run_at
        .map(|previous| candidate <= previous)
        .unwrap_or(false);

    if collides_with_last || collides_with_previous_next {
        if let Some(last) = job.last_run_at {
            let retry_from = (last + chrono::Duration::seconds(1)).with_timezone(&tz);
            candidate = schedule
                .after(&retry_from)
                .next()
                .map(|d| d.with_timezone(&Utc))
                .ok_or_else(|| AgendaError::InvalidRecurrence {
                    name: job.name.clone(),
                    reason: "cron schedule never fires again".to_string(),
                })?;
        }
    }

    Ok(candidate)
}

fn start_of_day_in_tz(at: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let local = at.with_timezone(&tz);
    tz.with_ymd_and_hms(local.year(), local.month(), local.day(), 0, 0, 0)
        .single()
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or(at)
}

fn compute_from_clock_phrase(
    job: &Job,
    phrase: &str,
    tz: Tz,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, AgendaError> {
    let time = parse_clock_phrase(phrase).ok_or_else(|| AgendaError::InvalidRecurrence {
        name: job.name.clone(),
        reason: format!("{phrase:?} is not a recognized clock phrase"),
    })?;

    let local_now = now.with_timezone(&tz);
    let mut candidate = tz
        .with_ymd_and_hms(
            local_now.year(),
            local_now.month(),
            local_now.day(),
            time.hour(),
            time.minute(),
            0,
        )
        .single()
        .map(|d| d.with_timezone(&Utc))
        .ok_or_else(|| AgendaError::InvalidRecurrence {
            name: job.name.clone(),
            reason: format!("{phrase:?} does not resolve to a valid local time"),
        })?;

    if candidate <= local_now.with_timezone(&Utc) || Some(candidate) == job.last_run_at {
        candidate += chrono::Duration::days(1);
    }

    Ok(candidate)
}

/// `"<number> <unit>"`, singular or plural: seconds, minutes, hours, days,
/// weeks, months (30-day blocks), years (365-day blocks).
pub fn parse_human_interval(s: &str) -> Option<chrono::Duration> {
    let s = s.trim();
    let (number, unit) = s.split_once(char::is_whitespace)?;
    let count: i64 = number.trim().parse().ok()?;
    let unit = unit.trim().trim_end_matches('s');

    let duration = match unit {
        "second" => chrono::Duration::seconds(count),
        "minute" => chrono::Duration::minutes(count),
        "hour" => chrono::Duration::hours(count),
        "day" => chrono::Duration::days(count),
        "week" => chrono::Duration::weeks(count),
        "month" => chrono::Duration::days(count * 30),
        "year" => chrono::Duration::days(count * 365),
        _ => return None,
    };
    Some(duration)
}

/// `"h[:mm] am|pm"`, e.g. `"3:30pm"`, `"6am"`, `"11:15 PM"`.
fn parse_clock_phrase(s: &str) -> Option<NaiveTime> {
    let s = s.trim().to_ascii_lowercase();
    let (digits, meridiem) = if let Some(rest) = s.strip_suffix("am") {
        (rest.trim(), false)
    } else if let Some(rest) = s.strip_suffix("pm") {
        (rest.trim(), true)
    } else {
        return None;
    };

    let (hour_str, minute_str) = digits.split_once(':').unwrap_or((digits, "0"));
    let mut hour: u32 = hour_str.trim().parse().ok()?;
    let minute: u32 = minute_str.trim().parse().ok()?;
    if !(1..=12).contains(&hour) || minute > 59 {
        return None;
    }

    if meridiem && hour != 12 {
        hour += 12;
    } else if !meridiem && hour == 12 {
        hour = 0;
    }

    NaiveTime::from_hms_opt(hour, minute, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;

    fn job_with_interval(interval: &str) -> Job {
        let mut job = Job::new("recurring", serde_json::json!(null));
        job.recurrence.interval = Some(interval.to_string());
        job
    }

    #[test]
    fn human_interval_first_fire_is_the_reference_time() {
        let job = job_with_interval("5 seconds");
        let now = Utc::now();
        let next = compute_next_run_at(&job, now).unwrap();
        assert_eq!(next, Some(now));
    }

    #[test]
    fn human_interval_subsequent_fire_adds_duration_to_last_run() {
        let mut job = job_with_interval("5 seconds");
        let last = Utc::now();
        job.last_run_at = Some(last);
        let next = compute_next_run_at(&job, last).unwrap();
        assert_eq!(next, Some(last + chrono::Duration::seconds(5)));
    }

    #[test]
    fn cron_across_timezones_scenario_b() {
        let mut job = job_with_interval("0 6 * * *");
        job.recurrence.timezone = Some("GMT".to_string());
        job.last_run_at = Some(
            "2015-01-01T06:00:00Z"
                .parse::<DateTime<Utc>>()
                .unwrap(),
        );
        let next = compute_next_run_at(&job, Utc::now()).unwrap().unwrap();
        assert_eq!(next.hour(), 6);
        assert_eq!(next.day(), 2);
    }

    #[test]
    fn end_date_before_candidate_terminates_recurrence() {
        let mut job = job_with_interval("1 hour");
        job.last_run_at = Some(Utc::now());
        job.recurrence.end_date = Some(job.last_run_at.unwrap() - chrono::Duration::minutes(1));
        let next = compute_next_run_at(&job, Utc::now()).unwrap();
        assert_eq!(next, None);
    }

    #[test]
    fn invalid_recurrence_is_reported_categorically() {
        let job = job_with_interval("not a real interval");
        let err = compute_next_run_at(&job, Utc::now()).unwrap_err();
        assert!(matches!(err, AgendaError::InvalidRecurrence { .. }));
    }

    #[test]
    fn clock_phrase_parses_common_forms() {
        assert_eq!(
            parse_clock_phrase("3:30pm"),
            NaiveTime::from_hms_opt(15, 30, 0)
        );
        assert_eq!(parse_clock_phrase("6am"), NaiveTime::from_hms_opt(6, 0, 0));
        assert_eq!(
            parse_clock_phrase("11:15 PM"),
            NaiveTime::from_hms_opt(23, 15, 0)
        );
        assert_eq!(parse_clock_phrase("garbage"), None);
    }

    #[test]
    fn one_shot_job_leaves_next_run_at_untouched() {
        let mut job = Job::new("one-shot", serde_json::json!(null));
        let at = Utc::now() + chrono::Duration::minutes(5);
        job.next_run_at = Some(at);
        assert_eq!(compute_next_run_at(&job, Utc::now()).unwrap(), Some(at));
    }
}
