//! Property-based tests for the schedule lifecycle.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use chrono_tz::Tz;
use proptest::prelude::*;
use serde_json::json;

use kettle_scheduler::tenant::MemoryTenantStores;
use kettle_scheduler::{
    FixedClock, Frequency, MAX_EXECUTION_HISTORY, NewSchedule, ScheduleService, ScheduleServices,
    TenantContext,
};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn service_at(now: DateTime<Utc>) -> ScheduleService {
    let services = ScheduleServices::new(
        Arc::new(MemoryTenantStores::new()),
        Arc::new(FixedClock::new(now)),
        Tz::UTC,
    );
    runtime()
        .block_on(services.for_tenant(&TenantContext::tenant("iron")))
        .unwrap()
}

fn base() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

// Strategy for minutes within roughly a year of the base instant
fn now_strategy() -> impl Strategy<Value = DateTime<Utc>> {
    (0i64..(60 * 24 * 365)).prop_map(|mins| base() + Duration::minutes(mins))
}

// Strategy for "HH:MM" strings
fn time_of_day() -> impl Strategy<Value = (u32, u32)> {
    (0u32..24, 0u32..60)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn weekly_next_run_lands_on_selected_weekday(
        now in now_strategy(),
        (hour, minute) in time_of_day(),
        week_days in prop::collection::btree_set(0u32..7, 1..7),
    ) {
        let service = service_at(now);
        let rt = runtime();
        let schedule = rt.block_on(service.create(
            NewSchedule {
                title: "weekly".to_string(),
                frequency: Frequency::Weekly,
                week_days: week_days.iter().copied().collect(),
                time_of_day: Some(format!("{hour:02}:{minute:02}")),
                ..Default::default()
            },
            None,
        )).unwrap();

        let next = schedule.next_run_date;
        prop_assert!(next > now);
        prop_assert!(next <= now + Duration::days(7));
        prop_assert!(week_days.contains(&next.weekday().num_days_from_sunday()));
        prop_assert_eq!((next.hour(), next.minute()), (hour, minute));
    }

    #[test]
    fn repeated_create_keeps_one_record(
        now in now_strategy(),
        (hour, minute) in time_of_day(),
        repeats in 1usize..6,
    ) {
        let service = service_at(now);
        let rt = runtime();
        let input = NewSchedule {
            title: "reminder".to_string(),
            frequency: Frequency::Daily,
            time_of_day: Some(format!("{hour:02}:{minute:02}")),
            entity_id: Some("class-1".to_string()),
            action: Some("remind".to_string()),
            data: Some(json!({"recipientId": "member-1"})),
            ..Default::default()
        };

        let first = rt.block_on(service.create(input.clone(), None)).unwrap();
        for _ in 0..repeats {
            let again = rt.block_on(service.create(input.clone(), None)).unwrap();
            prop_assert_eq!(&again.id, &first.id);
        }
        prop_assert_eq!(rt.block_on(service.list()).unwrap().len(), 1);
    }

    #[test]
    fn execution_history_is_bounded_and_counts_add_up(
        outcomes in prop::collection::vec(any::<bool>(), 1..80),
    ) {
        let service = service_at(base());
        let rt = runtime();
        let schedule = rt.block_on(service.create(
            NewSchedule {
                title: "tracked".to_string(),
                frequency: Frequency::Daily,
                ..Default::default()
            },
            None,
        )).unwrap();

        let mut last = schedule;
        for success in &outcomes {
            let error = (!success).then(|| "boom".to_string());
            last = rt.block_on(service.track_execution(&last.id, *success, error)).unwrap();
        }

        let successes = outcomes.iter().filter(|s| **s).count() as u32;
        prop_assert_eq!(last.execution_count as usize, outcomes.len());
        prop_assert_eq!(last.success_count, successes);
        prop_assert_eq!(last.failure_count, outcomes.len() as u32 - successes);
        prop_assert_eq!(
            last.execution_history.len(),
            outcomes.len().min(MAX_EXECUTION_HISTORY)
        );
    }
}
