use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// How many photocell timestamps the meter keeps. Three timestamps cover
/// two full revolutions, enough for an instantaneous reading.
const METER_CAPACITY: usize = 3;

/// Speed meter fed by the machine cycle sensor.
///
/// Every rising edge of the photocell appends a monotonic timestamp; the
/// reading is derived from the span between the oldest and newest sample.
/// Shared between the sensor edge callback and the interface, so access is
/// behind a mutex.
#[derive(Debug, Default)]
pub struct CycleMeter {
    events: Mutex<VecDeque<Instant>>,
}

impl CycleMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, at: Instant) {
        let mut events = self.events.lock().expect("cycle meter lock poisoned");
        if events.len() == METER_CAPACITY {
            events.pop_front();
        }
        events.push_back(at);
    }

    /// Dropped on motor stop and on machine start, so stale revolutions
    /// never leak into a fresh reading.
    pub fn clear(&self) {
        self.events.lock().expect("cycle meter lock poisoned").clear();
    }

    /// Current machine speed in revolutions per minute, rounded to 0.01.
    ///
    /// Returns 0 with fewer than two samples, a zero span, or a span longer
    /// than the sensor timeout (the machine has effectively stopped).
    pub fn rpm(&self, sensor_timeout: Duration) -> f64 {
        let events = self.events.lock().expect("cycle meter lock poisoned");
        let (first, last) = match (events.front(), events.back()) {
            (Some(first), Some(last)) if events.len() >= 2 => (*first, *last),
            _ => return 0.0,
        };
        let span = last - first;
        if span.is_zero() || span > sensor_timeout {
            return 0.0;
        }
        let per_second = (events.len() - 1) as f64 / span.as_secs_f64();
        (per_second * 60.0 * 100.0).round() / 100.0
    }
}

#[cfg(test)]
mod testing {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn test_no_events_reads_zero() {
        let meter = CycleMeter::new();
        assert_eq!(meter.rpm(TIMEOUT), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_event_reads_zero() {
        let meter = CycleMeter::new();
        meter.record(Instant::now());
        assert_eq!(meter.rpm(TIMEOUT), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_revolutions_per_second() {
        let meter = CycleMeter::new();
        for _ in 0..METER_CAPACITY {
            meter.record(Instant::now());
            tokio::time::advance(Duration::from_millis(500)).await;
        }
        // 3 samples = 2 revolutions over 1 s
        assert_eq!(meter.rpm(TIMEOUT), 120.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_span_longer_than_timeout_reads_zero() {
        let meter = CycleMeter::new();
        meter.record(Instant::now());
        tokio::time::advance(Duration::from_secs(6)).await;
        meter.record(Instant::now());
        assert_eq!(meter.rpm(TIMEOUT), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_is_bounded() {
        let meter = CycleMeter::new();
        for _ in 0..10 {
            meter.record(Instant::now());
            tokio::time::advance(Duration::from_millis(100)).await;
        }
        let events = meter.events.lock().unwrap();
        assert_eq!(events.len(), METER_CAPACITY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_resets_reading() {
        let meter = CycleMeter::new();
        for _ in 0..METER_CAPACITY {
            meter.record(Instant::now());
            tokio::time::advance(Duration::from_millis(200)).await;
        }
        assert!(meter.rpm(TIMEOUT) > 0.0);
        meter.clear();
        assert_eq!(meter.rpm(TIMEOUT), 0.0);
    }
}
