//! Trip aggregate and ledger.
//!
//! `Trip` is the aggregate root for one journey: authoritative passenger count,
//! capacity and edge-triggered overload tracking, and an append-only event log.
//! Its methods are pure over an explicit `now` so time-dependent behaviour is testable.
//!
//! `TripLedger` is the shared, mutex-guarded owner of the current trip plus the
//! counter statistics. The processing loop is its only writer; everything else reads
//! cloned snapshots. A poisoned lock is recovered so the ledger stays queryable for
//! the life of the process.
//!
//! A trip in a terminal state (`completed`, `cancelled`, `error`) rejects further
//! mutation with an error. `end()` on a terminal trip is a no-op.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::fusion::FusionStats;
use crate::CrossingKind;

// ----------------------------------------------------------------------------
// Status and events
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus {
    NotStarted,
    Active,
    Paused,
    Completed,
    Cancelled,
    Error,
}

impl TripStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Error)
    }
}

impl fmt::Display for TripStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripEventType {
    TripStarted,
    TripStopped,
    TripPaused,
    TripResumed,
    TripCancelled,
    PassengerEntry,
    PassengerExit,
    OverloadDetected,
    SystemError,
}

impl TripEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TripStarted => "trip_started",
            Self::TripStopped => "trip_stopped",
            Self::TripPaused => "trip_paused",
            Self::TripResumed => "trip_resumed",
            Self::TripCancelled => "trip_cancelled",
            Self::PassengerEntry => "passenger_entry",
            Self::PassengerExit => "passenger_exit",
            Self::OverloadDetected => "overload_detected",
            Self::SystemError => "system_error",
        }
    }
}

impl fmt::Display for TripEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TripEvent {
    pub event_id: String,
    pub trip_id: String,
    pub event_type: TripEventType,
    pub timestamp: DateTime<Utc>,
    /// Passenger count at the time of the event.
    pub passenger_count: u32,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn random_id(prefix: &str) -> String {
    let bytes: [u8; 8] = rand::random();
    format!("{}_{}", prefix, hex::encode(bytes))
}

// ----------------------------------------------------------------------------
// Trip
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    trip_id: String,
    device_id: String,
    status: TripStatus,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    current_passenger_count: u32,
    max_passenger_count: u32,
    total_entries: u64,
    total_exits: u64,
    max_capacity: u32,
    overload_events: u64,
    is_overloaded: bool,
    events: Vec<TripEvent>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TripSummary {
    pub trip_id: String,
    pub device_id: String,
    pub status: TripStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub current_passenger_count: u32,
    pub max_passenger_count: u32,
    pub max_capacity: u32,
    pub total_entries: u64,
    pub total_exits: u64,
    pub is_overloaded: bool,
    pub overload_events: u64,
    pub event_count: usize,
}

impl Trip {
    pub fn new(device_id: &str, max_capacity: u32) -> Self {
        Self {
            trip_id: random_id("trip"),
            device_id: device_id.to_string(),
            status: TripStatus::NotStarted,
            start_time: None,
            end_time: None,
            current_passenger_count: 0,
            max_passenger_count: 0,
            total_entries: 0,
            total_exits: 0,
            max_capacity,
            overload_events: 0,
            is_overloaded: false,
            events: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.trip_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn status(&self) -> TripStatus {
        self.status
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn current_passenger_count(&self) -> u32 {
        self.current_passenger_count
    }

    pub fn max_passenger_count(&self) -> u32 {
        self.max_passenger_count
    }

    pub fn max_capacity(&self) -> u32 {
        self.max_capacity
    }

    pub fn is_overloaded(&self) -> bool {
        self.is_overloaded
    }

    pub fn overload_events(&self) -> u64 {
        self.overload_events
    }

    pub fn total_entries(&self) -> u64 {
        self.total_entries
    }

    pub fn total_exits(&self) -> u64 {
        self.total_exits
    }

    pub fn events(&self) -> &[TripEvent] {
        &self.events
    }

    fn ensure_open(&self, action: &str) -> Result<()> {
        if self.status.is_terminal() {
            return Err(anyhow!(
                "cannot {} trip {}: trip is {}",
                action,
                self.trip_id,
                self.status
            ));
        }
        Ok(())
    }

    fn push_event(
        &mut self,
        event_type: TripEventType,
        metadata: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> TripEvent {
        let event = TripEvent {
            event_id: random_id("evt"),
            trip_id: self.trip_id.clone(),
            event_type,
            timestamp: now,
            passenger_count: self.current_passenger_count,
            metadata,
        };
        self.events.push(event.clone());
        event
    }

    /// Explicit start: `not_started -> active`. Starting an active trip is a no-op.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.ensure_open("start")?;
        match self.status {
            TripStatus::NotStarted => {
                self.status = TripStatus::Active;
                self.start_time = Some(now);
                self.push_event(TripEventType::TripStarted, Map::new(), now);
                log::info!("trip {} started on {}", self.trip_id, self.device_id);
                Ok(())
            }
            TripStatus::Active => Ok(()),
            other => Err(anyhow!(
                "cannot start trip {} from {}; resume it instead",
                self.trip_id,
                other
            )),
        }
    }

    fn activate_if_needed(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status == TripStatus::NotStarted {
            self.start(now)?;
        }
        Ok(())
    }

    fn apply_count(&mut self, count: i64) {
        let count = if count < 0 {
            log::warn!(
                "trip {}: negative passenger count {} clamped to 0",
                self.trip_id,
                count
            );
            0
        } else {
            u32::try_from(count).unwrap_or(u32::MAX)
        };
        self.current_passenger_count = count;
        self.max_passenger_count = self.max_passenger_count.max(count);
    }

    fn check_overload(&mut self, now: DateTime<Utc>) {
        let count = self.current_passenger_count;
        if count > self.max_capacity {
            if !self.is_overloaded {
                self.is_overloaded = true;
                self.overload_events += 1;
                log::warn!(
                    "trip {} overloaded: {} passengers, capacity {}",
                    self.trip_id,
                    count,
                    self.max_capacity
                );
                let mut metadata = Map::new();
                metadata.insert("passenger_count".into(), json!(count));
                metadata.insert("max_capacity".into(), json!(self.max_capacity));
                self.push_event(TripEventType::OverloadDetected, metadata, now);
            }
        } else {
            self.is_overloaded = false;
        }
    }

    /// Set the count directly (fusion-driven or external override).
    ///
    /// Negative counts clamp to zero. The first update activates a not-started trip.
    /// Only the rising edge of an overload is logged as an event.
    pub fn update_passenger_count(&mut self, count: i64, now: DateTime<Utc>) -> Result<()> {
        self.ensure_open("update passenger count of")?;
        self.activate_if_needed(now)?;
        self.apply_count(count);
        self.check_overload(now);
        Ok(())
    }

    /// Apply one accepted entry (+1) or exit (-1, floored at zero).
    pub fn record_crossing(
        &mut self,
        kind: CrossingKind,
        metadata: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<TripEvent> {
        self.ensure_open("record crossing on")?;
        self.activate_if_needed(now)?;
        let current = i64::from(self.current_passenger_count);
        let event_type = match kind {
            CrossingKind::Entry => {
                self.total_entries += 1;
                self.apply_count(current + 1);
                TripEventType::PassengerEntry
            }
            CrossingKind::Exit => {
                self.total_exits += 1;
                self.apply_count(current - 1);
                TripEventType::PassengerExit
            }
        };
        let event = self.push_event(event_type, metadata, now);
        self.check_overload(now);
        Ok(event)
    }

    pub fn add_event(
        &mut self,
        event_type: TripEventType,
        metadata: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<TripEvent> {
        self.ensure_open("add event to")?;
        Ok(self.push_event(event_type, metadata, now))
    }

    /// Complete the trip. Returns `false` (and changes nothing) if already closed.
    pub fn end(&mut self, now: DateTime<Utc>) -> Result<bool> {
        if self.status.is_terminal() {
            log::info!("trip {} already {}; end ignored", self.trip_id, self.status);
            return Ok(false);
        }
        self.status = TripStatus::Completed;
        self.end_time = Some(now);
        self.push_event(TripEventType::TripStopped, Map::new(), now);
        log::info!(
            "trip {} completed: {} entries, {} exits, {} overload events",
            self.trip_id,
            self.total_entries,
            self.total_exits,
            self.overload_events
        );
        Ok(true)
    }

    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != TripStatus::Active {
            return Err(anyhow!(
                "cannot pause trip {}: trip is {}",
                self.trip_id,
                self.status
            ));
        }
        self.status = TripStatus::Paused;
        self.push_event(TripEventType::TripPaused, Map::new(), now);
        Ok(())
    }

    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != TripStatus::Paused {
            return Err(anyhow!(
                "cannot resume trip {}: trip is {}",
                self.trip_id,
                self.status
            ));
        }
        self.status = TripStatus::Active;
        self.push_event(TripEventType::TripResumed, Map::new(), now);
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.ensure_open("cancel")?;
        self.status = TripStatus::Cancelled;
        self.end_time = Some(now);
        self.push_event(TripEventType::TripCancelled, Map::new(), now);
        log::info!("trip {} cancelled", self.trip_id);
        Ok(())
    }

    pub fn mark_error(&mut self, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.ensure_open("fail")?;
        self.status = TripStatus::Error;
        self.end_time = Some(now);
        let mut metadata = Map::new();
        metadata.insert("reason".into(), json!(reason));
        self.push_event(TripEventType::SystemError, metadata, now);
        log::error!("trip {} failed: {}", self.trip_id, reason);
        Ok(())
    }

    /// `(end_time or now) - start_time`; `None` before the trip starts.
    pub fn duration(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        let start = self.start_time?;
        Some(self.end_time.unwrap_or(now) - start)
    }

    /// Whether an open, started trip has run longer than `timeout`.
    pub fn is_expired(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        if !matches!(self.status, TripStatus::Active | TripStatus::Paused) {
            return false;
        }
        self.duration(now)
            .and_then(|d| d.to_std().ok())
            .is_some_and(|d| d > timeout)
    }

    /// Zero the live count without logging a count event.
    fn clear_count(&mut self) {
        if !self.status.is_terminal() {
            self.current_passenger_count = 0;
            self.is_overloaded = false;
        }
    }

    pub fn summary(&self, now: DateTime<Utc>) -> TripSummary {
        TripSummary {
            trip_id: self.trip_id.clone(),
            device_id: self.device_id.clone(),
            status: self.status,
            start_time: self.start_time,
            end_time: self.end_time,
            duration_seconds: self.duration(now).map(|d| d.num_seconds()),
            current_passenger_count: self.current_passenger_count,
            max_passenger_count: self.max_passenger_count,
            max_capacity: self.max_capacity,
            total_entries: self.total_entries,
            total_exits: self.total_exits,
            is_overloaded: self.is_overloaded,
            overload_events: self.overload_events,
            event_count: self.events.len(),
        }
    }

    /// Most recent `limit` events, oldest first.
    pub fn recent_events(&self, limit: usize) -> Vec<TripEvent> {
        let skip = self.events.len().saturating_sub(limit);
        self.events[skip..].to_vec()
    }
}

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

/// Read-only snapshot of the counter's aggregate statistics.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CounterStatistics {
    pub total_entries: u64,
    pub total_exits: u64,
    pub current_count: u32,
    pub overload_events: u64,
    pub processing_fps: f64,
    pub last_activity_time: Option<DateTime<Utc>>,
    pub prevented_double_counts: u64,
    pub temporary_exits_handled: u64,
    pub unique_passengers_seen: u64,
    pub unvalidated_events: u64,
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub cycles_processed: u64,
    pub cycles_skipped: u64,
}

// ----------------------------------------------------------------------------
// TripLedger
// ----------------------------------------------------------------------------

struct LedgerState {
    trip: Trip,
    stats: CounterStatistics,
}

/// Shared handle to the current trip and counter statistics. Clones share state.
#[derive(Clone)]
pub struct TripLedger {
    inner: Arc<Mutex<LedgerState>>,
}

impl TripLedger {
    pub fn new(device_id: &str, max_capacity: u32) -> Self {
        Self::from_trip(Trip::new(device_id, max_capacity))
    }

    pub fn from_trip(trip: Trip) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LedgerState {
                trip,
                stats: CounterStatistics::default(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn start(&self) -> Result<()> {
        self.state().trip.start(Utc::now())
    }

    pub fn update_passenger_count(&self, count: i64) -> Result<()> {
        let mut state = self.state();
        let before = state.trip.overload_events();
        state.trip.update_passenger_count(count, Utc::now())?;
        let raised = state.trip.overload_events() - before;
        state.stats.overload_events += raised;
        Ok(())
    }

    pub fn add_event(
        &self,
        event_type: TripEventType,
        metadata: Map<String, Value>,
    ) -> Result<TripEvent> {
        self.state().trip.add_event(event_type, metadata, Utc::now())
    }

    /// Apply an accepted crossing to the authoritative count and statistics.
    pub fn record_crossing(
        &self,
        kind: CrossingKind,
        metadata: Map<String, Value>,
    ) -> Result<TripEvent> {
        self.record_crossing_at(kind, metadata, Utc::now())
    }

    pub fn record_crossing_at(
        &self,
        kind: CrossingKind,
        metadata: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<TripEvent> {
        let mut state = self.state();
        let before = state.trip.overload_events();
        if kind == CrossingKind::Exit && state.trip.current_passenger_count() == 0 {
            log::warn!("exit recorded with zero passengers aboard; count stays at 0");
        }
        let event = state.trip.record_crossing(kind, metadata, now)?;
        let raised = state.trip.overload_events() - before;
        let stats = &mut state.stats;
        match kind {
            CrossingKind::Entry => stats.total_entries += 1,
            CrossingKind::Exit => stats.total_exits += 1,
        }
        stats.overload_events += raised;
        stats.last_activity_time = Some(now);
        Ok(event)
    }

    pub fn end_trip(&self) -> Result<bool> {
        self.state().trip.end(Utc::now())
    }

    pub fn pause(&self) -> Result<()> {
        self.state().trip.pause(Utc::now())
    }

    pub fn resume(&self) -> Result<()> {
        self.state().trip.resume(Utc::now())
    }

    pub fn cancel(&self) -> Result<()> {
        self.state().trip.cancel(Utc::now())
    }

    pub fn mark_error(&self, reason: &str) -> Result<()> {
        self.state().trip.mark_error(reason, Utc::now())
    }

    /// End the trip if it has been open longer than `timeout`. Returns true if ended.
    pub fn end_if_expired(&self, timeout: Duration) -> Result<bool> {
        self.end_if_expired_at(timeout, Utc::now())
    }

    pub fn end_if_expired_at(&self, timeout: Duration, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state();
        if !state.trip.is_expired(timeout, now) {
            return Ok(false);
        }
        log::warn!(
            "trip {} exceeded {} minutes; ending",
            state.trip.id(),
            timeout.as_secs() / 60
        );
        state.trip.end(now)
    }

    /// Replace a closed trip with a fresh one that starts with `aboard` passengers.
    /// Returns the closed trip.
    pub fn begin_new_trip(&self, aboard: u32) -> Result<Trip> {
        self.begin_new_trip_at(aboard, Utc::now())
    }

    pub fn begin_new_trip_at(&self, aboard: u32, now: DateTime<Utc>) -> Result<Trip> {
        let mut state = self.state();
        if !state.trip.status().is_terminal() {
            return Err(anyhow!(
                "trip {} is still {}; end it before starting a new one",
                state.trip.id(),
                state.trip.status()
            ));
        }
        let mut next = Trip::new(state.trip.device_id(), state.trip.max_capacity());
        if aboard > 0 {
            next.update_passenger_count(i64::from(aboard), now)?;
            state.stats.overload_events += next.overload_events();
        }
        Ok(std::mem::replace(&mut state.trip, next))
    }

    /// Whether the trip still accepts crossings.
    pub fn is_open(&self) -> bool {
        !self.state().trip.status().is_terminal()
    }

    pub fn current_count(&self) -> u32 {
        self.state().trip.current_passenger_count()
    }

    pub fn trip(&self) -> Trip {
        self.state().trip.clone()
    }

    pub fn summary(&self) -> TripSummary {
        self.state().trip.summary(Utc::now())
    }

    pub fn recent_events(&self, limit: usize) -> Vec<TripEvent> {
        self.state().trip.recent_events(limit)
    }

    pub fn statistics(&self) -> CounterStatistics {
        let state = self.state();
        let mut stats = state.stats.clone();
        stats.current_count = state.trip.current_passenger_count();
        stats
    }

    // Writer-side bookkeeping used by the processing loop.

    pub fn publish_fusion_stats(&self, fusion: FusionStats) {
        let mut state = self.state();
        let stats = &mut state.stats;
        stats.prevented_double_counts = fusion.prevented_double_counts;
        stats.temporary_exits_handled = fusion.temporary_exits_handled;
        stats.unique_passengers_seen = fusion.unique_passengers_seen;
        stats.unvalidated_events = fusion.unvalidated_events;
    }

    pub fn record_cycle(&self, processed: bool) {
        let mut state = self.state();
        let stats = &mut state.stats;
        if processed {
            stats.cycles_processed += 1;
        } else {
            stats.cycles_skipped += 1;
        }
    }

    pub fn set_processing_fps(&self, fps: f64) {
        self.state().stats.processing_fps = fps;
    }

    pub fn set_frame_counters(&self, captured: u64, dropped: u64) {
        let mut state = self.state();
        let stats = &mut state.stats;
        stats.frames_captured = captured;
        stats.frames_dropped = dropped;
    }

    /// Zero counts and totals. Trip history is left intact.
    pub fn reset_counts(&self) {
        let mut state = self.state();
        state.trip.clear_count();
        state.stats = CounterStatistics::default();
        log::info!("counter statistics reset");
    }

    /// Replace trip and statistics with restored state.
    pub fn restore(&self, trip: Trip, stats: CounterStatistics) {
        let mut state = self.state();
        state.trip = trip;
        state.stats = stats;
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn count_events(trip: &Trip, event_type: TripEventType) -> usize {
        trip.events()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    #[test]
    fn overload_is_edge_triggered() {
        let mut trip = Trip::new("taxi_dev_001", 14);
        let now = Utc::now();
        for count in [5, 10, 15, 10, 16, 10] {
            trip.update_passenger_count(count, now).unwrap();
        }
        assert_eq!(trip.overload_events(), 2);
        assert_eq!(count_events(&trip, TripEventType::OverloadDetected), 2);
        assert!(!trip.is_overloaded());
        assert_eq!(trip.max_passenger_count(), 16);
    }

    #[test]
    fn boarding_scenario_overloads_once() {
        let mut trip = Trip::new("taxi_dev_001", 14);
        let now = Utc::now();
        trip.start(now).unwrap();
        for count in [2, 5, 8, 12, 15, 13, 10, 7, 4, 1, 0] {
            trip.update_passenger_count(count, now).unwrap();
        }
        let overloads: Vec<_> = trip
            .events()
            .iter()
            .filter(|e| e.event_type == TripEventType::OverloadDetected)
            .collect();
        assert_eq!(overloads.len(), 1);
        assert_eq!(overloads[0].passenger_count, 15);
        assert!(!trip.is_overloaded());
    }

    #[test]
    fn sustained_overload_logs_once() {
        let mut trip = Trip::new("taxi_dev_001", 2);
        let now = Utc::now();
        for count in [3, 4, 5, 4] {
            trip.update_passenger_count(count, now).unwrap();
        }
        assert_eq!(trip.overload_events(), 1);
        assert!(trip.is_overloaded());
    }

    #[test]
    fn negative_count_clamps_to_zero() {
        let mut trip = Trip::new("taxi_dev_001", 14);
        trip.update_passenger_count(-3, Utc::now()).unwrap();
        assert_eq!(trip.current_passenger_count(), 0);
    }

    #[test]
    fn first_update_activates_trip() {
        let mut trip = Trip::new("taxi_dev_001", 14);
        assert!(trip.duration(Utc::now()).is_none());
        trip.update_passenger_count(1, Utc::now()).unwrap();
        assert_eq!(trip.status(), TripStatus::Active);
        assert!(trip.start_time().is_some());
        assert_eq!(count_events(&trip, TripEventType::TripStarted), 1);
    }

    #[test]
    fn end_is_idempotent() {
        let mut trip = Trip::new("taxi_dev_001", 14);
        let t0 = Utc::now();
        trip.start(t0).unwrap();
        assert!(trip.end(t0 + ChronoDuration::seconds(5)).unwrap());
        let ended_at = trip.end_time();
        assert!(!trip.end(t0 + ChronoDuration::seconds(9)).unwrap());
        assert_eq!(trip.end_time(), ended_at);
        assert_eq!(count_events(&trip, TripEventType::TripStopped), 1);
        assert_eq!(trip.duration(t0 + ChronoDuration::hours(1)).unwrap().num_seconds(), 5);
    }

    #[test]
    fn closed_trip_rejects_mutation() {
        let mut trip = Trip::new("taxi_dev_001", 14);
        let now = Utc::now();
        trip.update_passenger_count(3, now).unwrap();
        trip.end(now).unwrap();
        let events = trip.events().len();

        assert!(trip.update_passenger_count(4, now).is_err());
        assert!(trip.add_event(TripEventType::SystemError, Map::new(), now).is_err());
        assert!(trip
            .record_crossing(CrossingKind::Entry, Map::new(), now)
            .is_err());
        assert!(trip.cancel(now).is_err());
        assert_eq!(trip.current_passenger_count(), 3);
        assert_eq!(trip.events().len(), events);
    }

    #[test]
    fn crossings_never_go_negative() {
        let mut trip = Trip::new("taxi_dev_001", 14);
        let now = Utc::now();
        trip.record_crossing(CrossingKind::Exit, Map::new(), now).unwrap();
        assert_eq!(trip.current_passenger_count(), 0);
        trip.record_crossing(CrossingKind::Entry, Map::new(), now).unwrap();
        trip.record_crossing(CrossingKind::Exit, Map::new(), now).unwrap();
        trip.record_crossing(CrossingKind::Exit, Map::new(), now).unwrap();
        assert_eq!(trip.current_passenger_count(), 0);
        assert_eq!(trip.total_entries(), 1);
        assert_eq!(trip.total_exits(), 3);
    }

    #[test]
    fn entry_event_carries_new_count() {
        let mut trip = Trip::new("taxi_dev_001", 14);
        let event = trip
            .record_crossing(CrossingKind::Entry, Map::new(), Utc::now())
            .unwrap();
        assert_eq!(event.event_type, TripEventType::PassengerEntry);
        assert_eq!(event.passenger_count, 1);
        assert!(event.event_id.starts_with("evt_"));
        assert_eq!(event.trip_id, trip.id());
    }

    #[test]
    fn pause_and_resume() {
        let mut trip = Trip::new("taxi_dev_001", 14);
        let now = Utc::now();
        assert!(trip.pause(now).is_err());
        trip.start(now).unwrap();
        trip.pause(now).unwrap();
        assert_eq!(trip.status(), TripStatus::Paused);
        // Counting continues while paused.
        trip.update_passenger_count(2, now).unwrap();
        assert_eq!(trip.status(), TripStatus::Paused);
        trip.resume(now).unwrap();
        assert_eq!(trip.status(), TripStatus::Active);
        assert!(trip.resume(now).is_err());
    }

    #[test]
    fn mark_error_is_terminal() {
        let mut trip = Trip::new("taxi_dev_001", 14);
        let now = Utc::now();
        trip.start(now).unwrap();
        trip.mark_error("camera lost", now).unwrap();
        assert_eq!(trip.status(), TripStatus::Error);
        let last = trip.events().last().unwrap();
        assert_eq!(last.event_type, TripEventType::SystemError);
        assert_eq!(last.metadata["reason"], "camera lost");
        assert!(!trip.end(now).unwrap());
    }

    #[test]
    fn recent_events_keeps_tail() {
        let mut trip = Trip::new("taxi_dev_001", 14);
        let now = Utc::now();
        for _ in 0..5 {
            trip.record_crossing(CrossingKind::Entry, Map::new(), now).unwrap();
        }
        let recent = trip.recent_events(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].passenger_count, 5);
        assert_eq!(trip.recent_events(100).len(), trip.events().len());
    }

    #[test]
    fn ledger_clones_share_state() {
        let ledger = TripLedger::new("taxi_dev_001", 14);
        let reader = ledger.clone();
        ledger.record_crossing(CrossingKind::Entry, Map::new()).unwrap();
        ledger.record_crossing(CrossingKind::Entry, Map::new()).unwrap();
        ledger.record_crossing(CrossingKind::Exit, Map::new()).unwrap();

        let stats = reader.statistics();
        assert_eq!(reader.current_count(), 1);
        assert_eq!(stats.current_count, 1);
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.total_exits, 1);
        assert!(stats.last_activity_time.is_some());
    }

    #[test]
    fn ledger_counts_overload_edges() {
        let ledger = TripLedger::new("taxi_dev_001", 14);
        for count in [5, 10, 15, 10, 16, 10] {
            ledger.update_passenger_count(count).unwrap();
        }
        assert_eq!(ledger.statistics().overload_events, 2);
    }

    #[test]
    fn ledger_expires_long_trips() {
        let ledger = TripLedger::new("taxi_dev_001", 14);
        ledger.start().unwrap();
        let timeout = Duration::from_secs(120 * 60);
        assert!(!ledger.end_if_expired_at(timeout, Utc::now()).unwrap());
        let later = Utc::now() + ChronoDuration::minutes(121);
        assert!(ledger.end_if_expired_at(timeout, later).unwrap());
        assert_eq!(ledger.trip().status(), TripStatus::Completed);
    }

    #[test]
    fn begin_new_trip_requires_closed_trip() {
        let ledger = TripLedger::new("taxi_dev_001", 14);
        ledger.update_passenger_count(4).unwrap();
        assert!(ledger.is_open());
        assert!(ledger.begin_new_trip(0).is_err());
        ledger.end_trip().unwrap();
        assert!(!ledger.is_open());
        let closed = ledger.begin_new_trip(0).unwrap();
        assert_eq!(closed.status(), TripStatus::Completed);
        assert_eq!(ledger.trip().status(), TripStatus::NotStarted);
        assert_ne!(ledger.trip().id(), closed.id());
        assert_eq!(ledger.current_count(), 0);
        assert!(ledger.is_open());
    }

    #[test]
    fn new_trip_carries_passengers_still_aboard() {
        let ledger = TripLedger::new("taxi_dev_001", 14);
        ledger.update_passenger_count(3).unwrap();
        ledger.end_trip().unwrap();

        ledger.begin_new_trip(3).unwrap();
        let trip = ledger.trip();
        assert_eq!(trip.status(), TripStatus::Active);
        assert_eq!(trip.current_passenger_count(), 3);
        assert_eq!(trip.total_entries(), 0);

        ledger.record_crossing(CrossingKind::Exit, Map::new()).unwrap();
        assert_eq!(ledger.current_count(), 2);
    }

    #[test]
    fn reset_clears_counts_but_keeps_history() {
        let ledger = TripLedger::new("taxi_dev_001", 14);
        ledger.record_crossing(CrossingKind::Entry, Map::new()).unwrap();
        let events = ledger.trip().events().len();
        ledger.reset_counts();
        assert_eq!(ledger.current_count(), 0);
        assert_eq!(ledger.statistics().total_entries, 0);
        assert_eq!(ledger.trip().events().len(), events);
    }
}
