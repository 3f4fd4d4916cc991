use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::domain::{MessageId, RoomId, SubscriptionStatus};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RealtimeSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionEventKind {
    Tracked,
    DuplicateTracking,
    StatusChanged,
    Untracked,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionEvent {
    pub at: DateTime<Utc>,
    #[serde(skip)]
    seen: Instant,
    pub room_id: RoomId,
    pub kind: SubscriptionEventKind,
    pub status: Option<SubscriptionStatus>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageEventKind {
    Received,
    Duplicate,
    Updated,
    Rejected,
    Sent,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageEvent {
    pub at: DateTime<Utc>,
    #[serde(skip)]
    seen: Instant,
    pub room_id: RoomId,
    pub message_id: Option<MessageId>,
    pub kind: MessageEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub severity: Severity,
    pub room_id: Option<RoomId>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsSummary {
    pub tracked_subscriptions: usize,
    pub subscription_events: usize,
    pub message_events: usize,
    pub issues: Vec<Issue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsReport {
    pub generated_at: DateTime<Utc>,
    pub subscriptions: Vec<TrackedSubscriptionReport>,
    pub recent_subscription_events: Vec<SubscriptionEvent>,
    pub recent_message_events: Vec<MessageEvent>,
    pub summary: DiagnosticsSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackedSubscriptionReport {
    pub room_id: RoomId,
    pub channel_name: String,
    pub status: SubscriptionStatus,
    pub error: Option<String>,
}

struct TrackedSubscription {
    channel_name: String,
    status: SubscriptionStatus,
    error: Option<String>,
    tracked_at: Instant,
    last_message: Option<Instant>,
}

#[derive(Default)]
struct DiagnosticsState {
    subscription_events: VecDeque<SubscriptionEvent>,
    message_events: VecDeque<MessageEvent>,
    tracked: HashMap<RoomId, TrackedSubscription>,
}

/// Ring buffers of lifecycle events plus advisory health checks. Observes the
/// realtime layer and never feeds back into it.
pub struct Diagnostics {
    subscription_capacity: usize,
    message_capacity: usize,
    max_healthy_subscriptions: usize,
    silence_warning: Duration,
    inner: Mutex<DiagnosticsState>,
}

impl Diagnostics {
    pub fn new(settings: &RealtimeSettings) -> Self {
        Self {
            subscription_capacity: settings.subscription_event_capacity,
            message_capacity: settings.message_event_capacity,
            max_healthy_subscriptions: settings.max_healthy_subscriptions,
            silence_warning: settings.message_silence_warning,
            inner: Mutex::new(DiagnosticsState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, DiagnosticsState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn track_subscription(&self, room_id: &RoomId, channel_name: &str, status: SubscriptionStatus) {
        let mut state = self.state();
        let now = Instant::now();
        if state.tracked.contains_key(room_id) {
            warn!(room_id = %room_id, "diagnostics: room tracked twice");
            self.push_subscription_event(
                &mut state,
                room_id,
                SubscriptionEventKind::DuplicateTracking,
                Some(status),
                Some(channel_name.to_string()),
            );
        }
        state.tracked.insert(
            room_id.clone(),
            TrackedSubscription {
                channel_name: channel_name.to_string(),
                status,
                error: None,
                tracked_at: now,
                last_message: None,
            },
        );
        self.push_subscription_event(
            &mut state,
            room_id,
            SubscriptionEventKind::Tracked,
            Some(status),
            Some(channel_name.to_string()),
        );
    }

    pub fn subscription_status_changed(
        &self,
        room_id: &RoomId,
        status: SubscriptionStatus,
        error: Option<String>,
    ) {
        let mut state = self.state();
        if let Some(tracked) = state.tracked.get_mut(room_id) {
            tracked.status = status;
            tracked.error = error.clone();
        }
        self.push_subscription_event(
            &mut state,
            room_id,
            SubscriptionEventKind::StatusChanged,
            Some(status),
            error,
        );
    }

    pub fn untrack_subscription(&self, room_id: &RoomId) {
        let mut state = self.state();
        if state.tracked.remove(room_id).is_some() {
            self.push_subscription_event(
                &mut state,
                room_id,
                SubscriptionEventKind::Untracked,
                None,
                None,
            );
        }
    }

    pub fn track_message(&self, room_id: &RoomId, message_id: Option<&MessageId>, kind: MessageEventKind) {
        let mut state = self.state();
        let now = Instant::now();
        if let Some(tracked) = state.tracked.get_mut(room_id) {
            tracked.last_message = Some(now);
        }
        state.message_events.push_back(MessageEvent {
            at: Utc::now(),
            seen: now,
            room_id: room_id.clone(),
            message_id: message_id.cloned(),
            kind,
        });
        while state.message_events.len() > self.message_capacity {
            state.message_events.pop_front();
        }
    }

    fn push_subscription_event(
        &self,
        state: &mut DiagnosticsState,
        room_id: &RoomId,
        kind: SubscriptionEventKind,
        status: Option<SubscriptionStatus>,
        detail: Option<String>,
    ) {
        debug!(room_id = %room_id, ?kind, ?status, "diagnostics: subscription event");
        state.subscription_events.push_back(SubscriptionEvent {
            at: Utc::now(),
            seen: Instant::now(),
            room_id: room_id.clone(),
            kind,
            status,
            detail,
        });
        while state.subscription_events.len() > self.subscription_capacity {
            state.subscription_events.pop_front();
        }
    }

    pub fn check_for_issues(&self) -> Vec<Issue> {
        let state = self.state();
        self.issues(&state, Instant::now())
    }

    fn issues(&self, state: &DiagnosticsState, now: Instant) -> Vec<Issue> {
        let mut issues = Vec::new();
        if state.tracked.len() > self.max_healthy_subscriptions {
            issues.push(Issue {
                severity: Severity::Warning,
                room_id: None,
                message: format!(
                    "{} subscriptions tracked; more than {} usually means leaked channels",
                    state.tracked.len(),
                    self.max_healthy_subscriptions
                ),
            });
        }

        let mut rooms: Vec<_> = state.tracked.iter().collect();
        rooms.sort_by(|a, b| a.0.cmp(b.0));
        for (room_id, tracked) in rooms {
            if tracked.status.is_failure() {
                issues.push(Issue {
                    severity: Severity::Error,
                    room_id: Some(room_id.clone()),
                    message: format!(
                        "subscription {} is in {}{}",
                        tracked.channel_name,
                        tracked.status,
                        tracked
                            .error
                            .as_deref()
                            .map(|err| format!(": {err}"))
                            .unwrap_or_default()
                    ),
                });
            }
            let last_seen = tracked.last_message.unwrap_or(tracked.tracked_at);
            if now.saturating_duration_since(last_seen) > self.silence_warning {
                issues.push(Issue {
                    severity: Severity::Warning,
                    room_id: Some(room_id.clone()),
                    message: format!(
                        "no message events for {}s on {}",
                        now.saturating_duration_since(last_seen).as_secs(),
                        tracked.channel_name
                    ),
                });
            }
        }
        issues
    }

    pub fn report(&self) -> DiagnosticsReport {
        let state = self.state();
        let now = Instant::now();
        let recent = |seen: Instant| now.saturating_duration_since(seen) <= self.silence_warning;

        let mut subscriptions: Vec<_> = state
            .tracked
            .iter()
            .map(|(room_id, tracked)| TrackedSubscriptionReport {
                room_id: room_id.clone(),
                channel_name: tracked.channel_name.clone(),
                status: tracked.status,
                error: tracked.error.clone(),
            })
            .collect();
        subscriptions.sort_by(|a, b| a.room_id.cmp(&b.room_id));

        DiagnosticsReport {
            generated_at: Utc::now(),
            subscriptions,
            recent_subscription_events: state
                .subscription_events
                .iter()
                .filter(|event| recent(event.seen))
                .cloned()
                .collect(),
            recent_message_events: state
                .message_events
                .iter()
                .filter(|event| recent(event.seen))
                .cloned()
                .collect(),
            summary: DiagnosticsSummary {
                tracked_subscriptions: state.tracked.len(),
                subscription_events: state.subscription_events.len(),
                message_events: state.message_events.len(),
                issues: self.issues(&state, now),
            },
        }
    }

    pub fn reset(&self) {
        let mut state = self.state();
        state.subscription_events.clear();
        state.message_events.clear();
        state.tracked.clear();
        debug!("diagnostics: reset");
    }
}

#[cfg(test)]
#[path = "tests/diagnostics_tests.rs"]
mod tests;
