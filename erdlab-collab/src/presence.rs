//! Presence aggregation: who else is in the diagram, and what they are
//! doing.
//!
//! The server periodically publishes a full roster on the presence topic;
//! between rosters, presence-family events patch individual collaborators.
//! A roster is authoritative: the aggregator replaces its state wholesale,
//! so a user absent from the first roster after their departure disappears
//! without any explicit removal event. Patches only ever touch users the
//! aggregator already knows about; a cursor event from an unknown user is
//! ignored until a roster introduces them.
//!
//! The aggregator is synchronous. The client owns it behind a mutex and
//! feeds it from the connection's event loop; consumers observe the
//! roster through a `watch` channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::event::{
    CursorMovedPayload, ElementLockPayload, EventKind, SelectionChangedPayload, WireEvent,
};

/// One collaborator's live state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresence {
    pub user_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_element_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_element_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    pub last_seen: DateTime<Utc>,
}

impl UserPresence {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            email: None,
            name: None,
            cursor_x: None,
            cursor_y: None,
            selected_element_id: None,
            locked_element_id: None,
            color: None,
            last_seen: Utc::now(),
        }
    }
}

/// Full roster for one diagram, as published on the presence topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceSnapshot {
    pub diagram_id: Uuid,
    pub users: Vec<UserPresence>,
}

/// Aggregates rosters and presence events into one observable roster.
pub struct PresenceAggregator {
    local_user_id: Uuid,
    diagram: Option<Uuid>,
    users: HashMap<Uuid, UserPresence>,
    roster_tx: Arc<watch::Sender<Vec<UserPresence>>>,
}

impl PresenceAggregator {
    pub fn new(local_user_id: Uuid) -> Self {
        let (roster_tx, _) = watch::channel(Vec::new());
        Self {
            local_user_id,
            diagram: None,
            users: HashMap::new(),
            roster_tx: Arc::new(roster_tx),
        }
    }

    /// Observe the roster. The value is sorted by user id so successive
    /// publishes with the same membership compare equal.
    pub fn watch_roster(&self) -> watch::Receiver<Vec<UserPresence>> {
        self.roster_tx.subscribe()
    }

    /// The diagram whose roster is currently tracked.
    pub fn diagram(&self) -> Option<Uuid> {
        self.diagram
    }

    /// Start tracking a diagram. State from any previous diagram is purged.
    pub fn set_joined(&mut self, diagram_id: Uuid) {
        if self.diagram != Some(diagram_id) {
            self.diagram = Some(diagram_id);
            self.users.clear();
            self.publish();
        }
    }

    /// Stop tracking; the roster empties immediately.
    pub fn leave(&mut self) {
        self.diagram = None;
        self.users.clear();
        self.publish();
    }

    /// Apply an authoritative roster. Rosters for other diagrams (stale
    /// deliveries after a switch) are ignored.
    pub fn apply_snapshot(&mut self, snapshot: PresenceSnapshot) {
        if self.diagram != Some(snapshot.diagram_id) {
            log::debug!(
                "ignoring roster for diagram {} (tracking {:?})",
                snapshot.diagram_id,
                self.diagram
            );
            return;
        }
        self.users.clear();
        for user in snapshot.users {
            if user.user_id == self.local_user_id {
                continue;
            }
            self.users.insert(user.user_id, user);
        }
        self.publish();
    }

    /// Patch the roster from a presence-family event. Non-presence kinds
    /// and events from the local user are ignored.
    pub fn apply_event(&mut self, event: &WireEvent) {
        if !event.kind.is_presence() || event.user_id == self.local_user_id {
            return;
        }
        if self.diagram != Some(event.diagram_id) {
            return;
        }
        match event.kind {
            EventKind::UserJoined => {
                let entry = self
                    .users
                    .entry(event.user_id)
                    .or_insert_with(|| UserPresence::new(event.user_id));
                entry.email = event.user_email.clone().or(entry.email.take());
                entry.last_seen = event.timestamp;
                self.publish();
            }
            EventKind::UserLeft => {
                if self.users.remove(&event.user_id).is_some() {
                    self.publish();
                }
            }
            EventKind::CursorMoved => {
                let payload: CursorMovedPayload = match event.payload_as() {
                    Ok(p) => p,
                    Err(e) => {
                        log::warn!("dropping cursor event: {e}");
                        return;
                    }
                };
                let Some(user) = self.users.get_mut(&event.user_id) else {
                    log::debug!("cursor event from unknown user {}", event.user_id);
                    return;
                };
                user.cursor_x = Some(payload.x);
                user.cursor_y = Some(payload.y);
                if payload.user_display_name.is_some() {
                    user.name = payload.user_display_name;
                }
                if payload.cursor_color.is_some() {
                    user.color = payload.cursor_color;
                }
                user.last_seen = event.timestamp;
                self.publish();
            }
            EventKind::SelectionChanged => {
                let payload: SelectionChangedPayload = match event.payload_as() {
                    Ok(p) => p,
                    Err(e) => {
                        log::warn!("dropping selection event: {e}");
                        return;
                    }
                };
                let Some(user) = self.users.get_mut(&event.user_id) else {
                    return;
                };
                user.selected_element_id = payload.element_id;
                user.last_seen = event.timestamp;
                self.publish();
            }
            EventKind::ElementLocked => {
                let payload: ElementLockPayload = match event.payload_as() {
                    Ok(p) => p,
                    Err(e) => {
                        log::warn!("dropping lock event: {e}");
                        return;
                    }
                };
                let Some(user) = self.users.get_mut(&event.user_id) else {
                    return;
                };
                user.locked_element_id = Some(payload.element_id);
                user.last_seen = event.timestamp;
                self.publish();
            }
            EventKind::ElementUnlocked => {
                let Some(user) = self.users.get_mut(&event.user_id) else {
                    return;
                };
                user.locked_element_id = None;
                user.last_seen = event.timestamp;
                self.publish();
            }
            _ => {}
        }
    }

    /// Current roster, sorted by user id.
    pub fn roster(&self) -> Vec<UserPresence> {
        let mut users: Vec<UserPresence> = self.users.values().cloned().collect();
        users.sort_by_key(|u| u.user_id);
        users
    }

    fn publish(&self) {
        let _ = self.roster_tx.send(self.roster());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(diagram_id: Uuid, user_ids: &[Uuid]) -> PresenceSnapshot {
        PresenceSnapshot {
            diagram_id,
            users: user_ids.iter().map(|id| UserPresence::new(*id)).collect(),
        }
    }

    fn cursor_event(diagram_id: Uuid, user_id: Uuid, x: f64, y: f64) -> WireEvent {
        WireEvent::new(
            EventKind::CursorMoved,
            diagram_id,
            user_id,
            serde_json::json!({"x": x, "y": y}),
        )
    }

    #[test]
    fn test_snapshot_replaces_wholesale() {
        let me = Uuid::new_v4();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let diagram = Uuid::new_v4();
        let mut agg = PresenceAggregator::new(me);
        agg.set_joined(diagram);

        agg.apply_snapshot(snapshot(diagram, &[a, b]));
        assert_eq!(agg.roster().len(), 2);

        // b left; the next roster simply omits them
        agg.apply_snapshot(snapshot(diagram, &[a, c]));
        let roster = agg.roster();
        assert_eq!(roster.len(), 2);
        assert!(roster.iter().any(|u| u.user_id == c));
        assert!(!roster.iter().any(|u| u.user_id == b));
    }

    #[test]
    fn test_local_user_excluded_from_roster() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let diagram = Uuid::new_v4();
        let mut agg = PresenceAggregator::new(me);
        agg.set_joined(diagram);

        agg.apply_snapshot(snapshot(diagram, &[me, other]));
        let roster = agg.roster();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].user_id, other);
    }

    #[test]
    fn test_roster_for_other_diagram_ignored() {
        let me = Uuid::new_v4();
        let diagram = Uuid::new_v4();
        let mut agg = PresenceAggregator::new(me);
        agg.set_joined(diagram);

        agg.apply_snapshot(snapshot(Uuid::new_v4(), &[Uuid::new_v4()]));
        assert!(agg.roster().is_empty());
    }

    #[test]
    fn test_cursor_patch_for_known_user() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let diagram = Uuid::new_v4();
        let mut agg = PresenceAggregator::new(me);
        agg.set_joined(diagram);
        agg.apply_snapshot(snapshot(diagram, &[other]));

        agg.apply_event(&cursor_event(diagram, other, 120.0, 80.0));
        let roster = agg.roster();
        assert_eq!(roster[0].cursor_x, Some(120.0));
        assert_eq!(roster[0].cursor_y, Some(80.0));
    }

    #[test]
    fn test_cursor_from_unknown_user_ignored() {
        let me = Uuid::new_v4();
        let diagram = Uuid::new_v4();
        let mut agg = PresenceAggregator::new(me);
        agg.set_joined(diagram);

        agg.apply_event(&cursor_event(diagram, Uuid::new_v4(), 1.0, 2.0));
        assert!(agg.roster().is_empty());
    }

    #[test]
    fn test_own_events_ignored() {
        let me = Uuid::new_v4();
        let diagram = Uuid::new_v4();
        let mut agg = PresenceAggregator::new(me);
        agg.set_joined(diagram);

        agg.apply_event(&cursor_event(diagram, me, 1.0, 2.0));
        assert!(agg.roster().is_empty());
    }

    #[test]
    fn test_lock_and_unlock() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let diagram = Uuid::new_v4();
        let element = Uuid::new_v4();
        let mut agg = PresenceAggregator::new(me);
        agg.set_joined(diagram);
        agg.apply_snapshot(snapshot(diagram, &[other]));

        agg.apply_event(&WireEvent::new(
            EventKind::ElementLocked,
            diagram,
            other,
            serde_json::json!({"elementType": "table", "elementId": element}),
        ));
        assert_eq!(agg.roster()[0].locked_element_id, Some(element));

        agg.apply_event(&WireEvent::new(
            EventKind::ElementUnlocked,
            diagram,
            other,
            serde_json::json!({"elementType": "table", "elementId": element}),
        ));
        assert_eq!(agg.roster()[0].locked_element_id, None);
    }

    #[test]
    fn test_leave_purges_and_publishes_empty() {
        let me = Uuid::new_v4();
        let diagram = Uuid::new_v4();
        let mut agg = PresenceAggregator::new(me);
        let mut rx = agg.watch_roster();
        agg.set_joined(diagram);
        agg.apply_snapshot(snapshot(diagram, &[Uuid::new_v4()]));
        assert_eq!(rx.borrow_and_update().len(), 1);

        agg.leave();
        assert!(rx.borrow_and_update().is_empty());
        assert!(agg.diagram().is_none());
    }

    #[test]
    fn test_switching_diagrams_purges_roster() {
        let me = Uuid::new_v4();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let mut agg = PresenceAggregator::new(me);
        agg.set_joined(first);
        agg.apply_snapshot(snapshot(first, &[Uuid::new_v4()]));

        agg.set_joined(second);
        assert!(agg.roster().is_empty());
    }

    #[test]
    fn test_user_joined_then_left_events() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let diagram = Uuid::new_v4();
        let mut agg = PresenceAggregator::new(me);
        agg.set_joined(diagram);

        let mut joined = WireEvent::new(
            EventKind::UserJoined,
            diagram,
            other,
            serde_json::Value::Null,
        );
        joined.user_email = Some("bob@example.com".into());
        agg.apply_event(&joined);
        let roster = agg.roster();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].email.as_deref(), Some("bob@example.com"));

        agg.apply_event(&WireEvent::new(
            EventKind::UserLeft,
            diagram,
            other,
            serde_json::Value::Null,
        ));
        assert!(agg.roster().is_empty());
    }

    #[test]
    fn test_presence_serde_shape() {
        let user = UserPresence::new(Uuid::new_v4());
        let json = serde_json::to_value(&user).unwrap();
        assert!(json.get("userId").is_some());
        assert!(json.get("lastSeen").is_some());
        // unset optionals are omitted
        assert!(json.get("cursorX").is_none());
    }
}
