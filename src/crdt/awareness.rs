//! Awareness replica: ephemeral per-client state (cursors, presence, kernel
//! execution state) replicated independently of document state.
//!
//! The wire format is the y-protocols awareness update: a count followed by
//! `(client_id, clock, json_state)` triples in var-length encoding. A `null`
//! state marks the client as offline. Entries are accepted when their clock is
//! newer than the one we know, or equal with a null state (removal wins).

use crate::ws::protocol::{
    decode_var_string, decode_var_uint, encode_var_string, encode_var_uint, ProtocolError,
};
use serde_json::Value;
use std::collections::HashMap;

pub type AwarenessClientId = u64;

/// A decoded awareness update payload.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessEntry {
    pub client_id: AwarenessClientId,
    pub clock: u64,
    /// `None` encodes an offline client.
    pub state: Option<Value>,
}

impl AwarenessUpdate {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        encode_var_uint(self.entries.len() as u64, &mut out);
        for entry in &self.entries {
            encode_var_uint(entry.client_id, &mut out);
            encode_var_uint(entry.clock, &mut out);
            let json = match &entry.state {
                Some(state) => state.to_string(),
                None => "null".to_string(),
            };
            encode_var_string(&json, &mut out);
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut rest = data;
        let count = decode_var_uint(&mut rest)?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let client_id = decode_var_uint(&mut rest)?;
            let clock = decode_var_uint(&mut rest)?;
            let json = decode_var_string(&mut rest)?;
            let value: Value =
                serde_json::from_str(&json).map_err(|_| ProtocolError::InvalidUtf8)?;
            let state = if value.is_null() { None } else { Some(value) };
            entries.push(AwarenessEntry {
                client_id,
                clock,
                state,
            });
        }
        Ok(Self { entries })
    }
}

/// Where an awareness change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwarenessOrigin {
    /// Mutation of this replica's own state (e.g. by the kernel bridge).
    Local,
    /// Update applied from a connected client.
    Remote,
}

/// Summary of a change applied to the awareness replica.
#[derive(Debug, Clone)]
pub struct AwarenessChange {
    pub added: Vec<AwarenessClientId>,
    pub updated: Vec<AwarenessClientId>,
    pub removed: Vec<AwarenessClientId>,
    pub origin: AwarenessOrigin,
    /// The update payload covering the touched clients, ready to broadcast.
    pub update: AwarenessUpdate,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

type ObserverFn = Box<dyn Fn(&AwarenessChange) + Send>;

/// Handle returned by [`Awareness::observe`]; pass to
/// [`Awareness::unobserve`] to detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AwarenessSubscription(u64);

struct ClientEntry {
    clock: u64,
    state: Option<Value>,
}

/// The server-side awareness replica for one room.
///
/// Owned and mutated exclusively by the room's dispatch task; observers run
/// synchronously inside the mutation.
pub struct Awareness {
    client_id: AwarenessClientId,
    states: HashMap<AwarenessClientId, ClientEntry>,
    observers: Vec<(u64, ObserverFn)>,
    next_observer_id: u64,
}

impl Awareness {
    pub fn new() -> Self {
        // Derive the numeric client id from a fresh UUID, like WS client ids.
        let uuid_bytes = *uuid::Uuid::new_v4().as_bytes();
        let client_id = u64::from_le_bytes([
            uuid_bytes[0],
            uuid_bytes[1],
            uuid_bytes[2],
            uuid_bytes[3],
            uuid_bytes[4],
            uuid_bytes[5],
            uuid_bytes[6],
            uuid_bytes[7],
        ]);

        Self {
            client_id,
            states: HashMap::new(),
            observers: Vec::new(),
            next_observer_id: 0,
        }
    }

    pub fn client_id(&self) -> AwarenessClientId {
        self.client_id
    }

    /// This replica's own state, if set.
    pub fn local_state(&self) -> Option<&Value> {
        self.states.get(&self.client_id).and_then(|e| e.state.as_ref())
    }

    /// Replace this replica's own state and notify observers with a local
    /// origin.
    pub fn set_local_state(&mut self, state: Value) {
        let client_id = self.client_id;
        let entry = self.states.entry(client_id).or_insert(ClientEntry {
            clock: 0,
            state: None,
        });
        entry.clock += 1;
        let was_present = entry.state.is_some();
        let update = AwarenessUpdate {
            entries: vec![AwarenessEntry {
                client_id,
                clock: entry.clock,
                state: Some(state.clone()),
            }],
        };
        entry.state = Some(state);

        let change = AwarenessChange {
            added: if was_present { vec![] } else { vec![client_id] },
            updated: if was_present { vec![client_id] } else { vec![] },
            removed: vec![],
            origin: AwarenessOrigin::Local,
            update,
        };
        self.notify(&change);
    }

    /// Merge one top-level field into this replica's state. Existing fields
    /// are preserved.
    pub fn set_local_state_field(&mut self, key: &str, value: Value) {
        let mut state = self
            .local_state()
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));
        if !state.is_object() {
            state = Value::Object(Default::default());
        }
        if let Some(object) = state.as_object_mut() {
            object.insert(key.to_string(), value);
        }
        self.set_local_state(state);
    }

    /// Read one top-level field of this replica's state.
    pub fn local_state_field(&self, key: &str) -> Option<&Value> {
        self.local_state().and_then(|s| s.get(key))
    }

    /// Mark this replica offline and notify observers.
    pub fn clear_local_state(&mut self) {
        let client_id = self.client_id;
        if let Some(entry) = self.states.get_mut(&client_id) {
            if entry.state.is_none() {
                return;
            }
            entry.clock += 1;
            entry.state = None;
            let update = AwarenessUpdate {
                entries: vec![AwarenessEntry {
                    client_id,
                    clock: entry.clock,
                    state: None,
                }],
            };
            let change = AwarenessChange {
                added: vec![],
                updated: vec![],
                removed: vec![client_id],
                origin: AwarenessOrigin::Local,
                update,
            };
            self.notify(&change);
        }
    }

    /// Apply a remote update, returning the effective change. Stale entries
    /// (older clocks) are ignored.
    pub fn apply_update(&mut self, update: AwarenessUpdate) -> AwarenessChange {
        let mut change = AwarenessChange {
            added: vec![],
            updated: vec![],
            removed: vec![],
            origin: AwarenessOrigin::Remote,
            update: AwarenessUpdate { entries: vec![] },
        };

        for entry in update.entries {
            let accepted = match self.states.get(&entry.client_id) {
                None => true,
                Some(prev) => {
                    entry.clock > prev.clock
                        || (entry.clock == prev.clock
                            && entry.state.is_none()
                            && prev.state.is_some())
                }
            };
            if !accepted {
                continue;
            }

            let was_present = self
                .states
                .get(&entry.client_id)
                .map_or(false, |e| e.state.is_some());

            match (&entry.state, was_present) {
                (Some(_), false) => change.added.push(entry.client_id),
                (Some(_), true) => change.updated.push(entry.client_id),
                (None, true) => change.removed.push(entry.client_id),
                (None, false) => {}
            }

            change.update.entries.push(entry.clone());
            self.states.insert(
                entry.client_id,
                ClientEntry {
                    clock: entry.clock,
                    state: entry.state,
                },
            );
        }

        if !change.is_empty() {
            self.notify(&change);
        }
        change
    }

    /// Encode an update carrying the given clients' entries.
    pub fn update_for_clients(&self, clients: &[AwarenessClientId]) -> AwarenessUpdate {
        let entries = clients
            .iter()
            .filter_map(|id| {
                self.states.get(id).map(|entry| AwarenessEntry {
                    client_id: *id,
                    clock: entry.clock,
                    state: entry.state.clone(),
                })
            })
            .collect();
        AwarenessUpdate { entries }
    }

    /// All online client states.
    pub fn states(&self) -> HashMap<AwarenessClientId, Value> {
        self.states
            .iter()
            .filter_map(|(id, entry)| entry.state.clone().map(|s| (*id, s)))
            .collect()
    }

    /// Register an observer; returns a handle for [`Self::unobserve`].
    pub fn observe<F>(&mut self, f: F) -> AwarenessSubscription
    where
        F: Fn(&AwarenessChange) + Send + 'static,
    {
        let id = self.next_observer_id;
        self.next_observer_id += 1;
        self.observers.push((id, Box::new(f)));
        AwarenessSubscription(id)
    }

    pub fn unobserve(&mut self, handle: AwarenessSubscription) {
        self.observers.retain(|(id, _)| *id != handle.0);
    }

    fn notify(&self, change: &AwarenessChange) {
        for (_, observer) in &self.observers {
            observer(change);
        }
    }
}

impl Default for Awareness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_local_state_roundtrip() {
        let mut awareness = Awareness::new();
        assert!(awareness.local_state().is_none());

        awareness.set_local_state(json!({"kernel": {"execution_state": "idle"}}));
        assert_eq!(
            awareness.local_state_field("kernel"),
            Some(&json!({"execution_state": "idle"}))
        );
    }

    #[test]
    fn test_field_merge_preserves_other_fields() {
        let mut awareness = Awareness::new();
        awareness.set_local_state_field("kernel", json!({"execution_state": "busy"}));
        awareness.set_local_state_field("cell_states", json!({"c1": "busy"}));

        assert_eq!(
            awareness.local_state_field("kernel"),
            Some(&json!({"execution_state": "busy"}))
        );
        assert_eq!(
            awareness.local_state_field("cell_states"),
            Some(&json!({"c1": "busy"}))
        );
    }

    #[test]
    fn test_update_encode_decode() {
        let update = AwarenessUpdate {
            entries: vec![
                AwarenessEntry {
                    client_id: 42,
                    clock: 3,
                    state: Some(json!({"cursor": 7})),
                },
                AwarenessEntry {
                    client_id: 99,
                    clock: 1,
                    state: None,
                },
            ],
        };
        let decoded = AwarenessUpdate::decode(&update.encode()).unwrap();
        assert_eq!(decoded, update);
    }

    #[test]
    fn test_stale_clock_ignored() {
        let mut awareness = Awareness::new();
        awareness.apply_update(AwarenessUpdate {
            entries: vec![AwarenessEntry {
                client_id: 7,
                clock: 5,
                state: Some(json!({"v": 2})),
            }],
        });
        let change = awareness.apply_update(AwarenessUpdate {
            entries: vec![AwarenessEntry {
                client_id: 7,
                clock: 4,
                state: Some(json!({"v": 1})),
            }],
        });
        assert!(change.is_empty());
        assert_eq!(awareness.states()[&7], json!({"v": 2}));
    }

    #[test]
    fn test_removal_wins_at_equal_clock() {
        let mut awareness = Awareness::new();
        awareness.apply_update(AwarenessUpdate {
            entries: vec![AwarenessEntry {
                client_id: 7,
                clock: 5,
                state: Some(json!({})),
            }],
        });
        let change = awareness.apply_update(AwarenessUpdate {
            entries: vec![AwarenessEntry {
                client_id: 7,
                clock: 5,
                state: None,
            }],
        });
        assert_eq!(change.removed, vec![7]);
        assert!(awareness.states().is_empty());
    }

    #[test]
    fn test_observer_fires_on_local_change_only_once() {
        let mut awareness = Awareness::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_in = count.clone();
        let handle = awareness.observe(move |change| {
            assert_eq!(change.origin, AwarenessOrigin::Local);
            count_in.fetch_add(1, Ordering::SeqCst);
        });

        awareness.set_local_state(json!({"a": 1}));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        awareness.unobserve(handle);
        awareness.set_local_state(json!({"a": 2}));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clear_local_state_marks_offline() {
        let mut awareness = Awareness::new();
        awareness.set_local_state(json!({"a": 1}));
        assert!(awareness.local_state().is_some());

        awareness.clear_local_state();
        assert!(awareness.local_state().is_none());
        // clearing twice does not notify again
        awareness.clear_local_state();

        let update = awareness.update_for_clients(&[awareness.client_id()]);
        assert_eq!(update.entries[0].state, None);
        assert_eq!(update.entries[0].clock, 2);
    }

    #[test]
    fn test_update_for_clients_follows_local_clock() {
        let mut awareness = Awareness::new();
        awareness.set_local_state(json!({"n": 1}));
        awareness.set_local_state(json!({"n": 2}));

        let update = awareness.update_for_clients(&[awareness.client_id()]);
        assert_eq!(update.entries.len(), 1);
        assert_eq!(update.entries[0].clock, 2);
        assert_eq!(update.entries[0].state, Some(json!({"n": 2})));
    }
}
