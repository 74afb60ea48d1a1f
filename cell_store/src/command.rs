//! Command channel protocol layered on the shared store.
//!
//! One producer FSM requests work from one consumer FSM through a single
//! store key. The record lifecycle is:
//!
//! ```text
//! producer: null ──issue──► {id, process, ..params, state:"", is_done:false}
//! consumer:                 {.., state:"done"|"error", is_done:true, result?}
//! producer: ──poll_completion──► null
//! ```
//!
//! Every record carries a correlation `id`. The consumer only finishes the
//! record it was handed, and the producer takes a completion and clears the
//! key in one atomic update, so a completion is observed at most once and a
//! cancelled request can never be overwritten by a late consumer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::store::SharedStore;

/// Record field names that parameters may not use.
pub const RESERVED_FIELDS: [&str; 5] = ["id", "process", "state", "is_done", "result"];

/// Parameter map of a command.
pub type Params = Map<String, Value>;

/// Completion state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CommandState {
    /// Issued, not yet finished.
    #[default]
    #[serde(rename = "")]
    Pending,
    /// Finished successfully.
    #[serde(rename = "done")]
    Done,
    /// Finished with a failure.
    #[serde(rename = "error")]
    Error,
}

impl CommandState {
    /// Wire spelling.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

/// The value stored at a channel key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    /// Correlation id stamped by the producer.
    pub id: u64,
    /// Action identifier, e.g. `MOVE_TO_RACK`.
    pub process: String,
    /// Action parameters, flattened into the record.
    #[serde(flatten)]
    pub params: Params,
    /// Completion state.
    #[serde(default)]
    pub state: CommandState,
    /// Set by the consumer together with `state`.
    #[serde(default)]
    pub is_done: bool,
    /// Optional result payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl CommandRecord {
    /// Raw parameter value.
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    /// Integer parameter.
    pub fn param_i64(&self, name: &str) -> Option<i64> {
        self.param(name).and_then(Value::as_i64)
    }

    /// Boolean parameter.
    pub fn param_bool(&self, name: &str) -> Option<bool> {
        self.param(name).and_then(Value::as_bool)
    }

    /// String parameter.
    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.param(name).and_then(Value::as_str)
    }
}

/// What the producer learns when a record finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// Correlation id of the finished record.
    pub id: u64,
    /// Process that was requested.
    pub process: String,
    /// `Done` or `Error`.
    pub state: CommandState,
    /// Consumer's result payload.
    pub result: Option<Value>,
}

impl Completion {
    /// Whether the consumer reported success.
    pub fn is_success(&self) -> bool {
        self.state == CommandState::Done
    }

    /// Failure reason written by [`CommandConsumer::fail`].
    pub fn reason(&self) -> Option<&str> {
        self.result
            .as_ref()
            .and_then(|r| r.get("reason"))
            .and_then(Value::as_str)
    }
}

fn record_id(value: &Value) -> Option<u64> {
    value.get("id").and_then(Value::as_u64)
}

// ─── Producer ───────────────────────────────────────────────────────

/// Requesting side of a channel.
#[derive(Debug)]
pub struct CommandProducer {
    store: SharedStore,
    key: String,
    next_id: u64,
    outstanding: Option<u64>,
}

impl CommandProducer {
    /// Producer for the channel at `key`.
    pub fn new(store: SharedStore, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            next_id: 1,
            outstanding: None,
        }
    }

    /// Channel key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Correlation id of the record this producer is waiting on.
    pub fn outstanding(&self) -> Option<u64> {
        self.outstanding
    }

    /// Write a new request. Fails with [`StoreError::ChannelBusy`] while the
    /// key holds any record, finished or not.
    pub fn issue(&mut self, process: &str, params: Params) -> StoreResult<u64> {
        if let Some(name) = params.keys().find(|k| RESERVED_FIELDS.contains(&k.as_str())) {
            return Err(StoreError::ReservedParam { name: name.clone() });
        }
        let id = self.next_id;
        let record = serde_json::to_value(CommandRecord {
            id,
            process: process.to_string(),
            params,
            state: CommandState::Pending,
            is_done: false,
            result: None,
        })?;

        self.store.update(&self.key, |slot| {
            if slot.is_null() {
                *slot = record;
                Ok(())
            } else {
                Err(StoreError::ChannelBusy {
                    key: self.key.clone(),
                    id: record_id(slot).unwrap_or(0),
                })
            }
        })?;

        self.next_id += 1;
        self.outstanding = Some(id);
        debug!(key = %self.key, id, process, "Command issued");
        Ok(id)
    }

    /// Take the outstanding record if it has finished.
    ///
    /// On completion the key is cleared in the same atomic step, so the same
    /// completion is never returned twice. Returns `Ok(None)` while the
    /// record is still pending or nothing is outstanding.
    pub fn poll_completion(&mut self) -> StoreResult<Option<Completion>> {
        let Some(expected) = self.outstanding else {
            return Ok(None);
        };

        let taken = self.store.update(&self.key, |slot| {
            if slot.is_null() {
                return Err(StoreError::StaleRecord {
                    key: self.key.clone(),
                    expected,
                    found: None,
                });
            }
            let found = record_id(slot);
            if found != Some(expected) {
                return Err(StoreError::StaleRecord {
                    key: self.key.clone(),
                    expected,
                    found,
                });
            }
            if slot.get("is_done").and_then(Value::as_bool) == Some(true) {
                Ok(Some(slot.take()))
            } else {
                Ok(None)
            }
        });

        let raw = match taken {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(key = %self.key, error = %e, "Outstanding command lost");
                self.outstanding = None;
                return Err(e);
            }
        };

        self.outstanding = None;
        let record: CommandRecord =
            serde_json::from_value(raw).map_err(|e| StoreError::MalformedRecord {
                key: self.key.clone(),
                reason: e.to_string(),
            })?;
        debug!(key = %self.key, id = record.id, state = record.state.as_str(), "Command completed");
        Ok(Some(Completion {
            id: record.id,
            process: record.process,
            state: record.state,
            result: record.result,
        }))
    }

    /// Withdraw the outstanding record. Returns whether one was removed.
    pub fn cancel(&mut self) -> bool {
        let Some(expected) = self.outstanding.take() else {
            return false;
        };
        let removed = self.store.update(&self.key, |slot| {
            if record_id(slot) == Some(expected) {
                *slot = Value::Null;
                true
            } else {
                false
            }
        });
        if removed {
            debug!(key = %self.key, id = expected, "Command cancelled");
        }
        removed
    }
}

// ─── Consumer ───────────────────────────────────────────────────────

/// Serving side of a channel.
#[derive(Debug, Clone)]
pub struct CommandConsumer {
    store: SharedStore,
    key: String,
}

impl CommandConsumer {
    /// Consumer for the channel at `key`.
    pub fn new(store: SharedStore, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    /// Channel key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The unfinished record at the key, if any.
    pub fn pending(&self) -> StoreResult<Option<CommandRecord>> {
        let Some(raw) = self.store.get_opt(&self.key) else {
            return Ok(None);
        };
        if raw.get("is_done").and_then(Value::as_bool) == Some(true) {
            return Ok(None);
        }
        serde_json::from_value(raw)
            .map(Some)
            .map_err(|e| StoreError::MalformedRecord {
                key: self.key.clone(),
                reason: e.to_string(),
            })
    }

    /// Whether the record `id` is still the unfinished record at the key.
    pub fn is_current(&self, id: u64) -> bool {
        self.store.get_opt(&self.key).is_some_and(|raw| {
            record_id(&raw) == Some(id)
                && raw.get("is_done").and_then(Value::as_bool) != Some(true)
        })
    }

    /// Report success.
    pub fn complete(&self, id: u64, result: Option<Value>) -> StoreResult<()> {
        self.finish(id, CommandState::Done, result)
    }

    /// Report failure with a human-readable reason.
    pub fn fail(&self, id: u64, reason: impl Into<String>) -> StoreResult<()> {
        let reason = reason.into();
        self.finish(id, CommandState::Error, Some(serde_json::json!({ "reason": reason })))
    }

    fn finish(&self, id: u64, state: CommandState, result: Option<Value>) -> StoreResult<()> {
        self.store.update(&self.key, |slot| {
            let found = record_id(slot);
            if slot.is_null() || found != Some(id) {
                return Err(StoreError::StaleRecord {
                    key: self.key.clone(),
                    expected: id,
                    found,
                });
            }
            let Some(fields) = slot.as_object_mut() else {
                return Err(StoreError::MalformedRecord {
                    key: self.key.clone(),
                    reason: "record is not an object".into(),
                });
            };
            if fields.get("is_done").and_then(Value::as_bool) == Some(true) {
                return Err(StoreError::AlreadyCompleted {
                    key: self.key.clone(),
                    id,
                });
            }
            fields.insert("state".into(), Value::from(state.as_str()));
            fields.insert("is_done".into(), Value::Bool(true));
            match result {
                Some(r) => fields.insert("result".into(), r),
                None => fields.remove("result"),
            };
            Ok(())
        })?;
        debug!(key = %self.key, id, state = state.as_str(), "Command finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    const KEY: &str = "command/robot";

    fn params(v: Value) -> Params {
        match v {
            Value::Object(m) => m,
            _ => Params::new(),
        }
    }

    #[test]
    fn record_serializes_with_flat_params() {
        let record = CommandRecord {
            id: 7,
            process: "MOVE_TO_RACK".into(),
            params: params(json!({"target_floor": 2})),
            state: CommandState::Pending,
            is_done: false,
            result: None,
        };
        let v = serde_json::to_value(&record).unwrap();
        assert_eq!(
            v,
            json!({"id": 7, "process": "MOVE_TO_RACK", "target_floor": 2, "state": "", "is_done": false})
        );
        let back: CommandRecord = serde_json::from_value(v).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.param_i64("target_floor"), Some(2));
    }

    #[test]
    fn full_round_trip() {
        let store = SharedStore::new();
        let mut producer = CommandProducer::new(store.clone(), KEY);
        let consumer = CommandConsumer::new(store.clone(), KEY);

        let id = producer
            .issue("MOVE_TO_RACK", params(json!({"target_floor": 2})))
            .unwrap();
        assert_eq!(producer.poll_completion().unwrap(), None);

        let record = consumer.pending().unwrap().unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.process, "MOVE_TO_RACK");
        consumer.complete(id, Some(json!({"position": 1020}))).unwrap();
        assert_eq!(consumer.pending().unwrap(), None);

        let done = producer.poll_completion().unwrap().unwrap();
        assert!(done.is_success());
        assert_eq!(done.result, Some(json!({"position": 1020})));
        assert!(store.is_empty_at(KEY));
        assert_eq!(producer.outstanding(), None);
    }

    #[test]
    fn completion_is_observed_once() {
        let store = SharedStore::new();
        let mut producer = CommandProducer::new(store.clone(), KEY);
        let consumer = CommandConsumer::new(store.clone(), KEY);
        let id = producer.issue("MOVE_TO_HOME", Params::new()).unwrap();
        consumer.complete(id, None).unwrap();

        assert!(producer.poll_completion().unwrap().is_some());
        assert_eq!(producer.poll_completion().unwrap(), None);
    }

    #[test]
    fn issue_refuses_occupied_key() {
        let store = SharedStore::new();
        let mut producer = CommandProducer::new(store.clone(), KEY);
        let consumer = CommandConsumer::new(store.clone(), KEY);
        let first = producer.issue("MOVE_TO_HOME", Params::new()).unwrap();

        let err = producer.issue("MOVE_TO_HOME", Params::new()).unwrap_err();
        assert!(matches!(err, StoreError::ChannelBusy { id, .. } if id == first));

        // A finished but unconsumed record still occupies the key.
        consumer.complete(first, None).unwrap();
        assert!(matches!(
            producer.issue("MOVE_TO_HOME", Params::new()),
            Err(StoreError::ChannelBusy { .. })
        ));
    }

    #[test]
    fn reserved_param_names_are_rejected() {
        let store = SharedStore::new();
        let mut producer = CommandProducer::new(store.clone(), KEY);
        let err = producer
            .issue("MOVE_TO_HOME", params(json!({"is_done": true})))
            .unwrap_err();
        assert!(matches!(err, StoreError::ReservedParam { name } if name == "is_done"));
        assert!(store.is_empty_at(KEY));
    }

    #[test]
    fn consumer_cannot_finish_twice() {
        let store = SharedStore::new();
        let mut producer = CommandProducer::new(store.clone(), KEY);
        let consumer = CommandConsumer::new(store, KEY);
        let id = producer.issue("MOVE_TO_HOME", Params::new()).unwrap();
        consumer.fail(id, "unsafe motion").unwrap();
        assert!(matches!(
            consumer.complete(id, None),
            Err(StoreError::AlreadyCompleted { .. })
        ));
        let done = producer.poll_completion().unwrap().unwrap();
        assert_eq!(done.state, CommandState::Error);
        assert_eq!(done.reason(), Some("unsafe motion"));
    }

    #[test]
    fn cancelled_record_is_not_overwritten() {
        let store = SharedStore::new();
        let mut producer = CommandProducer::new(store.clone(), KEY);
        let consumer = CommandConsumer::new(store.clone(), KEY);
        let old = producer.issue("MOVE_TO_HOME", Params::new()).unwrap();
        assert!(consumer.is_current(old));
        assert!(producer.cancel());
        assert!(!consumer.is_current(old));

        let new = producer.issue("READ_QR", Params::new()).unwrap();
        assert_ne!(old, new);
        assert!(matches!(
            consumer.complete(old, None),
            Err(StoreError::StaleRecord { found: Some(f), .. }) if f == new
        ));
        assert_eq!(consumer.pending().unwrap().map(|r| r.id), Some(new));
    }

    #[test]
    fn vanished_record_is_reported_stale() {
        let store = SharedStore::new();
        let mut producer = CommandProducer::new(store.clone(), KEY);
        producer.issue("MOVE_TO_HOME", Params::new()).unwrap();
        store.clear(KEY);
        assert!(matches!(
            producer.poll_completion(),
            Err(StoreError::StaleRecord { found: None, .. })
        ));
        assert_eq!(producer.outstanding(), None);
    }

    #[test]
    fn malformed_record_is_reported() {
        let store = SharedStore::new();
        store.set(KEY, json!({"process": 12}));
        let consumer = CommandConsumer::new(store, KEY);
        assert!(matches!(
            consumer.pending(),
            Err(StoreError::MalformedRecord { .. })
        ));
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Outcome {
        Complete,
        Fail,
        Cancel,
    }

    fn outcome() -> impl Strategy<Value = Outcome> {
        prop_oneof![Just(Outcome::Complete), Just(Outcome::Fail), Just(Outcome::Cancel)]
    }

    proptest! {
        #[test]
        fn every_request_resolves_once(outcomes in proptest::collection::vec(outcome(), 1..40)) {
            let store = SharedStore::new();
            let mut producer = CommandProducer::new(store.clone(), KEY);
            let consumer = CommandConsumer::new(store.clone(), KEY);
            let mut last = 0;
            for outcome in outcomes {
                let id = producer.issue("MOVE_TO_HOME", Params::new()).unwrap();
                prop_assert!(id > last);
                last = id;
                if outcome == Outcome::Cancel {
                    prop_assert!(producer.cancel());
                    prop_assert!(consumer.complete(id, None).is_err());
                } else {
                    let record = consumer.pending().unwrap();
                    prop_assert_eq!(record.map(|r| r.id), Some(id));
                    if outcome == Outcome::Complete {
                        consumer.complete(id, None).unwrap();
                    } else {
                        consumer.fail(id, "collision").unwrap();
                    }
                    prop_assert!(consumer.pending().unwrap().is_none());
                    let done = producer.poll_completion().unwrap();
                    prop_assert_eq!(done.map(|d| d.is_success()), Some(outcome == Outcome::Complete));
                    prop_assert!(producer.poll_completion().unwrap().is_none());
                }
                prop_assert!(store.is_empty_at(KEY));
            }
        }
    }
}
