//! Id and timestamp generation.
//!
//! In deterministic mode ids and timestamps are derived from one persisted
//! sequence counter, so a store that is exported and re-imported continues
//! the same sequence. The counter lives in the store's key-value table and is
//! written on every draw, inside whatever transaction is open.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::store::StateStore;

/// Key-value row holding [`ClockState`].
pub const CLOCK_STATE_KEY: &str = "lix_clock";

/// Prefix of deterministic ids; the low 48 bits carry the sequence number.
const DETERMINISTIC_ID_PREFIX: &str = "01920000-0000-7000-8000-";

/// Persisted clock state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockState {
    pub deterministic: bool,
    /// Next sequence number to hand out.
    pub sequence: u64,
}

pub fn load_state(store: &dyn StateStore) -> Result<ClockState> {
    match store.kv_get(CLOCK_STATE_KEY)? {
        Some(value) => Ok(serde_json::from_value(value)?),
        None => Ok(ClockState::default()),
    }
}

fn save_state(store: &mut dyn StateStore, state: ClockState) -> Result<()> {
    store.kv_set(CLOCK_STATE_KEY, serde_json::to_value(state)?)
}

pub fn is_deterministic(store: &dyn StateStore) -> Result<bool> {
    Ok(load_state(store)?.deterministic)
}

/// Toggle deterministic mode. The sequence resumes where it stopped.
pub fn set_deterministic(store: &mut dyn StateStore, enabled: bool) -> Result<()> {
    let mut state = load_state(store)?;
    state.deterministic = enabled;
    save_state(store, state)
}

fn next_sequence(store: &mut dyn StateStore) -> Result<u64> {
    let mut state = load_state(store)?;
    let sequence = state.sequence;
    state.sequence += 1;
    save_state(store, state)?;
    Ok(sequence)
}

/// Next unique id.
pub fn next_id(store: &mut dyn StateStore) -> Result<String> {
    if is_deterministic(store)? {
        let sequence = next_sequence(store)?;
        Ok(deterministic_id(sequence))
    } else {
        Ok(Uuid::new_v4().to_string())
    }
}

/// Current timestamp.
pub fn now(store: &mut dyn StateStore) -> Result<DateTime<Utc>> {
    if is_deterministic(store)? {
        let sequence = next_sequence(store)?;
        Ok(deterministic_timestamp(sequence))
    } else {
        Ok(Utc::now())
    }
}

/// UUID-shaped id whose lexical order follows `sequence`.
pub fn deterministic_id(sequence: u64) -> String {
    format!("{DETERMINISTIC_ID_PREFIX}{:012x}", sequence & 0xffff_ffff_ffff)
}

/// Milliseconds after the Unix epoch.
pub fn deterministic_timestamp(sequence: u64) -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH + Duration::milliseconds(sequence as i64)
}
