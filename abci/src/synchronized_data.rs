//! # Synchronized Data
//!
//! Versioned key/value store replicated across all participants of an
//! application. Values are grouped per *period*: one run of the application
//! from an initial round up to a reset. Within a period every write is
//! appended, so the full history of a key stays readable until it is cleaned
//! up.
//!
//! ## Key Features
//!
//! - **Append-only history**: reads return the latest value, older values stay in the log
//! - **Kind stability**: once a key holds a non-null value its JSON kind is fixed
//! - **Period rollover**: cross-period keys and setup keys survive a reset
//! - **Replica digest**: SHA-256 over the canonical encoding of the whole store

use std::collections::{BTreeMap, BTreeSet};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::Address;

/// Key holding the ordered participant set
pub const PARTICIPANTS_KEY: &str = "participants";

/// Key holding the address elected to act alone in keeper rounds
pub const KEEPER_KEY: &str = "most_voted_keeper_address";

/// Per-period storage: key -> historical values, oldest first
pub type DbValues = BTreeMap<String, Vec<Value>>;

/// Errors raised by the synchronized data store
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DbError {
    #[error("Key `{0}` is not set")]
    KeyNotSet(String),

    #[error("Key `{key}` holds {expected} values and cannot store {found}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Key `{key}` could not be decoded: {reason}")]
    Decode { key: String, reason: String },
}

const KINDS: [&str; 6] = ["null", "bool", "number", "string", "array", "object"];

/// Name of the JSON kind of a value
pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The raw, per-period database behind [`SynchronizedData`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbciAppDb {
    setup_data: DbValues,
    data: BTreeMap<u64, DbValues>,
    cross_period_persisted_keys: BTreeSet<String>,
    /// Kind of every key that ever held a non-null value, across all periods
    #[serde(default)]
    kinds: BTreeMap<String, String>,
    round_count: u64,
}

impl AbciAppDb {
    /// Create a database whose first period starts from `setup_data`
    pub fn new<K, S>(setup_data: BTreeMap<String, Value>, cross_period_persisted_keys: K) -> Self
    where
        K: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let setup_data: DbValues = setup_data
            .into_iter()
            .map(|(key, value)| (key, vec![value]))
            .collect();
        let mut data = BTreeMap::new();
        data.insert(0, setup_data.clone());
        let kinds = setup_data
            .iter()
            .filter_map(|(key, values)| {
                let value = values.last().filter(|value| !value.is_null())?;
                Some((key.clone(), value_kind(value).to_string()))
            })
            .collect();

        Self {
            setup_data,
            data,
            cross_period_persisted_keys: cross_period_persisted_keys
                .into_iter()
                .map(Into::into)
                .collect(),
            kinds,
            round_count: 0,
        }
    }

    pub fn setup_data(&self) -> &DbValues {
        &self.setup_data
    }

    pub fn cross_period_persisted_keys(&self) -> &BTreeSet<String> {
        &self.cross_period_persisted_keys
    }

    pub fn add_cross_period_persisted_keys<K, S>(&mut self, keys: K)
    where
        K: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cross_period_persisted_keys
            .extend(keys.into_iter().map(Into::into));
    }

    /// Index of the period currently being written
    pub fn current_period(&self) -> u64 {
        self.data.keys().next_back().copied().unwrap_or(0)
    }

    /// Number of round entries since the database was created
    pub fn round_count(&self) -> u64 {
        self.round_count
    }

    pub fn increment_round_count(&mut self) {
        self.round_count += 1;
    }

    /// Periods still held in memory, oldest first
    pub fn periods(&self) -> impl Iterator<Item = u64> + '_ {
        self.data.keys().copied()
    }

    fn current(&self) -> Option<&DbValues> {
        self.data.values().next_back()
    }

    /// Latest value of `key` in the current period
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.current()?.get(key)?.last()
    }

    /// Latest value of `key`, failing when the key was never written
    pub fn get_strict(&self, key: &str) -> Result<&Value, DbError> {
        self.get(key).ok_or_else(|| DbError::KeyNotSet(key.to_string()))
    }

    /// All values written to `key` in the current period, oldest first
    pub fn history(&self, key: &str) -> &[Value] {
        self.current()
            .and_then(|values| values.get(key))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Latest value of `key` in the given period
    pub fn get_in_period(&self, period: u64, key: &str) -> Option<&Value> {
        self.data.get(&period)?.get(key)?.last()
    }

    /// Kind established for `key`, if it ever held a non-null value
    pub fn kind_of(&self, key: &str) -> Option<&'static str> {
        let kind = self.kinds.get(key)?;
        KINDS.iter().copied().find(|name| name == kind)
    }

    fn record_kind(&mut self, key: &str, value: &Value) {
        if !value.is_null() && !self.kinds.contains_key(key) {
            self.kinds.insert(key.to_string(), value_kind(value).to_string());
        }
    }

    /// Append values to the current period.
    ///
    /// All values are checked before any is written, so a rejected update
    /// leaves the database untouched.
    pub fn update<K, I>(&mut self, entries: I) -> Result<(), DbError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let entries = self.checked(entries)?;
        let period = self.current_period();
        for (key, value) in entries {
            self.record_kind(&key, &value);
            self.data.entry(period).or_default().entry(key).or_default().push(value);
        }
        Ok(())
    }

    /// Check a batch against the established kinds and against itself
    fn checked<K, I>(&self, entries: I) -> Result<Vec<(String, Value)>, DbError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let entries: Vec<(String, Value)> =
            entries.into_iter().map(|(key, value)| (key.into(), value)).collect();
        let mut batch: BTreeMap<&str, &'static str> = BTreeMap::new();
        for (key, value) in &entries {
            if value.is_null() {
                continue;
            }
            let found = value_kind(value);
            match self.kind_of(key).or_else(|| batch.get(key.as_str()).copied()) {
                Some(expected) if expected != found => {
                    return Err(DbError::TypeMismatch {
                        key: key.clone(),
                        expected,
                        found,
                    })
                }
                Some(_) => {}
                None => {
                    batch.insert(key, found);
                }
            }
        }
        Ok(entries)
    }

    /// Open a new period.
    ///
    /// The new period starts from the latest values of the setup keys and the
    /// cross-period persisted keys, overlaid with `entries`.
    pub fn create<K, I>(&mut self, entries: I) -> Result<(), DbError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut next = DbValues::new();
        let carried = self
            .setup_data
            .keys()
            .chain(self.cross_period_persisted_keys.iter());
        for key in carried {
            if let Some(value) = self.get(key) {
                next.insert(key.clone(), vec![value.clone()]);
            }
        }
        for (key, value) in self.checked(entries)? {
            self.record_kind(&key, &value);
            next.insert(key, vec![value]);
        }

        let period = self.current_period() + 1;
        self.data.insert(period, next);
        Ok(())
    }

    /// Trim history.
    ///
    /// Keeps the newest `history_depth` periods and, inside the current
    /// period, the newest `current_history_depth` values of every key.
    pub fn cleanup(&mut self, history_depth: usize, current_history_depth: usize) {
        let history_depth = history_depth.max(1);
        while self.data.len() > history_depth {
            if self.data.pop_first().is_none() {
                break;
            }
        }

        let current_history_depth = current_history_depth.max(1);
        if let Some(current) = self.data.values_mut().next_back() {
            for values in current.values_mut() {
                if values.len() > current_history_depth {
                    let excess = values.len() - current_history_depth;
                    values.drain(..excess);
                }
            }
        }
    }

    /// Hex encoded SHA-256 of the canonical JSON encoding
    pub fn digest(&self) -> String {
        // Maps are keyed by strings or integers and values are JSON already,
        // so encoding cannot fail.
        let encoded = serde_json::to_vec(self).expect("synchronized data encodes to JSON");
        format!("{:x}", Sha256::digest(&encoded))
    }
}

/// Read-mostly view over [`AbciAppDb`] handed to rounds and behaviours.
///
/// Updates never mutate in place: [`SynchronizedData::update`] returns a new
/// version, leaving the original untouched for the round that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynchronizedData {
    db: AbciAppDb,
}

impl SynchronizedData {
    pub fn new(db: AbciAppDb) -> Self {
        Self { db }
    }

    /// Build from setup values with no cross-period keys
    pub fn create(setup: BTreeMap<String, Value>) -> Self {
        Self::new(AbciAppDb::new(setup, Vec::<String>::new()))
    }

    pub fn db(&self) -> &AbciAppDb {
        &self.db
    }

    pub(crate) fn db_mut(&mut self) -> &mut AbciAppDb {
        &mut self.db
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.db.get(key)
    }

    /// Latest value of `key`, decoded into `T`
    pub fn get_strict<T: DeserializeOwned>(&self, key: &str) -> Result<T, DbError> {
        let value = self.db.get_strict(key)?;
        serde_json::from_value(value.clone()).map_err(|e| DbError::Decode {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    /// Latest value of `key` decoded into `T`, or `None` when unset or null
    pub fn get_optional<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, DbError> {
        match self.db.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.get_strict(key).map(Some),
        }
    }

    pub fn period_count(&self) -> u64 {
        self.db.current_period()
    }

    pub fn round_count(&self) -> u64 {
        self.db.round_count()
    }

    pub fn participants(&self) -> Result<BTreeSet<Address>, DbError> {
        self.get_strict(PARTICIPANTS_KEY)
    }

    pub fn nb_participants(&self) -> usize {
        self.participants().map(|p| p.len()).unwrap_or(0)
    }

    pub fn most_voted_keeper_address(&self) -> Result<Address, DbError> {
        self.get_strict(KEEPER_KEY)
    }

    /// Return a new version with `entries` appended
    pub fn update<K, I>(&self, entries: I) -> Result<Self, DbError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut next = self.clone();
        next.db.update(entries)?;
        Ok(next)
    }

    /// Return a new version positioned at the start of the next period
    pub fn create_new_period(&self) -> Result<Self, DbError> {
        let mut next = self.clone();
        next.db.create(Vec::<(String, Value)>::new())?;
        Ok(next)
    }

    pub fn digest(&self) -> String {
        self.db.digest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> BTreeMap<String, Value> {
        let mut setup = BTreeMap::new();
        setup.insert(PARTICIPANTS_KEY.to_string(), json!(["a", "b", "c", "d"]));
        setup
    }

    #[test]
    fn test_reads_return_latest_value() {
        let mut db = AbciAppDb::new(setup(), ["counter"]);
        db.update([("counter", json!(1))]).unwrap();
        db.update([("counter", json!(2))]).unwrap();

        assert_eq!(db.get("counter"), Some(&json!(2)));
        assert_eq!(db.history("counter"), &[json!(1), json!(2)]);
    }

    #[test]
    fn test_unset_key_is_typed_failure() {
        let db = AbciAppDb::new(setup(), Vec::<String>::new());
        assert_eq!(
            db.get_strict("missing"),
            Err(DbError::KeyNotSet("missing".to_string()))
        );
    }

    #[test]
    fn test_kind_is_fixed_after_first_write() {
        let mut db = AbciAppDb::new(setup(), Vec::<String>::new());
        db.update([("price", json!(10))]).unwrap();

        let err = db.update([("price", json!("ten"))]).unwrap_err();
        assert!(matches!(err, DbError::TypeMismatch { expected: "number", found: "string", .. }));

        // null is always accepted
        db.update([("price", Value::Null)]).unwrap();
        db.update([("price", json!(11))]).unwrap();
    }

    #[test]
    fn test_kind_outlives_period_and_cleanup() {
        let mut db = AbciAppDb::new(setup(), Vec::<String>::new());
        db.update([("price", json!(10))]).unwrap();
        db.create(Vec::<(String, Value)>::new()).unwrap();

        assert_eq!(db.get("price"), None);
        let err = db.update([("price", json!("ten"))]).unwrap_err();
        assert!(matches!(err, DbError::TypeMismatch { expected: "number", found: "string", .. }));

        db.create(Vec::<(String, Value)>::new()).unwrap();
        db.cleanup(1, 1);
        assert_eq!(db.periods().collect::<Vec<_>>(), vec![2]);
        assert!(db.update([("price", json!("ten"))]).is_err());
        assert!(db.create([("price", json!(["ten"]))]).is_err());
        assert_eq!(db.kind_of("price"), Some("number"));
    }

    #[test]
    fn test_batch_kinds_must_agree() {
        let mut db = AbciAppDb::new(setup(), Vec::<String>::new());
        let err = db.update([("k", json!(1)), ("k", json!("one"))]).unwrap_err();
        assert!(matches!(err, DbError::TypeMismatch { expected: "number", found: "string", .. }));
        assert_eq!(db.kind_of("k"), None);
    }

    #[test]
    fn test_setup_values_fix_their_kind() {
        let mut db = AbciAppDb::new(setup(), Vec::<String>::new());
        assert_eq!(db.kind_of(PARTICIPANTS_KEY), Some("array"));
        assert!(db.update([(PARTICIPANTS_KEY, json!("a"))]).is_err());
    }

    #[test]
    fn test_digest_covers_established_kinds() {
        let mut a = AbciAppDb::new(setup(), Vec::<String>::new());
        let mut b = a.clone();
        a.update([("k", json!(1))]).unwrap();
        b.update([("k", json!("1"))]).unwrap();
        a.create(Vec::<(String, Value)>::new()).unwrap();
        b.create(Vec::<(String, Value)>::new()).unwrap();
        a.cleanup(1, 1);
        b.cleanup(1, 1);

        assert_eq!(a.get("k"), b.get("k"));
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_rejected_update_is_atomic() {
        let mut db = AbciAppDb::new(setup(), Vec::<String>::new());
        db.update([("a", json!(1))]).unwrap();

        let result = db.update([("b", json!(true)), ("a", json!([1]))]);
        assert!(result.is_err());
        assert_eq!(db.get("b"), None);
    }

    #[test]
    fn test_new_period_carries_setup_and_persisted_keys() {
        let mut db = AbciAppDb::new(setup(), ["counter"]);
        db.update([("counter", json!(3)), ("scratch", json!("x"))]).unwrap();
        db.create(Vec::<(String, Value)>::new()).unwrap();

        assert_eq!(db.current_period(), 1);
        assert_eq!(db.get("counter"), Some(&json!(3)));
        assert_eq!(db.get(PARTICIPANTS_KEY), Some(&json!(["a", "b", "c", "d"])));
        assert_eq!(db.get("scratch"), None);
        assert_eq!(db.get_in_period(0, "scratch"), Some(&json!("x")));
    }

    #[test]
    fn test_cleanup_trims_periods_and_history() {
        let mut db = AbciAppDb::new(setup(), Vec::<String>::new());
        for period in 0..4 {
            db.update([("n", json!(period))]).unwrap();
            db.update([("n", json!(period + 100))]).unwrap();
            db.create(Vec::<(String, Value)>::new()).unwrap();
        }
        db.update([("n", json!(1)), ("n", json!(2)), ("n", json!(3))]).unwrap();

        db.cleanup(2, 1);
        assert_eq!(db.periods().collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(db.history("n"), &[json!(3)]);
    }

    #[test]
    fn test_synchronized_data_update_returns_new_version() {
        let data = SynchronizedData::create(setup());
        let next = data.update([("value", json!("X"))]).unwrap();

        assert_eq!(data.get("value"), None);
        assert_eq!(next.get_strict::<String>("value").unwrap(), "X");
        assert_eq!(next.nb_participants(), 4);
    }

    #[test]
    fn test_decode_failure_is_reported() {
        let data = SynchronizedData::create(setup());
        let err = data.get_strict::<u64>(PARTICIPANTS_KEY).unwrap_err();
        assert!(matches!(err, DbError::Decode { .. }));
    }

    #[test]
    fn test_digest_tracks_content() {
        let a = SynchronizedData::create(setup());
        let b = SynchronizedData::create(setup());
        assert_eq!(a.digest(), b.digest());

        let c = a.update([("k", json!(1))]).unwrap();
        assert_ne!(a.digest(), c.digest());
        assert_eq!(c.digest().len(), 64);
    }
}
