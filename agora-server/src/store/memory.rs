//! In-process [`KeyValueStore`] used by tests and single-node development.
//!
//! Expiry follows the tokio clock, so tests can drive TTLs with
//! `tokio::time::pause` and `advance`.

use std::{
    collections::{HashMap, VecDeque},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::Mutex, time::Instant};

use super::{KeyValueStore, StoreError, StoreResult, WriteBatch, WriteOp};

#[derive(Debug)]
enum Value {
    Text(String),
    Hash(HashMap<String, String>),
    SortedSet(HashMap<String, i64>),
    List(VecDeque<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Text,
    Hash,
    SortedSet,
    List,
}

impl Value {
    fn kind(&self) -> Kind {
        match self {
            Self::Text(_) => Kind::Text,
            Self::Hash(_) => Kind::Hash,
            Self::SortedSet(_) => Kind::SortedSet,
            Self::List(_) => Kind::List,
        }
    }
}

/// Type an op needs at its key, and whether it creates the key when absent.
fn requirement(op: &WriteOp) -> Option<(Kind, bool)> {
    match op {
        WriteOp::HashSetAll { .. } => Some((Kind::Hash, true)),
        WriteOp::CounterAdjust { .. } => Some((Kind::Hash, false)),
        WriteOp::SortedSetAdd { .. } => Some((Kind::SortedSet, true)),
        WriteOp::SortedSetRemove { .. } => Some((Kind::SortedSet, false)),
        WriteOp::ListPush { .. } => Some((Kind::List, true)),
        WriteOp::ListPushIfExists { .. } | WriteOp::ListRemove { .. } => {
            Some((Kind::List, false))
        }
        WriteOp::Expire { .. } | WriteOp::Delete { .. } => None,
    }
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
}

impl State {
    fn purge_if_expired(&mut self, key: &str, now: Instant) {
        let expired = self
            .entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            self.entries.remove(key);
        }
    }

    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        self.purge_if_expired(key, Instant::now());
        self.entries.get_mut(key)
    }

    fn hash_mut(&mut self, key: &str) -> StoreResult<&mut HashMap<String, String>> {
        self.purge_if_expired(key, Instant::now());
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
        match &mut entry.value {
            Value::Hash(hash) => Ok(hash),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn sorted_set_mut(&mut self, key: &str) -> StoreResult<&mut HashMap<String, i64>> {
        self.purge_if_expired(key, Instant::now());
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::SortedSet(HashMap::new())));
        match &mut entry.value {
            Value::SortedSet(set) => Ok(set),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn list_mut(&mut self, key: &str) -> StoreResult<&mut VecDeque<String>> {
        self.purge_if_expired(key, Instant::now());
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::List(VecDeque::new())));
        match &mut entry.value {
            Value::List(list) => Ok(list),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    /// Empty collections do not exist as keys.
    fn drop_if_empty(&mut self, key: &str) {
        let empty = self.entries.get(key).is_some_and(|entry| match &entry.value {
            Value::Hash(hash) => hash.is_empty(),
            Value::SortedSet(set) => set.is_empty(),
            Value::List(list) => list.is_empty(),
            Value::Text(_) => false,
        });
        if empty {
            self.entries.remove(key);
        }
    }

    /// Fails with [`StoreError::WrongType`] if any op would hit a key holding
    /// another type, taking earlier ops of the same batch into account.
    fn check_types(&mut self, ops: &[WriteOp]) -> StoreResult<()> {
        let mut planned: HashMap<&str, Option<Kind>> = HashMap::new();
        for op in ops {
            let key = op.key();
            if matches!(op, WriteOp::Delete { .. }) {
                planned.insert(key, None);
                continue;
            }
            let Some((required, creates)) = requirement(op) else {
                continue;
            };
            let current = match planned.get(key) {
                Some(kind) => *kind,
                None => self.live(key).map(|entry| entry.value.kind()),
            };
            match current {
                Some(kind) if kind != required => {
                    return Err(StoreError::WrongType(key.to_string()));
                }
                None if creates => {
                    planned.insert(key, Some(required));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn apply_op(&mut self, op: WriteOp) -> StoreResult<()> {
        match op {
            WriteOp::HashSetAll { key, fields } => {
                self.hash_mut(&key)?.extend(fields);
            }
            WriteOp::SortedSetAdd { key, member, score } => {
                self.sorted_set_mut(&key)?.insert(member, score);
            }
            WriteOp::SortedSetRemove { key, member } => {
                if self.live(&key).is_some() {
                    self.sorted_set_mut(&key)?.remove(&member);
                    self.drop_if_empty(&key);
                }
            }
            WriteOp::ListPush { key, value } => {
                self.list_mut(&key)?.push_back(value);
            }
            WriteOp::ListPushIfExists { key, value } => {
                if self.live(&key).is_some() {
                    self.list_mut(&key)?.push_back(value);
                }
            }
            WriteOp::ListRemove { key, value } => {
                if self.live(&key).is_some() {
                    self.list_mut(&key)?.retain(|item| item != &value);
                    self.drop_if_empty(&key);
                }
            }
            WriteOp::CounterAdjust {
                key,
                field,
                delta,
                floor,
            } => {
                if self.live(&key).is_some() {
                    let hash = self.hash_mut(&key)?;
                    let current = hash
                        .get(&field)
                        .and_then(|raw| raw.parse::<i64>().ok())
                        .unwrap_or(0);
                    let updated = current.saturating_add(delta).max(floor);
                    hash.insert(field, updated.to_string());
                }
            }
            WriteOp::Expire { key, ttl } => {
                if let Some(entry) = self.live(&key) {
                    entry.expires_at = Some(Instant::now() + ttl);
                }
            }
            WriteOp::Delete { key } => {
                self.entries.remove(&key);
            }
        }
        Ok(())
    }

    fn sorted_set_len(&mut self, key: &str) -> StoreResult<usize> {
        match self.live(key) {
            None => Ok(0),
            Some(Entry {
                value: Value::SortedSet(set),
                ..
            }) => Ok(set.len()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn sorted_members_ascending(&mut self, key: &str) -> StoreResult<Vec<String>> {
        let Some(entry) = self.live(key) else {
            return Ok(Vec::new());
        };
        let Value::SortedSet(set) = &entry.value else {
            return Err(StoreError::WrongType(key.to_string()));
        };
        let mut members: Vec<(&String, &i64)> = set.iter().collect();
        members.sort_by(|(a_member, a_score), (b_member, b_score)| {
            a_score.cmp(b_score).then_with(|| a_member.cmp(b_member))
        });
        Ok(members.into_iter().map(|(member, _)| member.clone()).collect())
    }

    fn text(&mut self, key: &str) -> StoreResult<Option<&mut Entry>> {
        match self.live(key) {
            None => Ok(None),
            Some(entry) if matches!(entry.value, Value::Text(_)) => Ok(Some(entry)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }
}

/// Resolves an inclusive rank window with negative indexes counting from the end.
fn resolve_window(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = isize::try_from(len).ok()?;
    let start = (if start < 0 { len + start } else { start }).max(0);
    let stop = (if stop < 0 { len + stop } else { stop }).min(len - 1);
    if start > stop || start >= len {
        return None;
    }
    Some((usize::try_from(start).ok()?, usize::try_from(stop).ok()?))
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    offline: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with [`StoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.state.lock().await.live(key).is_some()
    }

    /// Remaining lifetime of `key`, if it exists and has one.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let mut state = self.state.lock().await;
        let expires_at = state.live(key)?.expires_at?;
        Some(expires_at.saturating_duration_since(Instant::now()))
    }

    fn check_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.check_online()?;
        let mut state = self.state.lock().await;
        match state.live(key) {
            None => Ok(HashMap::new()),
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => Ok(hash.clone()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn sorted_set_len(&self, key: &str) -> StoreResult<u64> {
        self.check_online()?;
        let mut state = self.state.lock().await;
        Ok(state.sorted_set_len(key)? as u64)
    }

    async fn sorted_set_rev_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> StoreResult<Vec<String>> {
        self.check_online()?;
        let mut state = self.state.lock().await;
        let mut members = state.sorted_members_ascending(key)?;
        members.reverse();
        Ok(match resolve_window(members.len(), start, stop) {
            Some((from, to)) => members[from..=to].to_vec(),
            None => Vec::new(),
        })
    }

    async fn trim_sorted_set(&self, key: &str, keep: usize) -> StoreResult<u64> {
        self.check_online()?;
        let mut state = self.state.lock().await;
        if state.sorted_set_len(key)? <= keep {
            return Ok(0);
        }
        let members = state.sorted_members_ascending(key)?;
        let excess = members.len() - keep;
        let set = state.sorted_set_mut(key)?;
        for member in &members[..excess] {
            set.remove(member);
        }
        state.drop_if_empty(key);
        Ok(excess as u64)
    }

    async fn list_range(&self, key: &str) -> StoreResult<Vec<String>> {
        self.check_online()?;
        let mut state = self.state.lock().await;
        match state.live(key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(list.iter().cloned().collect()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_online()?;
        let mut state = self.state.lock().await;
        Ok(state.text(key)?.and_then(|entry| match &entry.value {
            Value::Text(text) => Some(text.clone()),
            _ => None,
        }))
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_online()?;
        let mut state = self.state.lock().await;
        if state.live(key).is_some() {
            return Ok(false);
        }
        state.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.check_online()?;
        let mut state = self.state.lock().await;
        match state.text(key)? {
            Some(entry) if matches!(&entry.value, Value::Text(text) if text == expected) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        self.check_online()?;
        let mut state = self.state.lock().await;
        let matches = state
            .text(key)?
            .is_some_and(|entry| matches!(&entry.value, Value::Text(text) if text == expected));
        if matches {
            state.entries.remove(key);
        }
        Ok(matches)
    }

    async fn apply(&self, batch: WriteBatch) -> StoreResult<()> {
        self.check_online()?;
        let mut state = self.state.lock().await;
        let ops = batch.into_ops();
        // The only way an op can fail is a type clash, so checking first keeps
        // the batch all-or-nothing.
        state.check_types(&ops)?;
        for op in ops {
            state.apply_op(op)?;
        }
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check_online()
    }
}
