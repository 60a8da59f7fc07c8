use super::{HashBackend, ScanPage};
use crate::error::{RepoError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use tokio::sync::RwLock;

/// Open scans kept for resumption; the oldest is dropped beyond this.
const MAX_OPEN_SCANS: usize = 1024;

#[derive(Default)]
struct MemoryState {
    hashes: BTreeMap<String, HashMap<String, String>>,
    // open scans: cursor -> last key handed out
    cursors: BTreeMap<u64, String>,
    next_cursor: u64,
}

/// In-process hash backend with Redis-like semantics.
///
/// A hash disappears when its last field is deleted. Scans walk keys in
/// lexical order and resume after the last returned key, so keys that exist
/// for the whole scan are always returned.
#[derive(Default)]
pub struct MemoryBackend {
    state: RwLock<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of hashes currently stored
    pub async fn len(&self) -> usize {
        self.state.read().await.hashes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl HashBackend for MemoryBackend {
    async fn get_field(&self, key: &str, field: &str) -> Result<Option<String>> {
        let state = self.state.read().await;
        Ok(state
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field))
            .cloned())
    }

    async fn set_field(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_field(&self, key: &str, field: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let now_empty = match state.hashes.get_mut(key) {
            Some(hash) => {
                hash.remove(field);
                hash.is_empty()
            }
            None => false,
        };
        if now_empty {
            state.hashes.remove(key);
        }
        Ok(())
    }

    async fn scan_page(&self, cursor: u64, pattern: &str, count: usize) -> Result<ScanPage> {
        let prefix = unescape(literal_prefix(pattern)?);
        let mut state = self.state.write().await;

        let start = if cursor == 0 {
            Bound::Unbounded
        } else {
            match state.cursors.remove(&cursor) {
                Some(last) => Bound::Excluded(last),
                // unknown cursor: behave like an exhausted scan
                None => return Ok(ScanPage::default()),
            }
        };

        let mut keys = Vec::new();
        let mut last_seen = None;
        let mut examined = 0;
        let mut exhausted = true;
        for key in state
            .hashes
            .range::<String, _>((start, Bound::Unbounded))
            .map(|(key, _)| key)
        {
            if examined == count.max(1) {
                exhausted = false;
                break;
            }
            examined += 1;
            last_seen = Some(key.clone());
            if key.starts_with(&prefix) {
                keys.push(key.clone());
            }
        }

        let next = match (exhausted, last_seen) {
            (false, Some(last)) => {
                state.next_cursor += 1;
                let id = state.next_cursor;
                state.cursors.insert(id, last);
                // abandoned scans are never resumed
                while state.cursors.len() > MAX_OPEN_SCANS {
                    state.cursors.pop_first();
                }
                id
            }
            _ => 0,
        };

        Ok(ScanPage { keys, cursor: next })
    }
}

/// Literal prefix of a `<prefix>*` pattern whose metacharacters are `\`-escaped.
/// Other glob forms are not supported.
fn literal_prefix(pattern: &str) -> Result<&str> {
    let unsupported =
        |reason: &str| RepoError::Internal(format!("scan pattern {:?} {}", pattern, reason));
    let Some(body) = pattern.strip_suffix('*') else {
        return Err(unsupported("must end with '*'"));
    };

    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if chars.next().is_none() {
                    return Err(unsupported("ends in an escape"));
                }
            }
            '*' | '?' | '[' | ']' => {
                return Err(unsupported("uses an unsupported glob"));
            }
            _ => {}
        }
    }
    Ok(body)
}

fn unescape(escaped: &str) -> String {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.extend(chars.next()),
            c => out.push(c),
        }
    }
    out
}
