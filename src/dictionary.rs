//! Shared dictionary encoding for string columns.
//!
//! String columns store `u64` codes; the [`Dictionary`] owns the
//! bidirectional code↔string mapping. Several columns may share one
//! dictionary through an `Arc` (a materialized copy of a string column
//! inherits its source's dictionary instead of re-encoding).
//!
//! Two synchronization concerns are kept apart:
//! - the **maps** live under a reader/writer lock; `encode` does an
//!   optimistic shared-lock lookup and only takes the write lock to insert;
//! - **readiness** is a flag + condition variable. A dictionary received
//!   over the network is only marked ready once its full content has been
//!   deserialized; readers that translate codes block on
//!   [`Dictionary::wait_ready`] first.
//!
//! Transport is byte-accurate: each entry is serialized as
//! `<code:u64 LE, len:u64 LE, bytes>`, in ascending code order.

use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};

struct Maps {
    code_to_string: BTreeMap<u64, String>,
    string_to_code: HashMap<String, u64>,
}

/// Bidirectional string↔code mapping with a readiness protocol.
pub struct Dictionary {
    maps: RwLock<Maps>,
    ready: Mutex<bool>,
    ready_cv: Condvar,
}

impl Dictionary {
    pub fn new() -> Self {
        Self {
            maps: RwLock::new(Maps {
                code_to_string: BTreeMap::new(),
                string_to_code: HashMap::new(),
            }),
            ready: Mutex::new(false),
            ready_cv: Condvar::new(),
        }
    }

    /// Return the code for `value`, inserting it if unseen.
    ///
    /// Fast path holds only the read lock; the write lock is taken for the
    /// insert and re-checked, since another encoder may have won the race.
    pub fn encode(&self, value: &str) -> u64 {
        {
            let maps = self.maps.read();
            if let Some(&code) = maps.string_to_code.get(value) {
                return code;
            }
        }
        let mut maps = self.maps.write();
        if let Some(&code) = maps.string_to_code.get(value) {
            return code;
        }
        let code = maps.string_to_code.len() as u64;
        maps.string_to_code.insert(value.to_string(), code);
        maps.code_to_string.insert(code, value.to_string());
        code
    }

    /// Insert an explicit `code -> value` pair (dictionary files carry
    /// pre-assigned codes).
    pub fn insert(&self, code: u64, value: &str) {
        let mut maps = self.maps.write();
        maps.string_to_code.insert(value.to_string(), code);
        maps.code_to_string.insert(code, value.to_string());
    }

    pub fn contains_value(&self, value: &str) -> bool {
        self.maps.read().string_to_code.contains_key(value)
    }

    pub fn contains_code(&self, code: u64) -> bool {
        self.maps.read().code_to_string.contains_key(&code)
    }

    pub fn code_for(&self, value: &str) -> Option<u64> {
        self.maps.read().string_to_code.get(value).copied()
    }

    pub fn value_for(&self, code: u64) -> Option<String> {
        self.maps.read().code_to_string.get(&code).cloned()
    }

    pub fn len(&self) -> usize {
        self.maps.read().code_to_string.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Codes of all strings lexicographically within `[start, end]`.
    pub fn codes_in_range(&self, start: &str, end: &str) -> HashSet<u64> {
        let maps = self.maps.read();
        maps.string_to_code
            .iter()
            .filter(|(key, _)| key.as_str() >= start && key.as_str() <= end)
            .map(|(_, &code)| code)
            .collect()
    }

    /// Codes of all strings matching an SQL LIKE pattern where `%` matches
    /// any run of characters.
    pub fn matching_codes(&self, pattern: &str) -> HashSet<u64> {
        let maps = self.maps.read();
        maps.string_to_code
            .iter()
            .filter(|(key, _)| matches_wildcard(key.as_bytes(), pattern.as_bytes()))
            .map(|(_, &code)| code)
            .collect()
    }

    /// Codes of all strings satisfying an arbitrary predicate (ordered
    /// string comparisons of the filter operator).
    pub fn codes_where(&self, predicate: impl Fn(&str) -> bool) -> HashSet<u64> {
        let maps = self.maps.read();
        maps.string_to_code
            .iter()
            .filter(|(key, _)| predicate(key))
            .map(|(_, &code)| code)
            .collect()
    }

    /// Approximate memory footprint of the dictionary content in bytes.
    pub fn approx_size(&self) -> usize {
        let maps = self.maps.read();
        let mut size = 0;
        for (code, value) in &maps.code_to_string {
            size += std::mem::size_of_val(code) + value.len();
        }
        for (value, code) in &maps.string_to_code {
            size += value.len() + std::mem::size_of_val(code);
        }
        size + maps.code_to_string.len() + maps.string_to_code.len()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.lock()
    }

    /// Mark the content final and wake everyone blocked in `wait_ready`.
    pub fn set_ready(&self) {
        let mut ready = self.ready.lock();
        *ready = true;
        self.ready_cv.notify_all();
    }

    /// Block until [`set_ready`](Self::set_ready) has been called.
    pub fn wait_ready(&self) {
        let mut ready = self.ready.lock();
        while !*ready {
            self.ready_cv.wait(&mut ready);
        }
    }

    /// Serialize every entry as `<code:u64, len:u64, bytes>` in ascending
    /// code order.
    pub fn serialize(&self) -> Vec<u8> {
        let maps = self.maps.read();
        let mut out = Vec::new();
        for (code, value) in &maps.code_to_string {
            out.extend_from_slice(&code.to_le_bytes());
            out.extend_from_slice(&(value.len() as u64).to_le_bytes());
            out.extend_from_slice(value.as_bytes());
        }
        out
    }

    /// Rebuild a dictionary from its serialized form and mark it ready.
    pub fn deserialize(bytes: &[u8]) -> anyhow::Result<Self> {
        let dict = Self::new();
        let mut cursor = 0usize;
        while cursor < bytes.len() {
            if cursor + 16 > bytes.len() {
                anyhow::bail!("truncated dictionary entry header");
            }
            let code = u64::from_le_bytes(bytes[cursor..cursor + 8].try_into()?);
            let len = u64::from_le_bytes(bytes[cursor + 8..cursor + 16].try_into()?) as usize;
            cursor += 16;
            if cursor + len > bytes.len() {
                anyhow::bail!("truncated dictionary entry payload");
            }
            let value = std::str::from_utf8(&bytes[cursor..cursor + len])?;
            dict.insert(code, value);
            cursor += len;
        }
        dict.set_ready();
        Ok(dict)
    }

    pub fn clear(&self) {
        let mut maps = self.maps.write();
        maps.code_to_string.clear();
        maps.string_to_code.clear();
    }
}

impl Default for Dictionary {
    fn default() -> Self {
        Self::new()
    }
}

/// Recursive `%`-wildcard matcher. A `%` run matches any (possibly empty)
/// substring; everything else matches byte for byte.
fn matches_wildcard(text: &[u8], pattern: &[u8]) -> bool {
    let mut pi = 0;
    let mut ti = 0;
    while pi < pattern.len() {
        if pattern[pi] == b'%' {
            while pi < pattern.len() && pattern[pi] == b'%' {
                pi += 1;
            }
            if pi == pattern.len() {
                return true;
            }
            for start in ti..=text.len() {
                if matches_wildcard(&text[start..], &pattern[pi..]) {
                    return true;
                }
            }
            return false;
        }
        if ti >= text.len() || text[ti] != pattern[pi] {
            return false;
        }
        ti += 1;
        pi += 1;
    }
    ti == text.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_is_idempotent() {
        let dict = Dictionary::new();
        let a = dict.encode("alpha");
        let b = dict.encode("beta");
        assert_ne!(a, b);
        assert_eq!(dict.encode("alpha"), a);
        assert_eq!(dict.value_for(b).as_deref(), Some("beta"));
    }

    #[test]
    fn wildcard_multi_run() {
        assert!(matches_wildcard(b"warehouse", b"w%house"));
        assert!(matches_wildcard(b"warehouse", b"%are%se"));
        assert!(matches_wildcard(b"warehouse", b"%"));
        assert!(!matches_wildcard(b"warehouse", b"w%housing"));
        assert!(!matches_wildcard(b"warehouse", b"arehouse"));
    }

    #[test]
    fn serialization_round_trip_is_byte_accurate() {
        let dict = Dictionary::new();
        dict.encode("aa");
        dict.encode("b");
        let bytes = dict.serialize();
        // <0,2,"aa"> then <1,1,"b">
        assert_eq!(bytes.len(), 16 + 2 + 16 + 1);
        assert_eq!(&bytes[0..8], &0u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &2u64.to_le_bytes());
        assert_eq!(&bytes[16..18], b"aa");

        let back = Dictionary::deserialize(&bytes).unwrap();
        assert!(back.is_ready());
        assert_eq!(back.code_for("aa"), Some(0));
        assert_eq!(back.code_for("b"), Some(1));
    }
}
