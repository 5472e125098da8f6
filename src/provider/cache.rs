//! Opt-in response cache.
//!
//! Keyed by a SHA-256 over everything that shapes a response: model, attempt
//! label, messages and tool schemas. The attempt label is part of the key so
//! sibling candidates never collapse onto one cached answer. The cache holds
//! at most `capacity` responses and evicts the oldest insert first.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use super::{CompletionRequest, CompletionResponse};

/// Capacity used by [`ResponseCache::new`].
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct Entries {
    responses: HashMap<String, CompletionResponse>,
    order: VecDeque<String>,
}

#[derive(Debug)]
pub struct ResponseCache {
    capacity: usize,
    entries: Mutex<Entries>,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cache holding at most `capacity` responses. Zero disables storage.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(Entries::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Cache key for a request.
    pub fn key(request: &CompletionRequest) -> String {
        let mut hasher = Sha256::new();
        hasher.update(request.model.as_bytes());
        hasher.update([0u8]);
        hasher.update(request.meta.attempt.as_bytes());
        hasher.update([0u8]);
        for message in &request.messages {
            // Serializing a Message cannot fail: all fields are plain data.
            let encoded = serde_json::to_vec(message).unwrap_or_default();
            hasher.update(&encoded);
            hasher.update([0u8]);
        }
        for tool in &request.tools {
            hasher.update(tool.name.as_bytes());
            hasher.update(tool.parameters.to_string().as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    pub fn get(&self, key: &str) -> Option<CompletionResponse> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.responses.get(key).cloned()
    }

    /// Insert unless another writer got there first, evicting the oldest
    /// entries past capacity.
    pub fn insert(&self, key: String, response: CompletionResponse) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.responses.contains_key(&key) {
            return;
        }
        while entries.responses.len() >= self.capacity {
            let Some(oldest) = entries.order.pop_front() else {
                break;
            };
            entries.responses.remove(&oldest);
        }
        entries.order.push_back(key.clone());
        entries.responses.insert(key, response);
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .responses
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::echo::{Message, MessageKind};
    use crate::provider::{CallPurpose, RequestMeta, Usage};

    fn request(attempt: &str, prompt: &str) -> CompletionRequest {
        CompletionRequest {
            model: "m".into(),
            messages: vec![
                Message::system("sys"),
                Message::user(MessageKind::Prompt, prompt),
            ],
            tools: vec![],
            meta: RequestMeta {
                execution_id: "exec".into(),
                phase: "p".into(),
                attempt: attempt.into(),
                purpose: CallPurpose::Turn,
            },
        }
    }

    fn response(text: &str) -> CompletionResponse {
        CompletionResponse {
            content: text.into(),
            tool_calls: vec![],
            usage: Usage::default(),
        }
    }

    #[test]
    fn test_key_is_stable_and_attempt_scoped() {
        let a = ResponseCache::key(&request("r0.s0.c0", "hi"));
        assert_eq!(a, ResponseCache::key(&request("r0.s0.c0", "hi")));
        assert_ne!(a, ResponseCache::key(&request("r0.s0.c1", "hi")));
        assert_ne!(a, ResponseCache::key(&request("r0.s0.c0", "hello")));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_first_insert_wins() {
        let cache = ResponseCache::new();
        cache.insert("k".into(), response("first"));
        cache.insert("k".into(), response("second"));
        assert_eq!(cache.get("k").unwrap().content, "first");
        assert_eq!(cache.len(), 1);
        assert!(cache.get("missing").is_none());
    }

    #[test]
    fn test_capacity_evicts_oldest_first() {
        let cache = ResponseCache::with_capacity(3);
        for i in 0..100 {
            cache.insert(format!("k{}", i), response(&format!("v{}", i)));
            assert!(cache.len() <= 3);
        }
        assert_eq!(cache.len(), 3);
        assert!(cache.get("k0").is_none());
        assert!(cache.get("k96").is_none());
        assert_eq!(cache.get("k97").unwrap().content, "v97");
        assert_eq!(cache.get("k99").unwrap().content, "v99");
    }

    #[test]
    fn test_repeat_insert_does_not_refresh_order() {
        let cache = ResponseCache::with_capacity(2);
        cache.insert("a".into(), response("a"));
        cache.insert("b".into(), response("b"));
        cache.insert("a".into(), response("a2"));
        cache.insert("c".into(), response("c"));
        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("b").unwrap().content, "b");
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_zero_capacity_stores_nothing() {
        let cache = ResponseCache::with_capacity(0);
        cache.insert("k".into(), response("v"));
        assert!(cache.is_empty());
    }
}
