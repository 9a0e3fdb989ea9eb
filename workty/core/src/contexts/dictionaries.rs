//! Dictionaries context
//!
//! Named, mostly-static lookup tables (states, types, roles). Loaded once
//! from the store and served from cache; clients have no mutation API.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;
use workty_protocol::{ClientOp, ClientRequest};

use crate::contexts::Room;
use crate::error::{Error, Result};
use crate::model::{Dictionary, DICTIONARY_NAMES};
use crate::store::Store;

pub struct DictionariesContext {
    cache: HashMap<String, Dictionary>,
    room: Room,
}

impl DictionariesContext {
    /// Load the fixed dictionary list once; missing names are logged and
    /// skipped rather than failing tenant-root construction
    pub async fn load(store: &Arc<dyn Store>) -> Result<Arc<Self>> {
        let mut cache = HashMap::new();
        for name in DICTIONARY_NAMES {
            match store.get_dictionary(name).await? {
                Some(dictionary) => {
                    cache.insert(dictionary.name.clone(), dictionary);
                }
                None => warn!(dictionary = name, "dictionary missing from store"),
            }
        }
        Ok(Arc::new(Self {
            cache,
            room: Room::new(),
        }))
    }

    pub fn room(&self) -> &Room {
        &self.room
    }

    pub fn get(&self, name: &str) -> Option<&Dictionary> {
        self.cache.get(name)
    }

    /// True when `entry` exists in the named dictionary; used by peer
    /// contexts validating enumerated fields
    pub fn contains(&self, name: &str, entry: &str) -> bool {
        self.cache
            .get(name)
            .map(|d| d.entries.iter().any(|e| e.name == entry))
            .unwrap_or(false)
    }

    pub async fn handle(&self, _account_id: Uuid, request: ClientRequest) {
        let outcome = match request.op {
            ClientOp::RefreshAll => self.get_all(),
            other => Err(Error::bad_digest(format!(
                "dictionaries are read-only: {other:?}"
            ))),
        };
        self.room.respond(request.request_id, outcome);
    }

    pub fn get_all(&self) -> Result<Value> {
        let mut dictionaries: Vec<&Dictionary> = self.cache.values().collect();
        dictionaries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(json!({ "dictionaries": dictionaries }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn loads_fixed_list_and_serves_from_cache() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let ctx = DictionariesContext::load(&store).await.unwrap();
        let payload = ctx.get_all().unwrap();
        assert_eq!(
            payload["dictionaries"].as_array().unwrap().len(),
            DICTIONARY_NAMES.len()
        );
        assert!(ctx.contains("language-types", "default"));
        assert!(!ctx.contains("language-types", "cobol"));
    }

    #[tokio::test]
    async fn mutation_requests_are_rejected() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let ctx = DictionariesContext::load(&store).await.unwrap();
        let mut rx = ctx.room().subscribe();
        ctx.handle(
            Uuid::new_v4(),
            ClientRequest {
                request_id: None,
                op: ClientOp::Del { id: Uuid::new_v4() },
            },
        )
        .await;
        let response = rx.recv().await.unwrap();
        assert_eq!(response.err.unwrap().code, 2);
    }
}
