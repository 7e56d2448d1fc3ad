//! In-memory mirror of the upstream market-data feeds.
//!
//! Three fixed slots, each holding the latest payload for one logical feed
//! together with its update time. Writers (the subscription manager) replace
//! a slot atomically; readers (IPC handlers) always observe a complete prior
//! snapshot. There is no eviction and a populated slot is never cleared.

use std::sync::RwLock;

use serde::Serialize;
use serde_json::Value;

use crate::util::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Mids,
    AssetCtxs,
    PerpMetas,
}

#[derive(Debug, Clone)]
struct CacheSlot {
    payload: Value,
    updated_at: i64,
}

#[derive(Debug, Default)]
pub struct Cache {
    mids: RwLock<Option<CacheSlot>>,
    asset_ctxs: RwLock<Option<CacheSlot>>,
    perp_metas: RwLock<Option<CacheSlot>>,
}

/// Per-slot presence and age, as reported by `getStatus`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    pub has_mids: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mids_age_ms: Option<i64>,
    pub has_asset_ctxs: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_ctxs_age_ms: Option<i64>,
    pub has_perp_metas: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub perp_metas_age_ms: Option<i64>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, slot: Slot) -> &RwLock<Option<CacheSlot>> {
        match slot {
            Slot::Mids => &self.mids,
            Slot::AssetCtxs => &self.asset_ctxs,
            Slot::PerpMetas => &self.perp_metas,
        }
    }

    /// Replace the slot's payload and stamp it with the current time.
    pub fn put(&self, slot: Slot, payload: Value) {
        let fresh = CacheSlot {
            payload,
            updated_at: now_ms(),
        };
        *self.cell(slot).write().unwrap() = Some(fresh);
    }

    /// Latest payload and its update time, or `None` if never populated.
    pub fn get(&self, slot: Slot) -> Option<(Value, i64)> {
        self.cell(slot)
            .read()
            .unwrap()
            .as_ref()
            .map(|s| (s.payload.clone(), s.updated_at))
    }

    pub fn status(&self) -> CacheStatus {
        let now = now_ms();
        let age = |slot: Slot| -> Option<i64> {
            self.cell(slot)
                .read()
                .unwrap()
                .as_ref()
                .map(|s| (now - s.updated_at).max(0))
        };
        let mids_age_ms = age(Slot::Mids);
        let asset_ctxs_age_ms = age(Slot::AssetCtxs);
        let perp_metas_age_ms = age(Slot::PerpMetas);
        CacheStatus {
            has_mids: mids_age_ms.is_some(),
            mids_age_ms,
            has_asset_ctxs: asset_ctxs_age_ms.is_some(),
            asset_ctxs_age_ms,
            has_perp_metas: perp_metas_age_ms.is_some(),
            perp_metas_age_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_on_empty_slot_is_none() {
        let cache = Cache::new();
        assert!(cache.get(Slot::Mids).is_none());
    }

    #[test]
    fn put_then_get_returns_latest_with_fresh_stamp() {
        let cache = Cache::new();
        let before = now_ms();
        cache.put(Slot::Mids, json!({"BTC": "50000"}));
        let (payload, updated_at) = cache.get(Slot::Mids).unwrap();
        assert_eq!(payload["BTC"], "50000");
        assert!(updated_at >= before);

        cache.put(Slot::Mids, json!({"BTC": "50001"}));
        let (payload, second_at) = cache.get(Slot::Mids).unwrap();
        assert_eq!(payload["BTC"], "50001");
        assert!(second_at >= updated_at);
    }

    #[test]
    fn slots_are_independent() {
        let cache = Cache::new();
        cache.put(Slot::Mids, json!({"BTC": "50000"}));
        assert!(cache.get(Slot::AssetCtxs).is_none());
        assert!(cache.get(Slot::PerpMetas).is_none());
    }

    #[test]
    fn status_reports_presence_and_age() {
        let cache = Cache::new();
        cache.put(Slot::Mids, json!({"BTC": "50000"}));
        let st = cache.status();
        assert!(st.has_mids);
        assert!(st.mids_age_ms.unwrap() >= 0);
        assert!(!st.has_asset_ctxs);
        assert!(st.asset_ctxs_age_ms.is_none());
        assert!(!st.has_perp_metas);
    }

    #[test]
    fn concurrent_writers_and_readers_do_not_tear() {
        use std::sync::Arc;
        let cache = Arc::new(Cache::new());
        let mut threads = Vec::new();
        for i in 0..4 {
            let cache = Arc::clone(&cache);
            threads.push(std::thread::spawn(move || {
                for n in 0..250 {
                    cache.put(Slot::Mids, json!({"BTC": format!("{}", i * 1000 + n)}));
                }
            }));
        }
        for _ in 0..1000 {
            if let Some((payload, _)) = cache.get(Slot::Mids) {
                // Every observed snapshot is a complete mapping.
                assert!(payload.get("BTC").is_some());
            }
        }
        for t in threads {
            t.join().unwrap();
        }
    }
}
