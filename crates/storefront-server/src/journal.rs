use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use storefront_contracts::{LogEntry, UserId};

use crate::store::Store;

/// Append-only event journal kept in the store's `log` document and capped
/// to the newest `max_entries` records.
pub struct Journal {
    store: Arc<Store>,
    max_entries: usize,
}

impl Journal {
    pub fn new(store: Arc<Store>, max_entries: usize) -> Self {
        Self {
            store,
            max_entries: max_entries.max(1),
        }
    }

    pub async fn record(&self, event_type: &str, user_id: Option<UserId>, extra: Value) {
        let extra = match extra {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        let shown = Value::Object(extra.clone());
        tracing::info!(event_type, user_id, extra = %shown, "journal");
        let entry = LogEntry {
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            user_id,
            extra,
        };
        let cap = self.max_entries;
        let written = self
            .store
            .log
            .update(|log| {
                log.push(entry);
                if log.len() > cap {
                    let overflow = log.len() - cap;
                    log.drain(..overflow);
                }
            })
            .await;
        if let Err(err) = written {
            tracing::warn!(error = %err, event_type, "journal write failed");
        }
    }

    pub async fn error(&self, place: &str, err: &(dyn std::fmt::Display + Sync), user_id: Option<UserId>) {
        tracing::error!(place, user_id, error = %err, "handler failed");
        self.record(
            "error",
            user_id,
            serde_json::json!({ "where": place, "error": err.to_string() }),
        )
        .await;
    }

    /// Newest `limit` entries not older than `window`, oldest first.
    pub async fn tail(
        &self,
        window: Option<Duration>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Vec<LogEntry> {
        self.store
            .log
            .read(|log| {
                let recent: Vec<&LogEntry> = log
                    .iter()
                    .filter(|e| window.map(|w| now - e.timestamp <= w).unwrap_or(true))
                    .collect();
                let skip = recent.len().saturating_sub(limit);
                recent.into_iter().skip(skip).cloned().collect()
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use storefront_config::Config;

    async fn journal(cap: usize) -> (Arc<Store>, Journal) {
        let store = Arc::new(Store::open(&Config::default()).await.unwrap());
        (store.clone(), Journal::new(store, cap))
    }

    #[tokio::test]
    async fn keeps_only_newest_entries() {
        let (store, journal) = journal(3).await;
        for i in 0..5 {
            journal.record("tick", None, json!({ "i": i })).await;
        }
        let log = store.log.snapshot().await;
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].extra.get("i"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn errors_carry_place_and_message() {
        let (store, journal) = journal(10).await;
        journal.error("on_photo", &"disk full", Some(9)).await;
        let log = store.log.snapshot().await;
        assert_eq!(log[0].event_type, "error");
        assert_eq!(log[0].extra.get("where"), Some(&json!("on_photo")));
        assert_eq!(log[0].user_id, Some(9));
    }

    #[tokio::test]
    async fn tail_limits_and_filters_by_window() {
        let (store, journal) = journal(100).await;
        store
            .log
            .update(|log| {
                log.push(LogEntry {
                    timestamp: Utc::now() - Duration::days(3),
                    event_type: "old".to_string(),
                    user_id: None,
                    extra: Map::new(),
                })
            })
            .await
            .unwrap();
        for _ in 0..4 {
            journal.record("fresh", None, Value::Null).await;
        }
        let day = journal.tail(Some(Duration::hours(24)), Utc::now(), 50).await;
        assert!(day.iter().all(|e| e.event_type == "fresh"));
        assert_eq!(day.len(), 4);
        let all = journal.tail(None, Utc::now(), 2).await;
        assert_eq!(all.len(), 2);
    }
}
