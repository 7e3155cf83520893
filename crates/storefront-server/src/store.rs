//! Flat document store: one JSON document per collection, each guarded by its
//! own async mutex so writes to a collection are serialised.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use storefront_config::Config;
use storefront_contracts::{LogEntry, Order, Product, ShopSettings, UserDirectory};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io failed: {0}")]
    Io(String),
    #[error("store encode failed: {0}")]
    Encode(String),
    #[error("sqlite store failed: {0}")]
    Sqlite(String),
}

enum DocumentBackend {
    Memory,
    Json { dir: PathBuf },
    Sqlite(Mutex<Connection>),
}

impl DocumentBackend {
    fn from_config(cfg: &Config) -> Result<Self, StoreError> {
        match cfg.store.kind.as_str() {
            "json" => {
                let dir = cfg
                    .store
                    .data_dir
                    .clone()
                    .ok_or_else(|| StoreError::Io("store.data_dir is required".to_string()))?;
                std::fs::create_dir_all(&dir).map_err(|e| StoreError::Io(e.to_string()))?;
                Ok(DocumentBackend::Json {
                    dir: PathBuf::from(dir),
                })
            }
            "sqlite" => {
                let path = cfg.store.sqlite_path.clone().ok_or_else(|| {
                    StoreError::Sqlite("store.sqlite_path is required".to_string())
                })?;
                let conn = Connection::open(path).map_err(|e| StoreError::Sqlite(e.to_string()))?;
                conn.execute_batch(
                    "
                    CREATE TABLE IF NOT EXISTS documents (
                        name TEXT PRIMARY KEY,
                        body TEXT NOT NULL
                    );
                    ",
                )
                .map_err(|e| StoreError::Sqlite(e.to_string()))?;
                Ok(DocumentBackend::Sqlite(Mutex::new(conn)))
            }
            _ => Ok(DocumentBackend::Memory),
        }
    }

    /// Absent or unreadable documents come back as `None`; callers fall back to a default.
    async fn load(&self, name: &str) -> Option<String> {
        match self {
            DocumentBackend::Memory => None,
            DocumentBackend::Json { dir } => {
                tokio::fs::read_to_string(document_path(dir, name)).await.ok()
            }
            DocumentBackend::Sqlite(conn) => {
                let conn = conn.lock().await;
                conn.query_row(
                    "SELECT body FROM documents WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()
                .ok()
                .flatten()
            }
        }
    }

    async fn save(&self, name: &str, body: String) -> Result<(), StoreError> {
        match self {
            DocumentBackend::Memory => Ok(()),
            DocumentBackend::Json { dir } => {
                let path = document_path(dir, name);
                let staging = path.with_extension("json.tmp");
                tokio::fs::write(&staging, body)
                    .await
                    .map_err(|e| StoreError::Io(e.to_string()))?;
                tokio::fs::rename(&staging, &path)
                    .await
                    .map_err(|e| StoreError::Io(e.to_string()))
            }
            DocumentBackend::Sqlite(conn) => {
                let conn = conn.lock().await;
                conn.execute(
                    "INSERT OR REPLACE INTO documents(name, body) VALUES (?1, ?2)",
                    params![name, body],
                )
                .map_err(|e| StoreError::Sqlite(e.to_string()))?;
                Ok(())
            }
        }
    }
}

fn document_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.json"))
}

pub struct Collection<T> {
    name: &'static str,
    backend: Arc<DocumentBackend>,
    data: Mutex<T>,
}

impl<T> Collection<T>
where
    T: Serialize + DeserializeOwned + Default + Clone + Send,
{
    async fn open(name: &'static str, backend: Arc<DocumentBackend>) -> Self {
        let data = match backend.load(name).await {
            Some(body) => serde_json::from_str(&body).unwrap_or_else(|err| {
                tracing::warn!(collection = name, error = %err, "unreadable document, starting empty");
                T::default()
            }),
            None => T::default(),
        };
        Self {
            name,
            backend,
            data: Mutex::new(data),
        }
    }

    /// Holds the collection until the guard drops. Pair with [`Collection::commit`].
    pub async fn lock(&self) -> MutexGuard<'_, T> {
        self.data.lock().await
    }

    /// Persists the whole document. Call while still holding the guard from [`Collection::lock`].
    pub async fn commit(&self, data: &T) -> Result<(), StoreError> {
        let body =
            serde_json::to_string_pretty(data).map_err(|e| StoreError::Encode(e.to_string()))?;
        self.backend.save(self.name, body).await
    }

    pub async fn snapshot(&self) -> T {
        self.data.lock().await.clone()
    }

    pub async fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.data.lock().await;
        f(&guard)
    }

    pub async fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, StoreError> {
        let mut guard = self.data.lock().await;
        let out = f(&mut guard);
        self.commit(&guard).await?;
        Ok(out)
    }
}

/// The five flat collections. When a handler needs several at once it locks
/// them in field order: users, products, orders, settings, log.
pub struct Store {
    pub users: Collection<UserDirectory>,
    pub products: Collection<Vec<Product>>,
    pub orders: Collection<Vec<Order>>,
    pub settings: Collection<ShopSettings>,
    pub log: Collection<Vec<LogEntry>>,
}

impl Store {
    pub async fn open(cfg: &Config) -> Result<Self, StoreError> {
        let backend = Arc::new(DocumentBackend::from_config(cfg)?);
        let store = Self {
            users: Collection::open("users", backend.clone()).await,
            products: Collection::open("products", backend.clone()).await,
            orders: Collection::open("orders", backend.clone()).await,
            settings: Collection::open("settings", backend.clone()).await,
            log: Collection::open("log", backend).await,
        };
        let default_password = cfg.shop.default_admin_password.clone();
        store
            .settings
            .update(|s| {
                if s.admin_password.is_empty() {
                    s.admin_password = default_password;
                }
            })
            .await?;
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};
    use storefront_contracts::{ProductKind, User};

    fn nanos() -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos()
    }

    fn product(id: u64) -> Product {
        Product {
            id,
            title: format!("Blade {id}"),
            kind: ProductKind::Weapon,
            category: "melee".to_string(),
            price: 10 * id,
            description: String::new(),
        }
    }

    #[tokio::test]
    async fn memory_store_seeds_admin_password() {
        let store = Store::open(&Config::default()).await.unwrap();
        let settings = store.settings.snapshot().await;
        assert_eq!(settings.admin_password, "1234");
        assert!(store.products.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn json_store_persists_across_reopen() {
        let dir = std::env::temp_dir().join(format!("storefront-json-{}", nanos()));
        let mut cfg = Config::default();
        cfg.store.kind = "json".to_string();
        cfg.store.data_dir = Some(dir.to_string_lossy().to_string());

        {
            let store = Store::open(&cfg).await.unwrap();
            store.products.update(|p| p.push(product(1))).await.unwrap();
            store
                .users
                .update(|u| {
                    u.insert(5, User::default());
                })
                .await
                .unwrap();
        }

        let reopened = Store::open(&cfg).await.unwrap();
        assert_eq!(reopened.products.snapshot().await, vec![product(1)]);
        assert!(reopened.users.read(|u| u.contains_key(&5)).await);
        assert!(dir.join("products.json").exists());
    }

    #[tokio::test]
    async fn json_store_treats_garbage_as_empty() {
        let dir = std::env::temp_dir().join(format!("storefront-garbage-{}", nanos()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("orders.json"), "{not json").unwrap();
        let mut cfg = Config::default();
        cfg.store.kind = "json".to_string();
        cfg.store.data_dir = Some(dir.to_string_lossy().to_string());

        let store = Store::open(&cfg).await.unwrap();
        assert!(store.orders.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn sqlite_store_persists_documents() {
        let path = std::env::temp_dir().join(format!("storefront-{}.db", nanos()));
        let mut cfg = Config::default();
        cfg.store.kind = "sqlite".to_string();
        cfg.store.sqlite_path = Some(path.to_string_lossy().to_string());

        {
            let store = Store::open(&cfg).await.unwrap();
            store
                .settings
                .update(|s| s.payment_phone = "+99360000000".to_string())
                .await
                .unwrap();
        }

        let reopened = Store::open(&cfg).await.unwrap();
        assert_eq!(
            reopened.settings.snapshot().await.payment_phone,
            "+99360000000"
        );
        assert_eq!(reopened.settings.snapshot().await.admin_password, "1234");
    }
}
