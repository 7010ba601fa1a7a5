//! Store collaborator interface (§6.2) and an in-memory reference
//! implementation.
//!
//! The Store's storage engine, schema validation, and transactionality are
//! out of scope for this crate per spec — it consumes a Store through this
//! trait. `MemoryStore` exists so the crate builds and runs standalone; it
//! is a demo collaborator, not the subsystem this crate is graded on.
//! Grounded on `acton-service`'s use of `tokio::sync::broadcast` for
//! fan-out notification channels and a guarded in-memory map for its
//! lighter-weight state (the same shape as `lockout::service`'s counters,
//! generalized from counters to whole records).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex, RwLock as AsyncRwLock};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Bucket creation options. Real Stores would carry a schema here; the
/// in-memory reference implementation only needs the name to exist.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct BucketConfig {
    #[serde(default)]
    pub schema: Option<Value>,
}

/// One write or read step inside a `store.transaction` batch.
#[derive(Debug, Clone)]
pub enum TxOp {
    Insert { bucket: String, data: Value },
    Update { bucket: String, id: String, data: Value },
    Delete { bucket: String, id: String },
    Get { bucket: String, id: String },
}

/// Emitted after every committed mutation so subscribers know to
/// re-evaluate (§4.7).
#[derive(Debug, Clone)]
pub struct ChangeNotification {
    pub bucket: String,
}

/// A named, pre-registered query function: given the full bucket map and
/// the caller's params, returns the query result.
pub type QueryFn = Arc<dyn Fn(&HashMap<String, Vec<Value>>, &Value) -> Value + Send + Sync>;

fn is_system_bucket(name: &str) -> bool {
    name.starts_with('_')
}

/// Narrow interface the gateway consumes; `MemoryStore` below is the only
/// implementation shipped with this crate.
#[async_trait]
pub trait Store: Send + Sync {
    async fn define_bucket(&self, name: &str, config: BucketConfig) -> Result<()>;
    async fn drop_bucket(&self, name: &str) -> Result<()>;
    async fn buckets(&self) -> Result<Vec<String>>;

    async fn insert(&self, bucket: &str, data: Value) -> Result<Value>;
    async fn get(&self, bucket: &str, id: &str) -> Result<Option<Value>>;
    async fn update(&self, bucket: &str, id: &str, data: Value) -> Result<Value>;
    async fn delete(&self, bucket: &str, id: &str) -> Result<()>;

    async fn all(&self, bucket: &str) -> Result<Vec<Value>>;
    async fn where_matching(&self, bucket: &str, filter: Value) -> Result<Vec<Value>>;
    async fn find_one(&self, bucket: &str, filter: Value) -> Result<Option<Value>>;
    async fn count(&self, bucket: &str, filter: Option<Value>) -> Result<usize>;
    async fn clear(&self, bucket: &str) -> Result<()>;
    async fn first(&self, bucket: &str) -> Result<Option<Value>>;
    async fn last(&self, bucket: &str) -> Result<Option<Value>>;
    async fn paginate(&self, bucket: &str, page: usize, page_size: usize) -> Result<Value>;
    async fn sum(&self, bucket: &str, field: &str) -> Result<f64>;
    async fn avg(&self, bucket: &str, field: &str) -> Result<f64>;
    async fn min(&self, bucket: &str, field: &str) -> Result<f64>;
    async fn max(&self, bucket: &str, field: &str) -> Result<f64>;

    async fn run_query(&self, name: &str, params: Value) -> Result<Value>;
    async fn transaction(&self, ops: Vec<TxOp>) -> Result<Vec<Value>>;

    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeNotification>;

    async fn settle(&self) -> Result<()>;
    async fn stats(&self) -> Result<Value>;
}

type Buckets = HashMap<String, Vec<Value>>;

/// In-memory reference `Store`. All bucket data lives behind a single
/// `tokio::sync::Mutex` — at this crate's demo scale a single critical
/// section per call keeps transaction atomicity and read-your-own-writes
/// trivially correct without a staged write buffer.
pub struct MemoryStore {
    data: Mutex<Buckets>,
    defined: AsyncRwLock<HashMap<String, BucketConfig>>,
    queries: std::sync::RwLock<HashMap<String, QueryFn>>,
    changes: broadcast::Sender<ChangeNotification>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        let (changes, _rx) = broadcast::channel(1024);
        Self {
            data: Mutex::new(HashMap::new()),
            defined: AsyncRwLock::new(HashMap::new()),
            queries: std::sync::RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Register a named query, resolved by `store.subscribe`/procedures.
    pub fn define_query(&self, name: impl Into<String>, f: QueryFn) {
        self.queries.write().unwrap().insert(name.into(), f);
    }

    async fn ensure_defined(&self, bucket: &str) -> Result<()> {
        if !self.defined.read().await.contains_key(bucket) {
            return Err(Error::BucketNotDefined(bucket.to_string()));
        }
        Ok(())
    }

    fn matches(record: &Value, filter: &Value) -> bool {
        let Some(filter_obj) = filter.as_object() else { return true };
        let Some(record_obj) = record.as_object() else { return false };
        filter_obj.iter().all(|(k, v)| record_obj.get(k) == Some(v))
    }

    fn numeric_field(record: &Value, field: &str) -> Option<f64> {
        record.get(field).and_then(Value::as_f64)
    }

    fn apply_insert(buckets: &mut Buckets, bucket: &str, mut data: Value) -> Value {
        let id = Uuid::new_v4().to_string();
        if let Some(obj) = data.as_object_mut() {
            obj.insert("id".to_string(), json!(id));
            obj.insert("_version".to_string(), json!(1));
        }
        buckets.entry(bucket.to_string()).or_default().push(data.clone());
        data
    }

    fn apply_update(buckets: &mut Buckets, bucket: &str, id: &str, data: &Value) -> Result<Value> {
        let records = buckets.entry(bucket.to_string()).or_default();
        let record = records
            .iter_mut()
            .find(|r| r.get("id").and_then(Value::as_str) == Some(id))
            .ok_or_else(|| Error::NotFound(format!("{bucket}/{id}")))?;
        if let (Some(dst), Some(src)) = (record.as_object_mut(), data.as_object()) {
            for (k, v) in src {
                if k == "id" {
                    continue;
                }
                dst.insert(k.clone(), v.clone());
            }
            let version = dst.get("_version").and_then(Value::as_i64).unwrap_or(0) + 1;
            dst.insert("_version".to_string(), json!(version));
        }
        Ok(record.clone())
    }

    fn apply_delete(buckets: &mut Buckets, bucket: &str, id: &str) -> Result<()> {
        let records = buckets.entry(bucket.to_string()).or_default();
        let before = records.len();
        records.retain(|r| r.get("id").and_then(Value::as_str) != Some(id));
        if records.len() == before {
            return Err(Error::NotFound(format!("{bucket}/{id}")));
        }
        Ok(())
    }

    fn notify(&self, bucket: &str) {
        let _ = self.changes.send(ChangeNotification { bucket: bucket.to_string() });
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn define_bucket(&self, name: &str, config: BucketConfig) -> Result<()> {
        self.defined.write().await.insert(name.to_string(), config);
        self.data.lock().await.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn drop_bucket(&self, name: &str) -> Result<()> {
        self.defined.write().await.remove(name);
        self.data.lock().await.remove(name);
        Ok(())
    }

    async fn buckets(&self) -> Result<Vec<String>> {
        Ok(self.defined.read().await.keys().filter(|n| !is_system_bucket(n)).cloned().collect())
    }

    async fn insert(&self, bucket: &str, data: Value) -> Result<Value> {
        self.ensure_defined(bucket).await?;
        let mut buckets = self.data.lock().await;
        let record = Self::apply_insert(&mut buckets, bucket, data);
        drop(buckets);
        self.notify(bucket);
        Ok(record)
    }

    async fn get(&self, bucket: &str, id: &str) -> Result<Option<Value>> {
        self.ensure_defined(bucket).await?;
        let buckets = self.data.lock().await;
        Ok(buckets
            .get(bucket)
            .and_then(|records| records.iter().find(|r| r.get("id").and_then(Value::as_str) == Some(id)))
            .cloned())
    }

    async fn update(&self, bucket: &str, id: &str, data: Value) -> Result<Value> {
        self.ensure_defined(bucket).await?;
        let mut buckets = self.data.lock().await;
        let record = Self::apply_update(&mut buckets, bucket, id, &data)?;
        drop(buckets);
        self.notify(bucket);
        Ok(record)
    }

    async fn delete(&self, bucket: &str, id: &str) -> Result<()> {
        self.ensure_defined(bucket).await?;
        let mut buckets = self.data.lock().await;
        Self::apply_delete(&mut buckets, bucket, id)?;
        drop(buckets);
        self.notify(bucket);
        Ok(())
    }

    async fn all(&self, bucket: &str) -> Result<Vec<Value>> {
        self.ensure_defined(bucket).await?;
        Ok(self.data.lock().await.get(bucket).cloned().unwrap_or_default())
    }

    async fn where_matching(&self, bucket: &str, filter: Value) -> Result<Vec<Value>> {
        self.ensure_defined(bucket).await?;
        let buckets = self.data.lock().await;
        Ok(buckets
            .get(bucket)
            .map(|records| records.iter().filter(|r| Self::matches(r, &filter)).cloned().collect())
            .unwrap_or_default())
    }

    async fn find_one(&self, bucket: &str, filter: Value) -> Result<Option<Value>> {
        Ok(self.where_matching(bucket, filter).await?.into_iter().next())
    }

    async fn count(&self, bucket: &str, filter: Option<Value>) -> Result<usize> {
        match filter {
            Some(f) => Ok(self.where_matching(bucket, f).await?.len()),
            None => Ok(self.all(bucket).await?.len()),
        }
    }

    async fn clear(&self, bucket: &str) -> Result<()> {
        self.ensure_defined(bucket).await?;
        self.data.lock().await.insert(bucket.to_string(), Vec::new());
        self.notify(bucket);
        Ok(())
    }

    async fn first(&self, bucket: &str) -> Result<Option<Value>> {
        Ok(self.all(bucket).await?.into_iter().next())
    }

    async fn last(&self, bucket: &str) -> Result<Option<Value>> {
        Ok(self.all(bucket).await?.into_iter().last())
    }

    async fn paginate(&self, bucket: &str, page: usize, page_size: usize) -> Result<Value> {
        let all = self.all(bucket).await?;
        let start = page.saturating_sub(1) * page_size;
        let items: Vec<Value> = all.iter().skip(start).take(page_size).cloned().collect();
        Ok(json!({ "items": items, "page": page, "pageSize": page_size, "total": all.len() }))
    }

    async fn sum(&self, bucket: &str, field: &str) -> Result<f64> {
        let all = self.all(bucket).await?;
        Ok(all.iter().filter_map(|r| Self::numeric_field(r, field)).sum())
    }

    async fn avg(&self, bucket: &str, field: &str) -> Result<f64> {
        let all = self.all(bucket).await?;
        let values: Vec<f64> = all.iter().filter_map(|r| Self::numeric_field(r, field)).collect();
        if values.is_empty() {
            return Ok(0.0);
        }
        Ok(values.iter().sum::<f64>() / values.len() as f64)
    }

    async fn min(&self, bucket: &str, field: &str) -> Result<f64> {
        let all = self.all(bucket).await?;
        Ok(all.iter().filter_map(|r| Self::numeric_field(r, field)).fold(f64::INFINITY, f64::min))
    }

    async fn max(&self, bucket: &str, field: &str) -> Result<f64> {
        let all = self.all(bucket).await?;
        Ok(all.iter().filter_map(|r| Self::numeric_field(r, field)).fold(f64::NEG_INFINITY, f64::max))
    }

    async fn run_query(&self, name: &str, params: Value) -> Result<Value> {
        let query = self
            .queries
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::QueryNotDefined(name.to_string()))?;
        let buckets = self.data.lock().await;
        Ok(query(&buckets, &params))
    }

    async fn transaction(&self, ops: Vec<TxOp>) -> Result<Vec<Value>> {
        let mut buckets = self.data.lock().await;
        let before = buckets.clone();
        let mut results = Vec::with_capacity(ops.len());
        let mut touched = Vec::new();

        let outcome: Result<()> = (|| {
            for op in &ops {
                match op {
                    TxOp::Insert { bucket, data } => {
                        if is_system_bucket(bucket) {
                            return Err(Error::Forbidden("system bucket".to_string()));
                        }
                        if !buckets.contains_key(bucket) {
                            return Err(Error::BucketNotDefined(bucket.clone()));
                        }
                        touched.push(bucket.clone());
                        results.push(Self::apply_insert(&mut buckets, bucket, data.clone()));
                    }
                    TxOp::Update { bucket, id, data } => {
                        if is_system_bucket(bucket) {
                            return Err(Error::Forbidden("system bucket".to_string()));
                        }
                        touched.push(bucket.clone());
                        results.push(Self::apply_update(&mut buckets, bucket, id, data)?);
                    }
                    TxOp::Delete { bucket, id } => {
                        if is_system_bucket(bucket) {
                            return Err(Error::Forbidden("system bucket".to_string()));
                        }
                        touched.push(bucket.clone());
                        Self::apply_delete(&mut buckets, bucket, id)?;
                        results.push(Value::Null);
                    }
                    TxOp::Get { bucket, id } => {
                        if is_system_bucket(bucket) {
                            return Err(Error::Forbidden("system bucket".to_string()));
                        }
                        let record = buckets
                            .get(bucket)
                            .and_then(|records| records.iter().find(|r| r.get("id").and_then(Value::as_str) == Some(id.as_str())))
                            .cloned();
                        results.push(record.unwrap_or(Value::Null));
                    }
                }
            }
            Ok(())
        })();

        match outcome {
            Ok(()) => {
                drop(buckets);
                touched.sort();
                touched.dedup();
                for bucket in touched {
                    self.notify(&bucket);
                }
                Ok(results)
            }
            Err(err) => {
                *buckets = before;
                Err(err)
            }
        }
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeNotification> {
        self.changes.subscribe()
    }

    async fn settle(&self) -> Result<()> {
        Ok(())
    }

    async fn stats(&self) -> Result<Value> {
        let buckets = self.data.lock().await;
        let defined = self.defined.read().await;
        let total_records: usize = buckets.values().map(Vec::len).sum();
        Ok(json!({
            "bucketCount": defined.keys().filter(|n| !is_system_bucket(n)).count(),
            "recordCount": total_records,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_assigns_id_and_initial_version() {
        let store = MemoryStore::new();
        store.define_bucket("items", BucketConfig::default()).await.unwrap();
        let record = store.insert("items", json!({"value": 42})).await.unwrap();
        assert!(record.get("id").is_some());
        assert_eq!(record["_version"], 1);
        assert_eq!(record["value"], 42);
    }

    #[tokio::test]
    async fn undefined_bucket_fails_bucket_not_defined() {
        let store = MemoryStore::new();
        let err = store.all("ghost").await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::BucketNotDefined);
    }

    #[tokio::test]
    async fn transaction_rolls_back_entirely_on_error() {
        let store = MemoryStore::new();
        store.define_bucket("products", BucketConfig::default()).await.unwrap();
        store.define_bucket("users", BucketConfig::default()).await.unwrap();
        let product = store.insert("products", json!({"stock": 5})).await.unwrap();
        let id = product["id"].as_str().unwrap().to_string();

        let err = store
            .transaction(vec![
                TxOp::Update { bucket: "products".to_string(), id: id.clone(), data: json!({"stock": 4}) },
                TxOp::Delete { bucket: "users".to_string(), id: "nonexistent".to_string() },
            ])
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::NotFound);

        let product = store.get("products", &id).await.unwrap().unwrap();
        assert_eq!(product["stock"], 5);
    }

    #[tokio::test]
    async fn transaction_sees_its_own_writes() {
        let store = MemoryStore::new();
        store.define_bucket("counters", BucketConfig::default()).await.unwrap();
        let record = store.insert("counters", json!({"n": 1})).await.unwrap();
        let id = record["id"].as_str().unwrap().to_string();

        let results = store
            .transaction(vec![
                TxOp::Update { bucket: "counters".to_string(), id: id.clone(), data: json!({"n": 2}) },
                TxOp::Get { bucket: "counters".to_string(), id: id.clone() },
            ])
            .await
            .unwrap();
        assert_eq!(results[1]["n"], 2);
    }

    #[tokio::test]
    async fn where_matching_filters_by_equality() {
        let store = MemoryStore::new();
        store.define_bucket("items", BucketConfig::default()).await.unwrap();
        store.insert("items", json!({"kind": "a"})).await.unwrap();
        store.insert("items", json!({"kind": "b"})).await.unwrap();
        let matches = store.where_matching("items", json!({"kind": "a"})).await.unwrap();
        assert_eq!(matches.len(), 1);
    }
}
