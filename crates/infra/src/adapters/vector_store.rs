//! Vector store adapter.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::{AdapterError, CallLog, record_call};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub values: Vec<f32>,
    #[serde(default)]
    pub metadata: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMatch {
    pub id: String,
    pub score: f32,
    pub metadata: JsonValue,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, namespace: &str, vectors: Vec<VectorRecord>) -> Result<(), AdapterError>;

    /// `filter` is matched as a subset of each record's metadata object.
    async fn query(
        &self,
        namespace: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&JsonValue>,
    ) -> Result<Vec<VectorMatch>, AdapterError>;

    async fn delete_ids(&self, namespace: &str, ids: &[String]) -> Result<(), AdapterError>;
}

/// In-memory vector store using cosine similarity.
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    namespaces: RwLock<BTreeMap<String, BTreeMap<String, VectorRecord>>>,
    calls: CallLog,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_call_log(mut self, calls: CallLog) -> Self {
        self.calls = calls;
        self
    }

    pub fn count(&self, namespace: &str) -> usize {
        self.namespaces
            .read()
            .map(|n| n.get(namespace).map(|v| v.len()).unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn poisoned() -> AdapterError {
        AdapterError::Unavailable("vector store lock poisoned".to_string())
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

fn metadata_matches(metadata: &JsonValue, filter: &JsonValue) -> bool {
    match (metadata, filter) {
        (JsonValue::Object(m), JsonValue::Object(f)) => {
            f.iter().all(|(k, v)| m.get(k).is_some_and(|mv| mv == v))
        }
        (_, JsonValue::Null) => true,
        _ => false,
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, namespace: &str, vectors: Vec<VectorRecord>) -> Result<(), AdapterError> {
        record_call(&self.calls, format!("vector.upsert({namespace},{})", vectors.len()));
        let mut namespaces = self.namespaces.write().map_err(|_| Self::poisoned())?;
        let ns = namespaces.entry(namespace.to_string()).or_default();
        for v in vectors {
            ns.insert(v.id.clone(), v);
        }
        Ok(())
    }

    async fn query(
        &self,
        namespace: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&JsonValue>,
    ) -> Result<Vec<VectorMatch>, AdapterError> {
        let namespaces = self.namespaces.read().map_err(|_| Self::poisoned())?;
        let Some(ns) = namespaces.get(namespace) else {
            return Ok(Vec::new());
        };

        let mut matches: Vec<VectorMatch> = ns
            .values()
            .filter(|r| filter.is_none_or(|f| metadata_matches(&r.metadata, f)))
            .map(|r| VectorMatch {
                id: r.id.clone(),
                score: cosine(vector, &r.values),
                metadata: r.metadata.clone(),
            })
            .collect();
        matches.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        matches.truncate(k);
        Ok(matches)
    }

    async fn delete_ids(&self, namespace: &str, ids: &[String]) -> Result<(), AdapterError> {
        record_call(&self.calls, format!("vector.delete_ids({namespace},[{}])", ids.join(",")));
        let mut namespaces = self.namespaces.write().map_err(|_| Self::poisoned())?;
        if let Some(ns) = namespaces.get_mut(namespace) {
            for id in ids {
                ns.remove(id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, values: Vec<f32>, metadata: JsonValue) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            values,
            metadata,
        }
    }

    #[tokio::test]
    async fn query_ranks_by_similarity_and_filters() {
        let store = InMemoryVectorStore::new();
        store
            .upsert(
                "n",
                vec![
                    record("a", vec![1.0, 0.0], serde_json::json!({ "doc": "x" })),
                    record("b", vec![0.7, 0.7], serde_json::json!({ "doc": "x" })),
                    record("c", vec![0.0, 1.0], serde_json::json!({ "doc": "y" })),
                ],
            )
            .await
            .unwrap();

        let all = store.query("n", &[1.0, 0.0], 2, None).await.unwrap();
        assert_eq!(all.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(), ["a", "b"]);

        let filter = serde_json::json!({ "doc": "y" });
        let only_y = store.query("n", &[1.0, 0.0], 5, Some(&filter)).await.unwrap();
        assert_eq!(only_y.len(), 1);
        assert_eq!(only_y[0].id, "c");
    }

    #[tokio::test]
    async fn delete_ids_is_idempotent() {
        let store = InMemoryVectorStore::new();
        store
            .upsert("n", vec![record("a", vec![1.0], JsonValue::Null)])
            .await
            .unwrap();
        let ids = vec!["a".to_string(), "missing".to_string()];
        store.delete_ids("n", &ids).await.unwrap();
        store.delete_ids("n", &ids).await.unwrap();
        assert_eq!(store.count("n"), 0);
        assert_eq!(store.calls().len(), 3);
    }
}
