use anyhow::{Context, Result};
use arrow_array::{
    Array, Float32Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray, UInt32Array,
    FixedSizeListArray,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use lancedb::query::{ExecutableQuery, QueryBase};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{ChunkStore, StoreError, StoredChunk};
use crate::types::{ChunkMetadata, ChunkRecord, DocumentInfo};

/// LanceDB-backed chunk store.
///
/// The URI may be a local path or anything `lancedb::connect` accepts. The
/// corpus version counter is process-local, which matches the in-memory
/// response cache it invalidates.
pub struct LanceStore {
    db: lancedb::Connection,
    dimension: usize,
    table_name: String,
    version: AtomicU64,
}

fn escape(value: &str) -> String {
    value.replace('\'', "''")
}

impl LanceStore {
    pub async fn connect(uri: &str, dimension: usize) -> Result<Self> {
        std::fs::create_dir_all(uri).ok();
        let db = lancedb::connect(uri)
            .execute()
            .await
            .context("Failed to connect to LanceDB")?;

        let store = Self {
            db,
            dimension,
            table_name: "chunks".to_string(),
            version: AtomicU64::new(0),
        };

        store.ensure_table().await?;
        Ok(store)
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("doc_id", DataType::Utf8, false),
            Field::new("chunk_index", DataType::UInt32, false),
            Field::new("text", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimension as i32,
                ),
                true,
            ),
            Field::new("metadata_json", DataType::Utf8, false),
            Field::new("created_at", DataType::Int64, false),
        ]))
    }

    async fn ensure_table(&self) -> Result<()> {
        let names = self.db.table_names().execute().await?;
        if !names.contains(&self.table_name) {
            // Create with a single seed record, then delete it. LanceDB
            // needs at least one batch to derive the table layout.
            let schema = self.schema();
            let seed_vec = vec![0.0f32; self.dimension];
            let values = Float32Array::from(seed_vec);
            let vector_field = Field::new("item", DataType::Float32, true);
            let vector_array = FixedSizeListArray::new(
                Arc::new(vector_field),
                self.dimension as i32,
                Arc::new(values) as Arc<dyn Array>,
                None,
            );

            let batch = RecordBatch::try_new(
                schema.clone(),
                vec![
                    Arc::new(StringArray::from(vec!["__seed__"])) as Arc<dyn Array>,
                    Arc::new(StringArray::from(vec!["__seed__"])),
                    Arc::new(UInt32Array::from(vec![0u32])),
                    Arc::new(StringArray::from(vec![""])),
                    Arc::new(vector_array) as Arc<dyn Array>,
                    Arc::new(StringArray::from(vec!["{}"])),
                    Arc::new(Int64Array::from(vec![0i64])),
                ],
            )
            .context("Failed to create seed RecordBatch")?;

            let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
            self.db
                .create_table(&self.table_name, Box::new(batches))
                .execute()
                .await
                .context("Failed to create chunks table")?;

            let table = self.db.open_table(&self.table_name).execute().await?;
            table.delete("id = '__seed__'").await.ok();
        }
        Ok(())
    }

    async fn insert_batch(&self, chunks: &[ChunkRecord]) -> Result<()> {
        let table = self
            .db
            .open_table(&self.table_name)
            .execute()
            .await
            .context("Failed to open chunks table")?;

        let schema = self.schema();

        let ids: Vec<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
        let doc_ids: Vec<&str> = chunks.iter().map(|c| c.doc_id.as_str()).collect();
        let chunk_indices: Vec<u32> = chunks.iter().map(|c| c.chunk_index).collect();
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let metadata_jsons: Vec<String> = chunks
            .iter()
            .map(|c| serde_json::to_string(&c.metadata).unwrap_or_else(|_| "{}".to_string()))
            .collect();
        let metadata_refs: Vec<&str> = metadata_jsons.iter().map(|s| s.as_str()).collect();
        let created_ats: Vec<i64> = chunks.iter().map(|c| c.metadata.ingested_at).collect();

        let flat_vectors: Vec<f32> = chunks.iter().flat_map(|c| c.vector.iter().copied()).collect();
        let values = Float32Array::from(flat_vectors);
        let vector_field = Field::new("item", DataType::Float32, true);
        let vector_array = FixedSizeListArray::new(
            Arc::new(vector_field),
            self.dimension as i32,
            Arc::new(values) as Arc<dyn Array>,
            None,
        );

        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(ids)) as Arc<dyn Array>,
                Arc::new(StringArray::from(doc_ids)),
                Arc::new(UInt32Array::from(chunk_indices)),
                Arc::new(StringArray::from(texts)),
                Arc::new(vector_array) as Arc<dyn Array>,
                Arc::new(StringArray::from(metadata_refs)),
                Arc::new(Int64Array::from(created_ats)),
            ],
        )
        .context("Failed to create RecordBatch")?;

        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table
            .add(Box::new(reader))
            .execute()
            .await
            .context("Failed to insert chunks")?;

        Ok(())
    }

    async fn query_by_predicate(
        &self,
        predicate: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredChunk>> {
        let table = self.db.open_table(&self.table_name).execute().await?;

        let mut query = table.query();
        if let Some(pred) = predicate {
            query = query.only_if(pred);
        }
        query = query.limit(limit);

        let results = query.execute().await.context("LanceDB query failed")?;
        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await?;
        Ok(extract_chunks_from_batches(&batches))
    }
}

/// Run a fallible store operation, retrying once on failure. Backend blips
/// (file locks, transient IO) usually clear on the second attempt; anything
/// that fails twice is reported as unavailable.
async fn with_retry<T, F, Fut>(op_name: &str, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    match op().await {
        Ok(v) => Ok(v),
        Err(first) => {
            tracing::warn!(op = op_name, error = %first, "chunk store operation failed, retrying once");
            op().await.map_err(|second| {
                StoreError::Unavailable(format!("{}: {:#} (after retry)", op_name, second))
            })
        }
    }
}

#[async_trait]
impl ChunkStore for LanceStore {
    async fn add(&self, chunks: Vec<ChunkRecord>) -> Result<(), StoreError> {
        if chunks.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
        let existing = self.get_by_ids(&ids).await?;
        if !existing.is_empty() {
            let dupes: Vec<String> = existing.into_iter().map(|c| c.id).collect();
            return Err(StoreError::DuplicateId(dupes));
        }

        with_retry("add", || self.insert_batch(&chunks)).await?;

        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(
            inserted = chunks.len(),
            corpus_version = version,
            "inserted chunk batch"
        );
        Ok(())
    }

    async fn delete_by_document(&self, doc_id: &str) -> Result<usize, StoreError> {
        let removed = with_retry("delete_by_document", || async {
            let table = self.db.open_table(&self.table_name).execute().await?;
            let count_before = table.count_rows(None).await.unwrap_or(0);
            let predicate = format!("doc_id = '{}'", escape(doc_id));
            table.delete(&predicate).await?;
            let count_after = table.count_rows(None).await.unwrap_or(0);
            Ok(count_before.saturating_sub(count_after))
        })
        .await?;

        if removed > 0 {
            let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::info!(
                doc_id = %doc_id,
                removed = removed,
                corpus_version = version,
                "deleted document chunks"
            );
        }
        Ok(removed)
    }

    async fn semantic_search(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&str>,
    ) -> Result<Vec<StoredChunk>, StoreError> {
        if k == 0 {
            return Ok(Vec::new());
        }

        with_retry("semantic_search", || async {
            let table = self.db.open_table(&self.table_name).execute().await?;

            let mut query_builder = table.query().nearest_to(vector)?;
            query_builder = query_builder
                .distance_type(lancedb::DistanceType::Cosine)
                .limit(k);

            if let Some(predicate) = filter {
                query_builder = query_builder.only_if(predicate);
            }

            let results = query_builder
                .execute()
                .await
                .context("LanceDB vector search failed")?;

            let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await?;
            Ok(extract_chunks_from_batches(&batches))
        })
        .await
    }

    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<StoredChunk>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut all = Vec::new();
        // Query in batches to keep predicates reasonable.
        for chunk in ids.chunks(50) {
            let id_list: Vec<String> = chunk.iter().map(|id| format!("'{}'", escape(id))).collect();
            let predicate = format!("id IN ({})", id_list.join(", "));
            let hits = with_retry("get_by_ids", || {
                self.query_by_predicate(Some(&predicate), chunk.len())
            })
            .await?;
            all.extend(hits);
        }
        Ok(all)
    }

    async fn get_neighbors(
        &self,
        doc_id: &str,
        chunk_index: u32,
        window: u32,
    ) -> Result<Vec<StoredChunk>, StoreError> {
        let low = chunk_index.saturating_sub(window);
        let high = chunk_index.saturating_add(window);
        let predicate = format!(
            "doc_id = '{}' AND chunk_index >= {} AND chunk_index <= {} AND chunk_index != {}",
            escape(doc_id),
            low,
            high,
            chunk_index
        );

        let mut hits = with_retry("get_neighbors", || {
            self.query_by_predicate(Some(&predicate), (2 * window as usize).max(2))
        })
        .await?;
        hits.sort_by_key(|h| h.chunk_index);
        Ok(hits)
    }

    async fn list(
        &self,
        filter: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredChunk>, StoreError> {
        // LanceDB has no offset on plain scans; fetch limit+offset and skip.
        let hits = with_retry("list", || {
            self.query_by_predicate(filter, limit.saturating_add(offset))
        })
        .await?;
        Ok(hits.into_iter().skip(offset).collect())
    }

    async fn list_documents(&self) -> Result<Vec<DocumentInfo>, StoreError> {
        let chunks = with_retry("list_documents", || {
            self.query_by_predicate(None, usize::MAX >> 1)
        })
        .await?;

        let mut docs: HashMap<String, DocumentInfo> = HashMap::new();
        for chunk in chunks {
            let entry = docs.entry(chunk.doc_id.clone()).or_insert_with(|| DocumentInfo {
                doc_id: chunk.doc_id.clone(),
                title: chunk.metadata.title.clone(),
                source: chunk
                    .metadata
                    .extra
                    .get("source")
                    .cloned()
                    .unwrap_or_default(),
                chunk_count: 0,
            });
            entry.chunk_count += 1;
        }

        let mut out: Vec<DocumentInfo> = docs.into_values().collect();
        out.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));
        Ok(out)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        with_retry("count", || async {
            let table = self.db.open_table(&self.table_name).execute().await?;
            let count = table.count_rows(None).await?;
            Ok(count)
        })
        .await
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}

fn extract_chunks_from_batches(batches: &[RecordBatch]) -> Vec<StoredChunk> {
    let mut hits = Vec::new();
    for batch in batches {
        let ids = batch.column_by_name("id").and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let doc_ids = batch.column_by_name("doc_id").and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let chunk_indices = batch.column_by_name("chunk_index").and_then(|c| c.as_any().downcast_ref::<UInt32Array>());
        let texts = batch.column_by_name("text").and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let metadata_jsons = batch.column_by_name("metadata_json").and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let distances = batch.column_by_name("_distance").and_then(|c| c.as_any().downcast_ref::<Float32Array>());

        let (Some(ids), Some(doc_ids), Some(texts)) = (ids, doc_ids, texts) else {
            continue;
        };

        for i in 0..batch.num_rows() {
            let id = ids.value(i);
            if id == "__seed__" {
                continue;
            }

            // Cosine distance is in [0, 2]; similarity = 1 - distance keeps
            // the full [-1, 1] range rather than clamping to 0.
            let score = distances.map(|d| 1.0 - d.value(i)).unwrap_or(0.0);

            let metadata: ChunkMetadata = metadata_jsons
                .map(|m| serde_json::from_str(m.value(i)).unwrap_or_default())
                .unwrap_or_default();

            hits.push(StoredChunk {
                id: id.to_string(),
                doc_id: doc_ids.value(i).to_string(),
                chunk_index: chunk_indices.map(|c| c.value(i)).unwrap_or(0),
                text: texts.value(i).to_string(),
                metadata,
                score,
            });
        }
    }
    hits
}
