use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Value;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;

use super::Reranker;

/// ONNX cross-encoder (ms-marco MiniLM family) running on the blocking pool.
///
/// A single session is shared process-wide; the semaphore bounds concurrent
/// inference to what the accelerator can hold.
pub struct CrossEncoderReranker {
    session: Arc<Mutex<Session>>,
    tokenizer: Arc<tokenizers::Tokenizer>,
    limiter: Arc<Semaphore>,
    max_length: usize,
}

impl CrossEncoderReranker {
    pub fn new(model_dir: &Path) -> Result<Self> {
        let model_path = Self::find_model(model_dir)?;
        let tokenizer_path = model_dir.join("tokenizer.json");

        if !tokenizer_path.exists() {
            return Err(anyhow!(
                "Tokenizer not found at: {}",
                tokenizer_path.display()
            ));
        }

        let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer: {:?}", e))?;

        let model_bytes = std::fs::read(&model_path)?;
        let session = Session::builder()
            .map_err(|e| anyhow!("Session builder: {:?}", e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| anyhow!("Opt level: {:?}", e))?
            .commit_from_memory(&model_bytes)
            .map_err(|e| anyhow!("Failed to load cross-encoder model: {:?}", e))?;

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            tokenizer: Arc::new(tokenizer),
            limiter: Arc::new(Semaphore::new(1)),
            max_length: 512,
        })
    }

    fn find_model(model_dir: &Path) -> Result<PathBuf> {
        let candidates = [
            model_dir.join("model_O4.onnx"),
            model_dir.join("model.onnx"),
        ];
        for path in &candidates {
            if path.exists() {
                return Ok(path.clone());
            }
        }
        Err(anyhow!(
            "No cross-encoder model found in: {}",
            model_dir.display()
        ))
    }

    /// Tokenize and score one batch of pairs. Runs synchronously; callers
    /// dispatch it to the blocking pool.
    fn score_batch_sync(
        session: &Arc<Mutex<Session>>,
        tokenizer: &tokenizers::Tokenizer,
        max_length: usize,
        query: &str,
        batch: &[(String, String)],
    ) -> Result<Vec<(String, f32)>> {
        // Pair each encoding with its candidate so alignment survives
        // tokenization failures.
        let mut scored: Vec<(String, f32)> = Vec::with_capacity(batch.len());
        let mut paired: Vec<(usize, tokenizers::Encoding)> = Vec::with_capacity(batch.len());

        for (i, candidate) in batch.iter().enumerate() {
            match tokenizer.encode((query, candidate.1.as_str()), true) {
                Ok(enc) => paired.push((i, enc)),
                Err(e) => {
                    tracing::warn!(id = %candidate.0, "cross-encoder tokenization failed: {:?}", e);
                    scored.push((candidate.0.clone(), f32::MIN));
                }
            }
        }

        if paired.is_empty() {
            return Ok(scored);
        }

        let max_len = paired
            .iter()
            .map(|(_, e)| e.get_ids().len().min(max_length))
            .max()
            .unwrap_or(128);
        let batch_size = paired.len();

        let mut ids_flat = Vec::with_capacity(batch_size * max_len);
        let mut mask_flat = Vec::with_capacity(batch_size * max_len);
        let mut type_flat = Vec::with_capacity(batch_size * max_len);

        for (_, enc) in &paired {
            let len = enc.get_ids().len().min(max_len);
            for i in 0..len {
                ids_flat.push(enc.get_ids()[i] as i64);
                mask_flat.push(enc.get_attention_mask()[i] as i64);
                type_flat.push(enc.get_type_ids()[i] as i64);
            }
            for _ in len..max_len {
                ids_flat.push(0i64);
                mask_flat.push(0i64);
                type_flat.push(0i64);
            }
        }

        let shape = vec![batch_size, max_len];
        let input_ids = Value::from_array((shape.clone(), ids_flat))
            .map_err(|e| anyhow!("batch input_ids: {:?}", e))?;
        let attention_mask = Value::from_array((shape.clone(), mask_flat))
            .map_err(|e| anyhow!("batch attention_mask: {:?}", e))?;
        let token_type_ids = Value::from_array((shape, type_flat))
            .map_err(|e| anyhow!("batch token_type_ids: {:?}", e))?;

        let inputs = ort::inputs![
            "input_ids" => input_ids,
            "attention_mask" => attention_mask,
            "token_type_ids" => token_type_ids,
        ];

        let mut session = session.lock();
        let outputs = session
            .run(inputs)
            .map_err(|e| anyhow!("Cross-encoder inference failed: {:?}", e))?;

        // logits shape: [batch_size, 1] — one relevance score per pair.
        let output_key = outputs
            .iter()
            .next()
            .map(|(name, _)| name.to_string())
            .unwrap_or_else(|| "logits".to_string());
        let (_shape, data) = outputs[output_key.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| anyhow!("Failed to extract logits: {:?}", e))?;

        for (pos, (orig_idx, _)) in paired.iter().enumerate() {
            let score = data.get(pos).copied().unwrap_or(f32::MIN);
            scored.push((batch[*orig_idx].0.clone(), score));
        }

        Ok(scored)
    }
}

#[async_trait]
impl Reranker for CrossEncoderReranker {
    async fn score_pairs(
        &self,
        query: &str,
        candidates: &[(String, String)],
    ) -> Result<Vec<(String, f32)>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| anyhow!("cross-encoder limiter closed"))?;

        const MAX_BATCH: usize = 16;

        let session = Arc::clone(&self.session);
        let tokenizer = Arc::clone(&self.tokenizer);
        let max_length = self.max_length;
        let query = query.to_string();
        let candidates = candidates.to_vec();

        let scores = tokio::task::spawn_blocking(move || {
            let mut all: Vec<(String, f32)> = Vec::with_capacity(candidates.len());
            for batch in candidates.chunks(MAX_BATCH) {
                let scored =
                    Self::score_batch_sync(&session, &tokenizer, max_length, &query, batch)?;
                all.extend(scored);
            }
            Ok::<_, anyhow::Error>(all)
        })
        .await
        .map_err(|e| anyhow!("cross-encoder task panicked: {}", e))??;

        Ok(scores)
    }
}
