//! Local sentence-BERT inference with tract.
//!
//! Pure-Rust path: loads the ONNX export with tract-onnx, tokenizes with the
//! tokenizers crate, runs inference in `spawn_blocking`. No ONNX Runtime or
//! system deps.
//!
//! The export is expected to produce an `output` tensor that is already
//! mean-pooled and L2-normalized (`[batch, dims]`). Raw transformer exports
//! that return `last_hidden_state` (`[batch, seq, dims]`) are mean-pooled
//! over the attention mask here instead. Either way the vector width comes
//! from the model; [`super::Embedder`] rejects one that differs from
//! `embedding.dims`.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokenizers::{Encoding, Tokenizer};
use tract_onnx::prelude::*;

use super::{normalize_l2, TextEmbedder};
use crate::config::EmbeddingConfig;

type Plan = TypedRunnableModel<TypedModel>;

pub struct OnnxEmbedder {
    model: Arc<Plan>,
    tokenizer: Arc<Tokenizer>,
    /// Name of each model input, in declaration order.
    input_names: Vec<String>,
    max_seq_len: usize,
}

impl OnnxEmbedder {
    /// Load the model and tokenizer named by `embedding.model_path` and
    /// `embedding.tokenizer_path`.
    pub fn load(config: &EmbeddingConfig) -> Result<Self> {
        let model_path = config
            .model_path
            .as_ref()
            .context("embedding.model_path is required for provider 'onnx'")?;
        let tokenizer_path = config
            .tokenizer_path
            .as_ref()
            .context("embedding.tokenizer_path is required for provider 'onnx'")?;

        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow!("Load tokenizer {}: {}", tokenizer_path.display(), e))?;

        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .map_err(|e| anyhow!("Load ONNX {}: {}", model_path.display(), e))?
            .into_optimized()
            .map_err(|e| anyhow!("Optimize: {}", e))?
            .into_runnable()
            .map_err(|e| anyhow!("Build tract runnable: {}", e))?;

        let graph = model.model();
        let input_names = graph
            .input_outlets()
            .map_err(|e| anyhow!("Model inputs: {}", e))?
            .iter()
            .map(|outlet| graph.node(outlet.node).name.clone())
            .collect::<Vec<_>>();
        tracing::info!(model = %model_path.display(), inputs = ?input_names, "Loaded ONNX model");

        Ok(Self {
            model: Arc::new(model),
            tokenizer: Arc::new(tokenizer),
            input_names,
            max_seq_len: config.max_seq_len,
        })
    }
}

#[async_trait]
impl TextEmbedder for OnnxEmbedder {
    fn model_name(&self) -> &str {
        "onnx"
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>> {
        let model = self.model.clone();
        let tokenizer = self.tokenizer.clone();
        let input_names = self.input_names.clone();
        let max_seq_len = self.max_seq_len;
        let texts = texts.to_vec();

        let vectors = tokio::task::spawn_blocking(move || {
            run_model(&model, &tokenizer, &input_names, max_seq_len, &texts)
        })
        .await??;
        Ok(vectors.into_iter().map(Some).collect())
    }
}

fn run_model(
    model: &Plan,
    tokenizer: &Tokenizer,
    input_names: &[String],
    max_seq_len: usize,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }

    let encodings: Vec<Encoding> = texts
        .iter()
        .map(|s| {
            tokenizer
                .encode(s.as_str(), true)
                .map_err(|e| anyhow!("Tokenize: {}", e))
        })
        .collect::<Result<Vec<_>>>()?;

    let max_len = encodings
        .iter()
        .map(|e| e.get_ids().len())
        .max()
        .unwrap_or(1)
        .clamp(1, max_seq_len);

    let batch = encodings.len();
    let mut input_ids = vec![0i64; batch * max_len];
    let mut attention_mask = vec![0i64; batch * max_len];
    let mut token_type_ids = vec![0i64; batch * max_len];

    for (i, enc) in encodings.iter().enumerate() {
        let ids = enc.get_ids();
        let types = enc.get_type_ids();
        let len = ids.len().min(max_len);
        for j in 0..len {
            input_ids[i * max_len + j] = ids[j] as i64;
            attention_mask[i * max_len + j] = 1;
            token_type_ids[i * max_len + j] = types.get(j).copied().unwrap_or(0) as i64;
        }
    }

    let to_tensor = |data: Vec<i64>| -> Result<Tensor> {
        Ok(ndarray::Array2::from_shape_vec((batch, max_len), data)
            .map_err(|e| anyhow!("Input shape: {}", e))?
            .into())
    };
    let ids_t = to_tensor(input_ids)?;
    let mask_t = to_tensor(attention_mask.clone())?;
    let types_t = to_tensor(token_type_ids)?;

    let mut inputs: TVec<TValue> = TVec::new();
    for (pos, name) in input_names.iter().enumerate() {
        let tensor = match (name.as_str(), pos) {
            ("input_ids", _) => ids_t.clone(),
            ("attention_mask", _) => mask_t.clone(),
            ("token_type_ids", _) => types_t.clone(),
            (_, 0) => ids_t.clone(),
            (_, 1) => mask_t.clone(),
            (_, 2) => types_t.clone(),
            (other, _) => bail!("Unsupported model input '{}'", other),
        };
        inputs.push(tensor.into());
    }

    let result = model.run(inputs)?;
    let output = result
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("No output tensor"))?;
    let view = output
        .to_array_view::<f32>()
        .map_err(|e| anyhow!("Output to array: {}", e))?;

    let mask = ndarray::ArrayView2::from_shape((batch, max_len), attention_mask.as_slice())
        .map_err(|e| anyhow!("Mask shape: {}", e))?;
    pool_output(view, mask)
}

/// Turn the model output into one L2-normalized vector per input.
///
/// `[batch, width]` outputs are taken as-is. `[batch, seq, width]` outputs
/// are mean-pooled over the tokens whose `mask` entry is non-zero. The full
/// `width` is kept; a model whose width differs from `embedding.dims` is
/// rejected later by the dimension check.
fn pool_output(
    output: ndarray::ArrayViewD<'_, f32>,
    mask: ndarray::ArrayView2<'_, i64>,
) -> Result<Vec<Vec<f32>>> {
    let shape = output.shape().to_vec();
    match shape.len() {
        2 => Ok(output
            .outer_iter()
            .map(|row| normalize_l2(row.iter().copied().collect()))
            .collect()),
        3 => {
            if shape[0] != mask.nrows() {
                bail!("Output batch {} does not match input batch {}", shape[0], mask.nrows());
            }
            let seq_len = shape[1].min(mask.ncols());
            let mut embeddings = Vec::with_capacity(shape[0]);
            for (i, tokens) in output.outer_iter().enumerate() {
                let mut sum = vec![0f32; shape[2]];
                let mut count = 0f32;
                for (j, token) in tokens.outer_iter().take(seq_len).enumerate() {
                    if mask[[i, j]] == 0 {
                        continue;
                    }
                    for (acc, &v) in sum.iter_mut().zip(token.iter()) {
                        *acc += v;
                    }
                    count += 1.0;
                }
                if count > 0.0 {
                    for x in &mut sum {
                        *x /= count;
                    }
                }
                embeddings.push(normalize_l2(sum));
            }
            Ok(embeddings)
        }
        _ => bail!("Unexpected output shape: {:?}", shape),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr2, Array3};

    #[test]
    fn test_pool_output_ignores_padding() {
        // second token of row 0 and third token of row 1 are padding
        let output = Array3::from_shape_vec(
            (2, 3, 2),
            vec![
                3.0, 0.0, 100.0, 100.0, 5.0, 0.0, //
                0.0, 2.0, 0.0, 4.0, -50.0, 9.0,
            ],
        )
        .unwrap();
        let mask = arr2(&[[1i64, 0, 1], [1, 1, 0]]);

        let pooled = pool_output(output.view().into_dyn(), mask.view()).unwrap();
        assert_eq!(pooled, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_pool_output_keeps_full_width() {
        let output = Array3::<f32>::ones((1, 3, 768));
        let mask = arr2(&[[1i64, 1, 1]]);

        let pooled = pool_output(output.view().into_dyn(), mask.view()).unwrap();
        assert_eq!(pooled.len(), 1);
        assert_eq!(pooled[0].len(), 768);
    }

    #[test]
    fn test_pool_output_sentence_embeddings() {
        let output = arr2(&[[3.0f32, 4.0], [0.0, -2.0]]);
        let mask = arr2(&[[1i64], [1]]);

        let pooled = pool_output(output.view().into_dyn(), mask.view()).unwrap();
        assert_eq!(pooled, vec![vec![0.6, 0.8], vec![0.0, -1.0]]);
    }

    #[test]
    fn test_pool_output_rejects_other_ranks() {
        let output = ndarray::Array1::<f32>::zeros(4);
        let mask = arr2(&[[1i64]]);
        assert!(pool_output(output.view().into_dyn(), mask.view()).is_err());
    }
}
