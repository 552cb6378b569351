//! CLIP text encoders.
//!
//! The transformer is built from an in-memory weight map rather than a
//! memory-mapped file so LoRA deltas and textual-inversion rows can be
//! folded in by rebuilding.

use anyhow::{bail, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{Embedding, LayerNorm, Linear, VarBuilder};
use seedalchemy_runtime_api::{EncodedPrompt, TextEncoder};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tokenizers::{AddedToken, Tokenizer};
use tracing::{debug, warn};

const TOKEN_EMBEDDING: &str = "text_model.embeddings.token_embedding.weight";
const PROJECTION: &str = "text_projection.weight";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    QuickGelu,
    Gelu,
}

impl Activation {
    fn apply(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::QuickGelu => xs * candle_nn::ops::sigmoid(&(xs * 1.702)?)?,
            Self::Gelu => xs.gelu_erf(),
        }
    }
}

/// Subset of a transformers `CLIPTextConfig`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClipConfig {
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    #[serde(default = "default_max_positions")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_activation")]
    pub hidden_act: Activation,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

fn default_vocab_size() -> usize {
    49408
}

fn default_max_positions() -> usize {
    77
}

fn default_activation() -> Activation {
    Activation::QuickGelu
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

impl ClipConfig {
    /// OpenAI ViT-L/14, used by SD 1.x and as the first SDXL encoder.
    pub fn vit_l() -> Self {
        Self {
            vocab_size: default_vocab_size(),
            hidden_size: 768,
            intermediate_size: 3072,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            max_position_embeddings: 77,
            hidden_act: Activation::QuickGelu,
            layer_norm_eps: 1e-5,
        }
    }

    /// OpenCLIP ViT-H/14 as shipped with SD 2.x (last layer dropped).
    pub fn vit_h() -> Self {
        Self {
            hidden_size: 1024,
            intermediate_size: 4096,
            num_hidden_layers: 23,
            num_attention_heads: 16,
            hidden_act: Activation::Gelu,
            ..Self::vit_l()
        }
    }

    /// OpenCLIP ViT-bigG/14, the second SDXL encoder and the refiner's.
    pub fn vit_big_g() -> Self {
        Self {
            hidden_size: 1280,
            intermediate_size: 5120,
            num_hidden_layers: 32,
            num_attention_heads: 20,
            hidden_act: Activation::Gelu,
            ..Self::vit_l()
        }
    }
}

/// Which hidden state the denoiser is conditioned on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HiddenOutput {
    /// Final layer after the closing layer norm
    Last,
    /// Input to the final layer, without layer norm
    Penultimate,
}

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    heads: usize,
    head_dim: usize,
}

impl Attention {
    fn new(vb: VarBuilder, config: &ClipConfig) -> candle_core::Result<Self> {
        let hidden = config.hidden_size;
        Ok(Self {
            q_proj: candle_nn::linear(hidden, hidden, vb.pp("q_proj"))?,
            k_proj: candle_nn::linear(hidden, hidden, vb.pp("k_proj"))?,
            v_proj: candle_nn::linear(hidden, hidden, vb.pp("v_proj"))?,
            out_proj: candle_nn::linear(hidden, hidden, vb.pp("out_proj"))?,
            heads: config.num_attention_heads,
            head_dim: hidden / config.num_attention_heads,
        })
    }

    fn forward(&self, xs: &Tensor, mask: &Tensor) -> candle_core::Result<Tensor> {
        let (b, t, c) = xs.dims3()?;
        let split = |x: Tensor| {
            x.reshape((b, t, self.heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let scale = (self.head_dim as f64).powf(-0.5);
        let q = split((self.q_proj.forward(xs)? * scale)?)?;
        let k = split(self.k_proj.forward(xs)?)?;
        let v = split(self.v_proj.forward(xs)?)?;

        let dtype = q.dtype();
        let weights = q.matmul(&k.t()?.contiguous()?)?.broadcast_add(mask)?;
        let weights = candle_nn::ops::softmax_last_dim(&weights.to_dtype(DType::F32)?)?.to_dtype(dtype)?;
        let out = weights.matmul(&v)?.transpose(1, 2)?.reshape((b, t, c))?;
        self.out_proj.forward(&out)
    }
}

struct EncoderLayer {
    layer_norm1: LayerNorm,
    self_attn: Attention,
    layer_norm2: LayerNorm,
    fc1: Linear,
    fc2: Linear,
    activation: Activation,
}

impl EncoderLayer {
    fn new(vb: VarBuilder, config: &ClipConfig) -> candle_core::Result<Self> {
        let hidden = config.hidden_size;
        let eps = config.layer_norm_eps;
        Ok(Self {
            layer_norm1: candle_nn::layer_norm(hidden, eps, vb.pp("layer_norm1"))?,
            self_attn: Attention::new(vb.pp("self_attn"), config)?,
            layer_norm2: candle_nn::layer_norm(hidden, eps, vb.pp("layer_norm2"))?,
            fc1: candle_nn::linear(hidden, config.intermediate_size, vb.pp("mlp.fc1"))?,
            fc2: candle_nn::linear(config.intermediate_size, hidden, vb.pp("mlp.fc2"))?,
            activation: config.hidden_act,
        })
    }

    fn forward(&self, xs: &Tensor, mask: &Tensor) -> candle_core::Result<Tensor> {
        let residual = xs;
        let xs = self.self_attn.forward(&self.layer_norm1.forward(xs)?, mask)?;
        let xs = (residual + xs)?;
        let residual = &xs;
        let hidden = self.activation.apply(&self.fc1.forward(&self.layer_norm2.forward(&xs)?)?)?;
        residual + self.fc2.forward(&hidden)?
    }
}

struct ClipTextModel {
    token_embedding: Embedding,
    position_embedding: Embedding,
    layers: Vec<EncoderLayer>,
    final_layer_norm: LayerNorm,
    projection: Option<Linear>,
}

impl ClipTextModel {
    fn new(vb: VarBuilder, config: &ClipConfig, projection: Option<usize>) -> candle_core::Result<Self> {
        let text = vb.pp("text_model");
        let embeddings = text.pp("embeddings");
        let hidden = config.hidden_size;
        let layers = (0..config.num_hidden_layers)
            .map(|i| EncoderLayer::new(text.pp(format!("encoder.layers.{i}")), config))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let projection = match projection {
            Some(dim) => Some(candle_nn::linear_no_bias(hidden, dim, vb.pp("text_projection"))?),
            None => None,
        };

        Ok(Self {
            token_embedding: candle_nn::embedding(config.vocab_size, hidden, embeddings.pp("token_embedding"))?,
            position_embedding: candle_nn::embedding(
                config.max_position_embeddings,
                hidden,
                embeddings.pp("position_embedding"),
            )?,
            layers,
            final_layer_norm: candle_nn::layer_norm(hidden, config.layer_norm_eps, text.pp("final_layer_norm"))?,
            projection,
        })
    }

    /// Returns `(last, penultimate)` hidden states, both before the final norm.
    fn forward(&self, input_ids: &Tensor) -> candle_core::Result<(Tensor, Tensor)> {
        let (_, seq) = input_ids.dims2()?;
        let positions = Tensor::arange(0u32, seq as u32, input_ids.device())?.unsqueeze(0)?;
        let mut xs = self
            .token_embedding
            .forward(input_ids)?
            .broadcast_add(&self.position_embedding.forward(&positions)?)?;
        let mask = causal_mask(seq, xs.device(), xs.dtype())?;

        let mut penultimate = xs.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            if i + 1 == self.layers.len() {
                penultimate = xs.clone();
            }
            xs = layer.forward(&xs, &mask)?;
        }
        Ok((xs, penultimate))
    }
}

fn causal_mask(seq: usize, device: &Device, dtype: DType) -> candle_core::Result<Tensor> {
    let mask: Vec<f32> = (0..seq)
        .flat_map(|i| (0..seq).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Tensor::from_vec(mask, (seq, seq), device)?.to_dtype(dtype)
}

/// Pick the vectors meant for an encoder of width `hidden` out of a
/// textual-inversion file, as `[vectors, hidden]`.
///
/// SDXL files name their halves `clip_l` and `clip_g`; older files carry a
/// single tensor (`emb_params` or the token itself).
pub fn inversion_vectors(tensors: &HashMap<String, Tensor>, hidden: usize) -> Result<Option<Tensor>> {
    let named = match hidden {
        768 => tensors.get("clip_l"),
        1280 => tensors.get("clip_g"),
        _ => None,
    };
    let mut candidates: Vec<(&String, &Tensor)> = tensors.iter().collect();
    candidates.sort_by(|a, b| a.0.cmp(b.0));
    let found = named.or_else(|| {
        candidates
            .into_iter()
            .map(|(_, t)| t)
            .find(|t| t.dims().last() == Some(&hidden))
    });

    match found {
        Some(tensor) if tensor.dims().last() == Some(&hidden) => {
            Ok(Some(tensor.reshape(((), hidden))?.to_dtype(DType::F32)?))
        }
        _ => Ok(None),
    }
}

pub struct ClipTextEncoder {
    config: ClipConfig,
    output: HiddenOutput,
    tokenizer: Tokenizer,
    model: ClipTextModel,
    /// Weights as loaded, textual-inversion rows included
    base: HashMap<String, Tensor>,
    projection: Option<usize>,
    inversions: Vec<(String, usize)>,
    bos: u32,
    eos: u32,
    pad: u32,
    device: Device,
    dtype: DType,
}

impl ClipTextEncoder {
    /// `pad_with_eos` is false for the OpenCLIP encoders, which pad with `!`.
    pub fn load(
        weights: &Path,
        tokenizer: &Path,
        config: ClipConfig,
        output: HiddenOutput,
        pad_with_eos: bool,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let mut tokenizer = Tokenizer::from_file(tokenizer)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))?;
        tokenizer
            .with_truncation(None)
            .map_err(|e| anyhow::anyhow!("Failed to configure tokenizer: {}", e))?;
        tokenizer.with_padding(None);

        let token = |t: &str| {
            tokenizer
                .token_to_id(t)
                .ok_or_else(|| anyhow::anyhow!("Tokenizer has no {} token", t))
        };
        let bos = token("<|startoftext|>")?;
        let eos = token("<|endoftext|>")?;
        let pad = if pad_with_eos { eos } else { token("!")? };

        let base = candle_core::safetensors::load(weights, device)?;
        let projection = base.get(PROJECTION).map(|w| w.dims()[0]);
        let model = ClipTextModel::new(VarBuilder::from_tensors(base.clone(), dtype, device), &config, projection)?;
        debug!(
            "Loaded text encoder ({} layers, width {}, projection {:?})",
            config.num_hidden_layers, config.hidden_size, projection
        );

        Ok(Self {
            config,
            output,
            tokenizer,
            model,
            base,
            projection,
            inversions: Vec::new(),
            bos,
            eos,
            pad,
            device: device.clone(),
            dtype,
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    /// Register `token` (and `token_1`, `token_2`, ... for extra vectors)
    /// with the given embedding rows. Call [`Self::rebuild`] afterwards.
    pub fn add_inversion(&mut self, token: &str, vectors: &Tensor) -> Result<()> {
        let (count, width) = vectors.dims2()?;
        if width != self.config.hidden_size || count == 0 {
            bail!("Embedding for {} has shape {:?}", token, vectors.dims());
        }
        let Some(table) = self.base.get(TOKEN_EMBEDDING) else {
            bail!("Text encoder has no token embedding");
        };

        let names: Vec<String> = std::iter::once(token.to_string())
            .chain((1..count).map(|i| format!("{token}_{i}")))
            .collect();
        if names.iter().any(|n| self.tokenizer.token_to_id(n).is_some()) {
            warn!("Textual inversion {} clashes with an existing token, skipping", token);
            return Ok(());
        }

        let added: Vec<AddedToken> = names.iter().map(|n| AddedToken::from(n.clone(), false)).collect();
        self.tokenizer.add_tokens(&added);
        let first = self.tokenizer.token_to_id(&names[0]);
        if first != Some(self.config.vocab_size as u32) {
            bail!("Textual inversion {} was assigned id {:?}", token, first);
        }

        let table = Tensor::cat(&[table, &vectors.to_dtype(table.dtype())?], 0)?;
        self.base.insert(TOKEN_EMBEDDING.to_string(), table);
        self.config.vocab_size += count;
        self.inversions.push((token.to_string(), count));
        Ok(())
    }

    /// Rebuild from the base weights plus `deltas`.
    pub fn rebuild(&mut self, deltas: &HashMap<String, Tensor>) -> Result<()> {
        let mut weights = self.base.clone();
        for (name, delta) in deltas {
            let Some(weight) = weights.get(name) else {
                bail!("Text encoder has no weight {}", name);
            };
            let patched = (weight.to_dtype(DType::F32)? + delta.to_dtype(DType::F32)?)?;
            weights.insert(name.clone(), patched);
        }
        self.model = ClipTextModel::new(
            VarBuilder::from_tensors(weights, self.dtype, &self.device),
            &self.config,
            self.projection,
        )?;
        Ok(())
    }

    pub fn weight_names(&self) -> Vec<String> {
        self.base.keys().filter(|k| k.starts_with("text_model.encoder.")).cloned().collect()
    }
}

impl TextEncoder for ClipTextEncoder {
    fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("Failed to tokenize: {}", e))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn bos_token_id(&self) -> u32 {
        self.bos
    }

    fn eos_token_id(&self) -> u32 {
        self.eos
    }

    fn pad_token_id(&self) -> u32 {
        self.pad
    }

    fn max_length(&self) -> usize {
        self.config.max_position_embeddings
    }

    fn encode(&self, ids: &[u32]) -> Result<EncodedPrompt> {
        let input = Tensor::new(ids, &self.device)?.unsqueeze(0)?;
        let (last, penultimate) = self.model.forward(&input)?;
        let normed = self.model.final_layer_norm.forward(&last)?;

        let hidden = match self.output {
            HiddenOutput::Last => normed.clone(),
            HiddenOutput::Penultimate => penultimate,
        };
        let pooled = match &self.model.projection {
            Some(projection) => {
                let eos = ids.iter().position(|&id| id == self.eos).unwrap_or(ids.len() - 1);
                Some(projection.forward(&normed.i((.., eos, ..))?)?)
            }
            None => None,
        };

        Ok(EncodedPrompt { hidden, pooled })
    }

    fn textual_inversions(&self) -> Vec<(String, usize)> {
        self.inversions.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> ClipConfig {
        ClipConfig {
            vocab_size: 10,
            hidden_size: 8,
            intermediate_size: 16,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            max_position_embeddings: 6,
            hidden_act: Activation::Gelu,
            layer_norm_eps: 1e-5,
        }
    }

    fn tiny_weights(config: &ClipConfig) -> HashMap<String, Tensor> {
        let dev = Device::Cpu;
        let h = config.hidden_size;
        let i = config.intermediate_size;
        let randn = |shape: &[usize]| Tensor::randn(0f32, 0.2, shape, &dev).unwrap();
        let mut w = HashMap::new();
        w.insert(TOKEN_EMBEDDING.to_string(), randn(&[config.vocab_size, h]));
        w.insert(
            "text_model.embeddings.position_embedding.weight".to_string(),
            randn(&[config.max_position_embeddings, h]),
        );
        for layer in 0..config.num_hidden_layers {
            let p = format!("text_model.encoder.layers.{layer}");
            for proj in ["q_proj", "k_proj", "v_proj", "out_proj"] {
                w.insert(format!("{p}.self_attn.{proj}.weight"), randn(&[h, h]));
                w.insert(format!("{p}.self_attn.{proj}.bias"), randn(&[h]));
            }
            for norm in ["layer_norm1", "layer_norm2"] {
                w.insert(format!("{p}.{norm}.weight"), Tensor::ones(h, DType::F32, &dev).unwrap());
                w.insert(format!("{p}.{norm}.bias"), Tensor::zeros(h, DType::F32, &dev).unwrap());
            }
            w.insert(format!("{p}.mlp.fc1.weight"), randn(&[i, h]));
            w.insert(format!("{p}.mlp.fc1.bias"), randn(&[i]));
            w.insert(format!("{p}.mlp.fc2.weight"), randn(&[h, i]));
            w.insert(format!("{p}.mlp.fc2.bias"), randn(&[h]));
        }
        w.insert("text_model.final_layer_norm.weight".to_string(), Tensor::ones(h, DType::F32, &dev).unwrap());
        w.insert("text_model.final_layer_norm.bias".to_string(), Tensor::zeros(h, DType::F32, &dev).unwrap());
        w
    }

    fn tiny_model(projection: Option<usize>) -> ClipTextModel {
        let config = tiny_config();
        let mut weights = tiny_weights(&config);
        if let Some(dim) = projection {
            weights.insert(PROJECTION.to_string(), Tensor::randn(0f32, 0.2, (dim, 8), &Device::Cpu).unwrap());
        }
        ClipTextModel::new(VarBuilder::from_tensors(weights, DType::F32, &Device::Cpu), &config, projection).unwrap()
    }

    #[test]
    fn attention_is_causal() {
        let model = tiny_model(None);
        let a = Tensor::new(&[[1u32, 2, 3, 4, 5, 6]], &Device::Cpu).unwrap();
        let b = Tensor::new(&[[1u32, 2, 3, 9, 9, 9]], &Device::Cpu).unwrap();
        let (last_a, _) = model.forward(&a).unwrap();
        let (last_b, _) = model.forward(&b).unwrap();

        let prefix = |t: &Tensor| t.i((.., 0..3, ..)).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let (pa, pb) = (prefix(&last_a), prefix(&last_b));
        assert!(pa.iter().zip(&pb).all(|(x, y)| (x - y).abs() < 1e-5));

        let tail = |t: &Tensor| t.i((.., 5, ..)).unwrap().to_vec2::<f32>().unwrap();
        assert_ne!(tail(&last_a), tail(&last_b));
    }

    #[test]
    fn penultimate_skips_the_last_layer() {
        let model = tiny_model(None);
        let ids = Tensor::new(&[[1u32, 2, 3, 4, 5, 6]], &Device::Cpu).unwrap();
        let (last, penultimate) = model.forward(&ids).unwrap();
        assert_eq!(last.dims(), &[1, 6, 8]);
        assert_eq!(penultimate.dims(), &[1, 6, 8]);
        let diff = (last - penultimate).unwrap().abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(diff > 0.0);
    }

    #[test]
    fn projection_head_is_loaded_when_present() {
        let model = tiny_model(Some(4));
        let hidden = Tensor::zeros((1, 8), DType::F32, &Device::Cpu).unwrap();
        let pooled = model.projection.as_ref().unwrap().forward(&hidden).unwrap();
        assert_eq!(pooled.dims(), &[1, 4]);
    }

    #[test]
    fn inversion_vectors_pick_the_matching_width() {
        let dev = Device::Cpu;
        let sdxl = HashMap::from([
            ("clip_l".to_string(), Tensor::zeros((2, 768), DType::F16, &dev).unwrap()),
            ("clip_g".to_string(), Tensor::zeros((2, 1280), DType::F16, &dev).unwrap()),
        ]);
        let l = inversion_vectors(&sdxl, 768).unwrap().unwrap();
        let g = inversion_vectors(&sdxl, 1280).unwrap().unwrap();
        assert_eq!(l.dims(), &[2, 768]);
        assert_eq!(g.dims(), &[2, 1280]);
        assert_eq!(g.dtype(), DType::F32);

        let single = HashMap::from([("<toy>".to_string(), Tensor::zeros(768, DType::F32, &dev).unwrap())]);
        assert_eq!(inversion_vectors(&single, 768).unwrap().unwrap().dims(), &[1, 768]);
        assert!(inversion_vectors(&single, 1024).unwrap().is_none());
    }
}
