//! Low-rank weight updates.
//!
//! Keys follow either the kohya layout (`lora_unet_down_blocks_0_..._to_q.lora_up.weight`)
//! or the peft layout (`unet.down_blocks.0....to_q.lora_B.weight`). Both are
//! matched against the model's weight names with dots flattened to
//! underscores.

use anyhow::{bail, Result};
use candle_core::{DType, Tensor};
use seedalchemy_runtime_api::{PatchTarget, PipelineModel};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

#[derive(Default)]
struct LayerParts {
    up: Option<Tensor>,
    down: Option<Tensor>,
    alpha: Option<f32>,
}

/// A loaded LoRA file with the multiplier it is applied at.
pub struct LoraFile<'a> {
    pub name: &'a str,
    pub tensors: &'a HashMap<String, Tensor>,
    pub multiplier: f64,
}

/// Split a state-dict key into `(target, flattened layer, element)`.
fn classify(key: &str, encoders: usize) -> Option<(PatchTarget, String, &str)> {
    let second = if encoders > 1 { 1 } else { 0 };

    if let Some(rest) = key.strip_prefix("lora_") {
        let (layer, element) = rest.split_once('.')?;
        let (target, layer) = if let Some(layer) = layer.strip_prefix("unet_") {
            (PatchTarget::Unet, layer)
        } else if let Some(layer) = layer.strip_prefix("te1_") {
            (PatchTarget::TextEncoder(0), layer)
        } else if let Some(layer) = layer.strip_prefix("te2_") {
            (PatchTarget::TextEncoder(second), layer)
        } else if let Some(layer) = layer.strip_prefix("te_") {
            (PatchTarget::TextEncoder(0), layer)
        } else {
            return None;
        };
        let element = match element {
            "lora_up.weight" => "up",
            "lora_down.weight" => "down",
            "alpha" => "alpha",
            _ => return None,
        };
        return Some((target, layer.to_string(), element));
    }

    let (target, rest) = if let Some(rest) = key.strip_prefix("unet.") {
        (PatchTarget::Unet, rest)
    } else if let Some(rest) = key.strip_prefix("text_encoder_2.") {
        (PatchTarget::TextEncoder(second), rest)
    } else if let Some(rest) = key.strip_prefix("text_encoder.") {
        (PatchTarget::TextEncoder(0), rest)
    } else {
        return None;
    };
    for (suffix, element) in [
        (".lora_B.weight", "up"),
        (".lora_A.weight", "down"),
        (".lora.up.weight", "up"),
        (".lora.down.weight", "down"),
        (".alpha", "alpha"),
    ] {
        if let Some(layer) = rest.strip_suffix(suffix) {
            return Some((target, layer.replace('.', "_"), element));
        }
    }
    None
}

/// `multiplier · scale · up @ down`, reshaped to the weight's layout.
fn layer_delta(parts: &LayerParts, multiplier: f64) -> Result<Option<Tensor>> {
    let (Some(up), Some(down)) = (&parts.up, &parts.down) else {
        return Ok(None);
    };
    let up = up.to_dtype(DType::F32)?;
    let down = down.to_dtype(DType::F32)?;
    let rank = up.dim(1)?;
    let scale = match parts.alpha {
        Some(alpha) => alpha as f64 / rank as f64,
        None => 1.0,
    };

    let delta = match (up.rank(), down.rank()) {
        (2, 2) => up.matmul(&down)?,
        (4, 4) => {
            let (out_channels, _, _, _) = up.dims4()?;
            let (_, in_channels, kh, kw) = down.dims4()?;
            let up = up.flatten_from(1)?;
            let down = down.flatten_from(1)?;
            up.matmul(&down)?.reshape((out_channels, in_channels, kh, kw))?
        }
        (a, b) => bail!("Unsupported LoRA layer ranks {} and {}", a, b),
    };
    Ok(Some((delta * (multiplier * scale))?))
}

/// Sum the updates of several LoRAs per patch target, keyed by the
/// model's own weight names.
pub fn compute_deltas(
    model: &dyn PipelineModel,
    loras: &[LoraFile<'_>],
) -> Result<HashMap<PatchTarget, HashMap<String, Tensor>>> {
    let encoders = model.text_encoders().len();
    let mut targets = vec![PatchTarget::Unet];
    targets.extend((0..encoders).map(PatchTarget::TextEncoder));

    // flattened name -> real weight name, per target
    let mut lookup: HashMap<PatchTarget, HashMap<String, String>> = HashMap::new();
    for target in &targets {
        let names = model
            .weight_names(*target)
            .into_iter()
            .filter_map(|name| {
                let stem = name.strip_suffix(".weight")?.replace('.', "_");
                Some((stem, name))
            })
            .collect();
        lookup.insert(*target, names);
    }

    let mut deltas: HashMap<PatchTarget, HashMap<String, Tensor>> = HashMap::new();
    for lora in loras {
        let mut layers: BTreeMap<(usize, String), (PatchTarget, LayerParts)> = BTreeMap::new();
        let mut skipped = 0usize;

        for (key, tensor) in lora.tensors {
            let Some((target, layer, element)) = classify(key, encoders) else {
                skipped += 1;
                continue;
            };
            let order = targets.iter().position(|t| *t == target).unwrap_or(0);
            let (_, parts) = layers
                .entry((order, layer))
                .or_insert_with(|| (target, LayerParts::default()));
            match element {
                "up" => parts.up = Some(tensor.clone()),
                "down" => parts.down = Some(tensor.clone()),
                _ => parts.alpha = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?.first().copied(),
            }
        }

        let mut applied = 0usize;
        for ((_, layer), (target, parts)) in layers {
            let Some(weight_name) = lookup.get(&target).and_then(|names| names.get(&layer)) else {
                skipped += 1;
                continue;
            };
            let Some(delta) = layer_delta(&parts, lora.multiplier)? else {
                skipped += 1;
                continue;
            };
            let target_deltas = deltas.entry(target).or_default();
            let summed = match target_deltas.remove(weight_name) {
                Some(existing) => (existing + delta)?,
                None => delta,
            };
            target_deltas.insert(weight_name.clone(), summed);
            applied += 1;
        }

        if skipped > 0 {
            warn!("LoRA {}: {} keys did not match any layer", lora.name, skipped);
        }
        debug!("LoRA {}: patched {} layers at {}", lora.name, applied, lora.multiplier);
    }

    Ok(deltas)
}
