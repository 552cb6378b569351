//! Weighted prompts.
//!
//! Syntax:
//! - `(text)` raises attention by 1.1, `(text)1.3` or `(text:1.3)` sets it
//! - `(text)++` / `(text)--` and `word+` / `word-` scale by 1.1 / 0.9 per sign
//! - `[text]` lowers attention by 1.1
//! - `("a cat", "a dog").and(1, 0.5)` encodes each part separately and joins
//!   the embeddings, scaling each part by its weight
//! - `\(` and friends are literal
//!
//! Prompts longer than one window are split into 75-token chunks, each
//! wrapped in begin/end markers and padded, then encoded separately and
//! concatenated along the token axis.

use anyhow::{bail, Result};
use candle_core::{DType, Tensor, D};
use seedalchemy_runtime_api::TextEncoder;

const EMPHASIS: f64 = 1.1;
const DEEMPHASIS: f64 = 0.9;

#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub text: String,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptPart {
    pub fragments: Vec<Fragment>,
    pub weight: f64,
}

/// Split a prompt into its conjunction parts and weighted fragments.
pub fn parse(prompt: &str) -> Vec<PromptPart> {
    match parse_conjunction(prompt.trim()) {
        Some(parts) => parts
            .into_iter()
            .map(|(text, weight)| PromptPart {
                fragments: parse_weighted(&text),
                weight,
            })
            .collect(),
        None => vec![PromptPart {
            fragments: parse_weighted(prompt),
            weight: 1.0,
        }],
    }
}

/// `("a", "b").and(w1, w2)`; weights default to 1.
fn parse_conjunction(prompt: &str) -> Option<Vec<(String, f64)>> {
    let body = prompt.strip_prefix('(')?;
    let split = body.rfind(").and(")?;
    let (list, rest) = (&body[..split], &body[split + ").and(".len()..]);
    let args = rest.strip_suffix(')')?;

    let mut parts = Vec::new();
    let mut chars = list.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace() || *c == ',') {
            chars.next();
        }
        let Some(quote) = chars.next() else {
            break;
        };
        if quote != '"' && quote != '\'' {
            return None;
        }
        let mut text = String::new();
        loop {
            match chars.next()? {
                '\\' => text.push(chars.next()?),
                c if c == quote => break,
                c => text.push(c),
            }
        }
        parts.push(text);
    }
    if parts.is_empty() {
        return None;
    }

    let weights: Vec<f64> = args
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<f64>().ok())
        .collect::<Option<_>>()?;
    if !weights.is_empty() && weights.len() != parts.len() {
        return None;
    }

    Some(
        parts
            .into_iter()
            .enumerate()
            .map(|(i, text)| (text, weights.get(i).copied().unwrap_or(1.0)))
            .collect(),
    )
}

/// Attention-weighted fragments of a single part.
pub fn parse_weighted(text: &str) -> Vec<Fragment> {
    let mut parser = Parser {
        chars: text.chars().collect(),
        pos: 0,
        out: Vec::new(),
    };
    parser.sequence(None);
    parser.out
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
    out: Vec<Fragment>,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn flush(&mut self, buf: &mut String) {
        if !buf.trim().is_empty() {
            self.out.push(Fragment {
                text: std::mem::take(buf),
                weight: 1.0,
            });
        }
        buf.clear();
    }

    /// Parse until `close` (consumed) or the end. Returns an explicit
    /// `(text:1.3)` weight if one was found.
    fn sequence(&mut self, close: Option<char>) -> Option<f64> {
        let mut buf = String::new();
        let mut explicit = None;

        while let Some(c) = self.peek() {
            match c {
                '\\' => {
                    self.pos += 1;
                    if let Some(next) = self.peek() {
                        buf.push(next);
                        self.pos += 1;
                    }
                }
                '(' | '[' => {
                    self.flush(&mut buf);
                    self.pos += 1;
                    let start = self.out.len();
                    let multiplier = if c == '(' {
                        let explicit = self.sequence(Some(')'));
                        explicit.unwrap_or_else(|| self.suffix_weight().unwrap_or(EMPHASIS))
                    } else {
                        self.sequence(Some(']'));
                        1.0 / EMPHASIS
                    };
                    for fragment in &mut self.out[start..] {
                        fragment.weight *= multiplier;
                    }
                }
                ')' | ']' if Some(c) == close => {
                    self.pos += 1;
                    self.flush(&mut buf);
                    return explicit;
                }
                ':' if close == Some(')') => {
                    let save = self.pos;
                    self.pos += 1;
                    match self.number() {
                        Some(weight) if self.peek() == Some(')') => explicit = Some(weight),
                        _ => {
                            self.pos = save + 1;
                            buf.push(':');
                        }
                    }
                }
                '+' | '-' if buf.ends_with(|ch: char| ch.is_alphanumeric()) && self.sign_run_ends_word() => {
                    let weight = self.signs().unwrap_or(1.0);
                    let split = buf
                        .rfind(|ch: char| ch.is_whitespace() || ch == ',')
                        .map(|i| i + 1)
                        .unwrap_or(0);
                    let word = buf.split_off(split);
                    self.flush(&mut buf);
                    self.out.push(Fragment { text: word, weight });
                }
                _ => {
                    buf.push(c);
                    self.pos += 1;
                }
            }
        }

        self.flush(&mut buf);
        explicit
    }

    fn number(&mut self) -> Option<f64> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_digit() || c == '.')
        {
            self.pos += 1;
        }
        if self.pos == start {
            return None;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        match text.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                self.pos = start;
                None
            }
        }
    }

    /// Weight written right after a closing parenthesis.
    fn suffix_weight(&mut self) -> Option<f64> {
        match self.peek() {
            Some(c) if c.is_ascii_digit() || c == '.' => self.number(),
            Some('+') | Some('-') => self.signs(),
            _ => None,
        }
    }

    fn signs(&mut self) -> Option<f64> {
        let mut weight = 1.0;
        let mut seen = false;
        while let Some(c) = self.peek() {
            match c {
                '+' => weight *= EMPHASIS,
                '-' => weight *= DEEMPHASIS,
                _ => break,
            }
            seen = true;
            self.pos += 1;
        }
        seen.then_some(weight)
    }

    fn sign_run_ends_word(&self) -> bool {
        let mut pos = self.pos;
        while matches!(self.chars.get(pos), Some('+') | Some('-')) {
            pos += 1;
        }
        match self.chars.get(pos) {
            None => true,
            Some(c) => c.is_whitespace() || matches!(c, ',' | ')' | ']'),
        }
    }
}

/// Replace each multi-vector textual-inversion token with its numbered
/// companions, `name` → `name name_1 name_2`.
pub fn expand_textual_inversions(prompt: &str, inversions: &[(String, usize)]) -> String {
    let mut expanded = prompt.to_string();
    for (token, vectors) in inversions {
        if *vectors <= 1 || token.is_empty() {
            continue;
        }
        let replacement = std::iter::once(token.clone())
            .chain((1..*vectors).map(|i| format!("{token}_{i}")))
            .collect::<Vec<_>>()
            .join(" ");

        let mut result = String::with_capacity(expanded.len());
        let mut rest = expanded.as_str();
        while let Some(found) = rest.find(token.as_str()) {
            let before = rest[..found].chars().next_back();
            let after = rest[found + token.len()..].chars().next();
            let is_word = |c: Option<char>| c.is_some_and(|c| c.is_alphanumeric() || c == '_');
            result.push_str(&rest[..found]);
            if is_word(before) || is_word(after) {
                result.push_str(token);
            } else {
                result.push_str(&replacement);
            }
            rest = &rest[found + token.len()..];
        }
        result.push_str(rest);
        expanded = result;
    }
    expanded
}

/// One padded encoder window with per-token weights.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub ids: Vec<u32>,
    pub weights: Vec<f32>,
}

impl Chunk {
    fn build(encoder: &dyn TextEncoder, ids: &[u32], weights: &[f32]) -> Self {
        let length = encoder.max_length();
        let mut chunk = Chunk {
            ids: Vec::with_capacity(length),
            weights: Vec::with_capacity(length),
        };
        chunk.ids.push(encoder.bos_token_id());
        chunk.weights.push(1.0);
        chunk.ids.extend_from_slice(ids);
        chunk.weights.extend_from_slice(weights);
        chunk.ids.push(encoder.eos_token_id());
        chunk.weights.push(1.0);
        chunk.ids.resize(length, encoder.pad_token_id());
        chunk.weights.resize(length, 1.0);
        chunk
    }

    pub fn empty(encoder: &dyn TextEncoder) -> Self {
        Self::build(encoder, &[], &[])
    }

    fn is_weighted(&self) -> bool {
        self.weights.iter().any(|w| (*w - 1.0).abs() > f32::EPSILON)
    }
}

/// Tokenize a prompt into padded windows for `encoder`.
pub fn tokenize(encoder: &dyn TextEncoder, prompt: &str) -> Result<Vec<Chunk>> {
    let capacity = encoder.max_length().saturating_sub(2);
    if capacity == 0 {
        bail!("Text encoder window of {} tokens is too small", encoder.max_length());
    }
    let prompt = expand_textual_inversions(prompt, &encoder.textual_inversions());

    let mut chunks = Vec::new();
    for part in parse(&prompt) {
        let mut ids = Vec::new();
        let mut weights = Vec::new();
        for fragment in &part.fragments {
            let tokens = encoder.tokenize(&fragment.text)?;
            weights.extend(std::iter::repeat((fragment.weight * part.weight) as f32).take(tokens.len()));
            ids.extend(tokens);
        }

        if ids.is_empty() {
            chunks.push(Chunk::empty(encoder));
            continue;
        }
        for (ids, weights) in ids.chunks(capacity).zip(weights.chunks(capacity)) {
            chunks.push(Chunk::build(encoder, ids, weights));
        }
    }
    Ok(chunks)
}

/// Encode windows and join them along the token axis. The pooled output
/// comes from the first window.
pub fn encode_chunks(encoder: &dyn TextEncoder, chunks: &[Chunk]) -> Result<(Tensor, Option<Tensor>)> {
    let mut hidden = Vec::with_capacity(chunks.len());
    let mut pooled = None;

    for chunk in chunks {
        let encoded = encoder.encode(&chunk.ids)?;
        if pooled.is_none() {
            pooled = encoded.pooled;
        }
        let states = if chunk.is_weighted() {
            apply_weights(&encoded.hidden, &chunk.weights)?
        } else {
            encoded.hidden
        };
        hidden.push(states);
    }

    if hidden.is_empty() {
        bail!("Prompt produced no token windows");
    }
    Ok((Tensor::cat(&hidden, 1)?, pooled))
}

/// Scale each token's embedding, then restore the original mean.
fn apply_weights(hidden: &Tensor, weights: &[f32]) -> Result<Tensor> {
    let dtype = hidden.dtype();
    let hidden = hidden.to_dtype(DType::F32)?;
    let original_mean = hidden.mean_all()?.to_scalar::<f32>()?;

    let weights = Tensor::from_slice(weights, (1, weights.len(), 1), hidden.device())?;
    let weighted = hidden.broadcast_mul(&weights)?;
    let weighted_mean = weighted.mean_all()?.to_scalar::<f32>()?;

    let weighted = if weighted_mean.abs() > f32::EPSILON {
        (weighted * (original_mean / weighted_mean) as f64)?
    } else {
        weighted
    };
    Ok(weighted.to_dtype(dtype)?)
}

/// Conditioning for classifier-free guidance.
#[derive(Debug, Clone)]
pub struct PromptEmbeddings {
    /// `[1, tokens, hidden]`
    pub cond: Tensor,
    pub uncond: Tensor,
    pub pooled_cond: Option<Tensor>,
    pub pooled_uncond: Option<Tensor>,
}

/// Encode prompt and negative prompt with every encoder of a pipeline.
///
/// All streams are padded with empty windows to a common length, encoder
/// outputs are joined along the embedding axis, and the pooled output comes
/// from the last encoder.
pub fn encode_pair(encoders: &[&dyn TextEncoder], prompt: &str, negative: &str) -> Result<PromptEmbeddings> {
    if encoders.is_empty() {
        bail!("Pipeline has no text encoder");
    }

    let mut tokenized = Vec::with_capacity(encoders.len());
    for encoder in encoders {
        tokenized.push((tokenize(*encoder, prompt)?, tokenize(*encoder, negative)?));
    }
    let windows = tokenized
        .iter()
        .map(|(p, n)| p.len().max(n.len()))
        .max()
        .unwrap_or(1);

    let mut cond = Vec::with_capacity(encoders.len());
    let mut uncond = Vec::with_capacity(encoders.len());
    let mut pooled_cond = None;
    let mut pooled_uncond = None;

    for (encoder, (mut positive, mut negative)) in encoders.iter().zip(tokenized) {
        positive.resize(windows, Chunk::empty(*encoder));
        negative.resize(windows, Chunk::empty(*encoder));

        let (hidden, pooled) = encode_chunks(*encoder, &positive)?;
        cond.push(hidden);
        pooled_cond = pooled;

        let (hidden, pooled) = encode_chunks(*encoder, &negative)?;
        uncond.push(hidden);
        pooled_uncond = pooled;
    }

    Ok(PromptEmbeddings {
        cond: Tensor::cat(&cond, D::Minus1)?,
        uncond: Tensor::cat(&uncond, D::Minus1)?,
        pooled_cond,
        pooled_uncond,
    })
}
