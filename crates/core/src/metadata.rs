//! Reproducibility metadata embedded in every written PNG.

use anyhow::{Context, Result};
use image::RgbImage;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::Cursor;

use crate::request::ImageRequest;

/// iTXt keyword carrying the request JSON.
pub const METADATA_KEY: &str = "seed-alchemy";

/// Fields describing where and how a request ran rather than what it made.
pub const TRANSIENT_FIELDS: [&str; 6] = [
    "session_id",
    "generator_id",
    "user",
    "collection",
    "image_count",
    "preview",
];

/// Drop `null` members at every depth.
pub fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_nulls).collect()),
        other => other,
    }
}

/// The JSON object stored alongside an output image.
pub fn request_metadata(req: &ImageRequest) -> Result<Value> {
    let mut value = strip_nulls(serde_json::to_value(req)?);
    if let Value::Object(map) = &mut value {
        for key in TRANSIENT_FIELDS {
            map.remove(key);
        }
    }
    Ok(value)
}

/// Parse stored metadata back into a request. Transient fields take their
/// defaults.
pub fn parse_metadata(text: &str) -> Result<ImageRequest> {
    serde_json::from_str(text).context("Invalid image metadata")
}

/// Encode an RGB image as PNG, optionally with the metadata chunk.
pub fn encode_png(image: &RgbImage, metadata: Option<&Value>) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut buffer, image.width(), image.height());
        encoder.set_color(png::ColorType::Rgb);
        encoder.set_depth(png::BitDepth::Eight);
        if let Some(metadata) = metadata {
            encoder.add_itxt_chunk(METADATA_KEY.to_string(), serde_json::to_string(metadata)?)?;
        }
        let mut writer = encoder.write_header()?;
        writer.write_image_data(image.as_raw())?;
        writer.finish()?;
    }
    Ok(buffer)
}

/// Encode without metadata, used for preview frames.
pub fn encode_preview(image: &RgbImage) -> Result<Vec<u8>> {
    encode_png(image, None)
}

/// All textual chunks of a PNG keyed by keyword.
pub fn read_text_chunks(bytes: &[u8]) -> Result<BTreeMap<String, String>> {
    let mut decoder = png::Decoder::new(Cursor::new(bytes));
    decoder.set_ignore_text_chunk(false);
    let reader = decoder.read_info().context("Not a PNG image")?;
    let info = reader.info();

    let mut chunks = BTreeMap::new();
    for chunk in &info.uncompressed_latin1_text {
        chunks.insert(chunk.keyword.clone(), chunk.text.clone());
    }
    for chunk in &info.compressed_latin1_text {
        if let Ok(text) = chunk.get_text() {
            chunks.insert(chunk.keyword.clone(), text);
        }
    }
    for chunk in &info.utf8_text {
        if let Ok(text) = chunk.get_text() {
            chunks.insert(chunk.keyword.clone(), text);
        }
    }
    Ok(chunks)
}

/// Text chunks as a JSON object, empty for non-PNG files.
pub fn read_metadata_object(bytes: &[u8]) -> Value {
    match read_text_chunks(bytes) {
        Ok(chunks) => Value::Object(
            chunks
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect::<Map<String, Value>>(),
        ),
        Err(_) => Value::Object(Map::new()),
    }
}
