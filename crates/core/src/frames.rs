//! Binary frames carried on a session's stream.
//!
//! Every frame is `[i32 BE type][i32 BE length][payload]`.

use anyhow::{bail, Result};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FrameType {
    SessionId = 1,
    Progress = 2,
    Image = 3,
    Error = 4,
}

impl FrameType {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::SessionId),
            2 => Some(Self::Progress),
            3 => Some(Self::Image),
            4 => Some(Self::Error),
            _ => None,
        }
    }
}

pub fn build(frame_type: FrameType, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&(frame_type as i32).to_be_bytes());
    frame.extend_from_slice(&(payload.len() as i32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

pub fn session_id(id: Uuid) -> Vec<u8> {
    build(FrameType::SessionId, id.as_bytes())
}

/// Absent generator ids are sent as the nil UUID.
pub fn progress(generator_id: Option<Uuid>, percent: i32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(20);
    payload.extend_from_slice(generator_id.unwrap_or_default().as_bytes());
    payload.extend_from_slice(&percent.to_be_bytes());
    build(FrameType::Progress, &payload)
}

pub fn image(generator_id: Option<Uuid>, png: &[u8]) -> Vec<u8> {
    with_generator(FrameType::Image, generator_id, png)
}

pub fn error(generator_id: Option<Uuid>, message: &str) -> Vec<u8> {
    with_generator(FrameType::Error, generator_id, message.as_bytes())
}

fn with_generator(frame_type: FrameType, generator_id: Option<Uuid>, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(16 + data.len());
    payload.extend_from_slice(generator_id.unwrap_or_default().as_bytes());
    payload.extend_from_slice(data);
    build(frame_type, &payload)
}

/// A decoded frame, used by clients and tests.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    SessionId(Uuid),
    Progress { generator_id: Uuid, percent: i32 },
    Image { generator_id: Uuid, png: Vec<u8> },
    Error { generator_id: Uuid, message: String },
}

impl Frame {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 {
            bail!("Frame shorter than its header");
        }
        let code = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let Some(frame_type) = FrameType::from_code(code) else {
            bail!("Unknown frame type {}", code);
        };
        let length = i32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let payload = &bytes[8..];
        if length < 0 || payload.len() != length as usize {
            bail!("Frame length {} does not match payload of {} bytes", length, payload.len());
        }

        let uuid_prefix = |payload: &[u8]| -> Result<(Uuid, Vec<u8>)> {
            if payload.len() < 16 {
                bail!("Frame payload lacks an identifier");
            }
            Ok((Uuid::from_slice(&payload[..16])?, payload[16..].to_vec()))
        };

        match frame_type {
            FrameType::SessionId => Ok(Frame::SessionId(Uuid::from_slice(payload)?)),
            FrameType::Progress => {
                let (generator_id, rest) = uuid_prefix(payload)?;
                let percent: [u8; 4] = rest.as_slice().try_into()?;
                Ok(Frame::Progress {
                    generator_id,
                    percent: i32::from_be_bytes(percent),
                })
            }
            FrameType::Image => {
                let (generator_id, png) = uuid_prefix(payload)?;
                Ok(Frame::Image { generator_id, png })
            }
            FrameType::Error => {
                let (generator_id, message) = uuid_prefix(payload)?;
                Ok(Frame::Error {
                    generator_id,
                    message: String::from_utf8(message)?,
                })
            }
        }
    }
}
