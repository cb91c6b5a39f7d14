//! 长度前缀帧编解码。
//!
//! # 教案式说明
//! - **线格式 (What)**：`u32` 大端长度（不含自身）+ 1 字节标签 + 字段；
//!   字符串为 `u16` 长度 + UTF-8，载荷为 `u32` 长度 + 原始字节，整数一律大端；
//! - **标签**：`Hello=1`、`Data=2`、`Ack=3`、`Ping=4`、`Pong=5`、`Control=6`、`Goodbye=7`；
//!   `Control` 之后再跟 1 字节子标签（`SetRole=1`、`UpdateConfig=2`）；
//! - **风险 (Trade-offs)**：长度上限在解码时先于读取正文检查，超限立即报错而不是等待缓冲。

use bytes::{Buf, BufMut, Bytes, BytesMut};
use dcf_core::{ControlCommand, Mode, frame::Frame};
use thiserror::Error;

/// 默认的最大帧长度：16 MiB。
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4;

const TAG_HELLO: u8 = 1;
const TAG_DATA: u8 = 2;
const TAG_ACK: u8 = 3;
const TAG_PING: u8 = 4;
const TAG_PONG: u8 = 5;
const TAG_CONTROL: u8 = 6;
const TAG_GOODBYE: u8 = 7;

const CONTROL_SET_ROLE: u8 = 1;
const CONTROL_UPDATE: u8 = 2;

/// 编解码失败原因。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum CodecError {
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    Oversize { len: usize, max: usize },
    #[error("frame truncated while reading {0}")]
    Truncated(&'static str),
    #[error("unknown frame tag {0}")]
    UnknownTag(u8),
    #[error("unknown control tag {0}")]
    UnknownControl(u8),
    #[error("field `{0}` is not valid utf-8")]
    InvalidUtf8(&'static str),
    #[error("field `{0}` is longer than 65535 bytes")]
    StringTooLong(&'static str),
    #[error("unknown mode `{0}` in control frame")]
    UnknownMode(String),
    #[error("{0} trailing bytes after frame body")]
    Trailing(usize),
}

/// 长度前缀为 `u32`，上限不能超出它能表示的范围。
const WIRE_MAX_FRAME: usize = u32::MAX as usize;

/// 帧编解码器，仅携带长度上限。
#[derive(Clone, Copy, Debug)]
pub struct FrameCodec {
    max_frame: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

impl FrameCodec {
    /// 超过 `u32::MAX` 的上限被收紧到 `u32::MAX`。
    pub const fn new(max_frame: usize) -> Self {
        let max_frame = if max_frame > WIRE_MAX_FRAME {
            WIRE_MAX_FRAME
        } else {
            max_frame
        };
        Self { max_frame }
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }

    /// 将一帧追加到 `dst`。失败时 `dst` 保持调用前的内容。
    pub fn encode(&self, frame: &Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        let start = dst.len();
        dst.put_u32(0);
        if let Err(err) = encode_body(frame, dst) {
            dst.truncate(start);
            return Err(err);
        }
        let len = dst.len() - start - HEADER_LEN;
        if len > self.max_frame {
            dst.truncate(start);
            return Err(CodecError::Oversize {
                len,
                max: self.max_frame,
            });
        }
        let Ok(header) = u32::try_from(len) else {
            dst.truncate(start);
            return Err(CodecError::Oversize {
                len,
                max: self.max_frame,
            });
        };
        dst[start..start + HEADER_LEN].copy_from_slice(&header.to_be_bytes());
        Ok(())
    }

    /// 从 `src` 中取出一帧；数据不足时返回 `Ok(None)` 且不消费任何字节。
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&src[..HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_frame {
            return Err(CodecError::Oversize {
                len,
                max: self.max_frame,
            });
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        let mut body = src.split_to(len).freeze();
        let frame = decode_body(&mut body)?;
        if body.has_remaining() {
            return Err(CodecError::Trailing(body.remaining()));
        }
        Ok(Some(frame))
    }
}

fn encode_body(frame: &Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
    match frame {
        Frame::Hello { node_id, advertise } => {
            dst.put_u8(TAG_HELLO);
            put_str(dst, "node_id", node_id)?;
            put_opt_str(dst, "advertise", advertise.as_deref())?;
        }
        Frame::Data {
            correlation_id,
            sender,
            recipient,
            timestamp_ms,
            payload,
        } => {
            dst.put_u8(TAG_DATA);
            dst.put_u64(*correlation_id);
            put_str(dst, "sender", sender)?;
            put_opt_str(dst, "recipient", recipient.as_deref())?;
            dst.put_u64(*timestamp_ms);
            let len = u32::try_from(payload.len()).map_err(|_| CodecError::Oversize {
                len: payload.len(),
                max: WIRE_MAX_FRAME,
            })?;
            dst.put_u32(len);
            dst.put_slice(payload);
        }
        Frame::Ack { correlation_id } => {
            dst.put_u8(TAG_ACK);
            dst.put_u64(*correlation_id);
        }
        Frame::Ping { nonce } => {
            dst.put_u8(TAG_PING);
            dst.put_u64(*nonce);
        }
        Frame::Pong { nonce } => {
            dst.put_u8(TAG_PONG);
            dst.put_u64(*nonce);
        }
        Frame::Control(command) => {
            dst.put_u8(TAG_CONTROL);
            match command {
                ControlCommand::SetRole(mode) => {
                    dst.put_u8(CONTROL_SET_ROLE);
                    put_str(dst, "mode", mode.as_str())?;
                }
                ControlCommand::UpdateConfig { key, value } => {
                    dst.put_u8(CONTROL_UPDATE);
                    put_str(dst, "key", key)?;
                    put_str(dst, "value", value)?;
                }
            }
        }
        Frame::Goodbye => dst.put_u8(TAG_GOODBYE),
    }
    Ok(())
}

fn decode_body(src: &mut Bytes) -> Result<Frame, CodecError> {
    let frame = match get_u8(src, "tag")? {
        TAG_HELLO => Frame::Hello {
            node_id: get_str(src, "node_id")?,
            advertise: get_opt_str(src, "advertise")?,
        },
        TAG_DATA => {
            let correlation_id = get_u64(src, "correlation_id")?;
            let sender = get_str(src, "sender")?;
            let recipient = get_opt_str(src, "recipient")?;
            let timestamp_ms = get_u64(src, "timestamp_ms")?;
            let len = get_u32(src, "payload")? as usize;
            if src.remaining() < len {
                return Err(CodecError::Truncated("payload"));
            }
            Frame::Data {
                correlation_id,
                sender,
                recipient,
                timestamp_ms,
                payload: src.split_to(len),
            }
        }
        TAG_ACK => Frame::Ack {
            correlation_id: get_u64(src, "correlation_id")?,
        },
        TAG_PING => Frame::Ping {
            nonce: get_u64(src, "nonce")?,
        },
        TAG_PONG => Frame::Pong {
            nonce: get_u64(src, "nonce")?,
        },
        TAG_CONTROL => match get_u8(src, "control")? {
            CONTROL_SET_ROLE => {
                let mode = get_str(src, "mode")?;
                let mode = mode
                    .parse::<Mode>()
                    .map_err(|_| CodecError::UnknownMode(mode))?;
                Frame::Control(ControlCommand::SetRole(mode))
            }
            CONTROL_UPDATE => Frame::Control(ControlCommand::UpdateConfig {
                key: get_str(src, "key")?,
                value: get_str(src, "value")?,
            }),
            other => return Err(CodecError::UnknownControl(other)),
        },
        TAG_GOODBYE => Frame::Goodbye,
        other => return Err(CodecError::UnknownTag(other)),
    };
    Ok(frame)
}

fn put_str(dst: &mut BytesMut, field: &'static str, value: &str) -> Result<(), CodecError> {
    let len = u16::try_from(value.len()).map_err(|_| CodecError::StringTooLong(field))?;
    dst.put_u16(len);
    dst.put_slice(value.as_bytes());
    Ok(())
}

fn put_opt_str(
    dst: &mut BytesMut,
    field: &'static str,
    value: Option<&str>,
) -> Result<(), CodecError> {
    match value {
        Some(value) => {
            dst.put_u8(1);
            put_str(dst, field, value)
        }
        None => {
            dst.put_u8(0);
            Ok(())
        }
    }
}

fn get_u8(src: &mut Bytes, field: &'static str) -> Result<u8, CodecError> {
    src.try_get_u8().map_err(|_| CodecError::Truncated(field))
}

fn get_u32(src: &mut Bytes, field: &'static str) -> Result<u32, CodecError> {
    src.try_get_u32().map_err(|_| CodecError::Truncated(field))
}

fn get_u64(src: &mut Bytes, field: &'static str) -> Result<u64, CodecError> {
    src.try_get_u64().map_err(|_| CodecError::Truncated(field))
}

fn get_str(src: &mut Bytes, field: &'static str) -> Result<String, CodecError> {
    let len = src
        .try_get_u16()
        .map_err(|_| CodecError::Truncated(field))? as usize;
    if src.remaining() < len {
        return Err(CodecError::Truncated(field));
    }
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8(field))
}

fn get_opt_str(src: &mut Bytes, field: &'static str) -> Result<Option<String>, CodecError> {
    match get_u8(src, field)? {
        0 => Ok(None),
        _ => get_str(src, field).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(payload: &'static [u8]) -> Frame {
        Frame::Data {
            correlation_id: 42,
            sender: "edge-1".into(),
            recipient: None,
            timestamp_ms: 1_700_000_000_000,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn data_frame_layout_is_length_prefixed() {
        let codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(&data(b"hi"), &mut buf).expect("encode");
        // tag + corr + sender(2+6) + recipient flag + ts + payload(4+2)
        let body = 1 + 8 + 8 + 1 + 8 + 6;
        assert_eq!(&buf[..4], &(body as u32).to_be_bytes());
        assert_eq!(buf[4], TAG_DATA);
        assert_eq!(buf.len(), 4 + body);

        let decoded = codec.decode(&mut buf).expect("decode");
        assert_eq!(decoded, Some(data(b"hi")));
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_input_waits_for_more_bytes() {
        let codec = FrameCodec::default();
        let mut whole = BytesMut::new();
        codec
            .encode(
                &Frame::Control(ControlCommand::UpdateConfig {
                    key: "queue_capacity".into(),
                    value: "7".into(),
                }),
                &mut whole,
            )
            .expect("encode");
        codec.encode(&Frame::Goodbye, &mut whole).expect("encode");

        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        for byte in whole.iter() {
            buf.put_u8(*byte);
            while let Some(frame) = codec.decode(&mut buf).expect("decode") {
                frames.push(frame);
            }
        }
        assert_eq!(
            frames,
            vec![
                Frame::Control(ControlCommand::UpdateConfig {
                    key: "queue_capacity".into(),
                    value: "7".into(),
                }),
                Frame::Goodbye,
            ]
        );
    }

    #[test]
    fn set_role_carries_mode_name() {
        let codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        let frame = Frame::Control(ControlCommand::SetRole(Mode::Server));
        codec.encode(&frame, &mut buf).expect("encode");
        assert_eq!(&buf[5..8], &[CONTROL_SET_ROLE, 0, 6]);
        assert_eq!(&buf[8..], b"server");
        assert_eq!(codec.decode(&mut buf).expect("decode"), Some(frame));
    }

    #[test]
    fn oversize_frames_are_rejected_both_ways() {
        let codec = FrameCodec::new(16);
        let mut buf = BytesMut::from(&b"keep"[..]);
        let err = codec.encode(&data(b"0123456789"), &mut buf).unwrap_err();
        assert!(matches!(err, CodecError::Oversize { max: 16, .. }));
        assert_eq!(&buf[..], b"keep");

        let mut incoming = BytesMut::new();
        incoming.put_u32(1024);
        assert!(matches!(
            codec.decode(&mut incoming),
            Err(CodecError::Oversize { len: 1024, max: 16 })
        ));
    }

    #[test]
    fn frame_limit_never_exceeds_length_prefix() {
        assert_eq!(FrameCodec::new(usize::MAX).max_frame(), u32::MAX as usize);
        assert_eq!(FrameCodec::new(DEFAULT_MAX_FRAME).max_frame(), DEFAULT_MAX_FRAME);

        let codec = FrameCodec::new(usize::MAX);
        let mut buf = BytesMut::new();
        codec.encode(&data(b"hi"), &mut buf).expect("encode");
        assert_eq!(codec.decode(&mut buf).expect("decode"), Some(data(b"hi")));
    }

    #[test]
    fn malformed_bodies_are_errors() {
        let codec = FrameCodec::default();

        let mut unknown = BytesMut::new();
        unknown.put_u32(1);
        unknown.put_u8(99);
        assert_eq!(codec.decode(&mut unknown), Err(CodecError::UnknownTag(99)));

        let mut short = BytesMut::new();
        short.put_u32(3);
        short.put_u8(TAG_ACK);
        short.put_u16(0);
        assert_eq!(
            codec.decode(&mut short),
            Err(CodecError::Truncated("correlation_id"))
        );

        let mut bad_mode = BytesMut::new();
        bad_mode.put_u32(1 + 1 + 2 + 4);
        bad_mode.put_u8(TAG_CONTROL);
        bad_mode.put_u8(CONTROL_SET_ROLE);
        bad_mode.put_u16(4);
        bad_mode.put_slice(b"mesh");
        assert_eq!(
            codec.decode(&mut bad_mode),
            Err(CodecError::UnknownMode("mesh".into()))
        );
    }
}
