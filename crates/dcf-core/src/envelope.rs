//! 消息信封、确认令牌与发送结果。

use core::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::{endpoint::EndpointId, error::DcfError};

/// 信封方向。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// 框架内流转的消息信封。
///
/// # 教案式说明
/// - **契约 (What)**：`recipient = None` 表示“拓扑默认路由”；Client/Server 模式忽略收件人；
///   `correlation_id` 由会话分配，在同一会话内单调递增；
/// - **执行 (How)**：入站信封的 `sender` 来自对端握手时声明的节点标识，出站信封由会话填入
///   本地 `node_id`。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub payload: Bytes,
    pub recipient: Option<EndpointId>,
    pub correlation_id: u64,
    pub direction: Direction,
    pub sender: Option<String>,
    pub timestamp_ms: u64,
}

impl Envelope {
    pub fn outbound(payload: impl Into<Bytes>, recipient: Option<EndpointId>) -> Self {
        Self {
            payload: payload.into(),
            recipient,
            correlation_id: 0,
            direction: Direction::Outbound,
            sender: None,
            timestamp_ms: now_millis(),
        }
    }

    pub fn inbound(
        payload: Bytes,
        sender: Option<String>,
        correlation_id: u64,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            payload,
            recipient: None,
            correlation_id,
            direction: Direction::Inbound,
            sender,
            timestamp_ms,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }
}

/// 解析调用方给出的收件人文本；空串映射为默认路由。
pub fn parse_recipient(recipient: &str) -> Result<Option<EndpointId>, DcfError> {
    let trimmed = recipient.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<EndpointId>()
        .map(Some)
        .map_err(|_| DcfError::recipient_unknown(trimmed))
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// 远端确认后返回给调用方的非空令牌，形如 `ack:<endpoint>/<correlation_id>`。
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct AckToken(String);

impl AckToken {
    pub fn new(endpoint: &EndpointId, correlation_id: u64) -> Self {
        Self(format!("ack:{endpoint}/{correlation_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for AckToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 广播发送的逐通道结果。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BroadcastReport {
    pub results: Vec<(EndpointId, Result<AckToken, DcfError>)>,
}

impl BroadcastReport {
    pub fn delivered(&self) -> usize {
        self.results.iter().filter(|(_, result)| result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.delivered()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn get(&self, endpoint: &EndpointId) -> Option<&Result<AckToken, DcfError>> {
        self.results
            .iter()
            .find(|(id, _)| id == endpoint)
            .map(|(_, result)| result)
    }
}

/// `send_message` 的非错误结果。
///
/// “被插件丢弃”是独立结果而不是错误，调用方据此区分插件短路与传输失败。
#[derive(Clone, Debug, PartialEq)]
pub enum SendOutcome {
    Delivered(AckToken),
    Dropped { plugin: String },
    Broadcast(BroadcastReport),
}

impl SendOutcome {
    pub fn ack_token(&self) -> Option<&AckToken> {
        match self {
            SendOutcome::Delivered(token) => Some(token),
            _ => None,
        }
    }

    pub fn is_dropped(&self) -> bool {
        matches!(self, SendOutcome::Dropped { .. })
    }
}
