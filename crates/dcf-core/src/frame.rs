//! 核心与传输层之间交换的帧。
//!
//! 核心只构造与消费 [`Frame`]，从不把它编码为字节；编码由具体传输负责。

use bytes::Bytes;

use crate::mode::Mode;

/// 远端下发的控制指令。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ControlCommand {
    /// 要求接收方切换到指定模式。
    SetRole(Mode),
    /// 要求接收方更新一项配置。
    UpdateConfig { key: String, value: String },
}

/// 传输帧。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Frame {
    /// 建连后的第一帧，声明发送方节点标识与可回拨地址（如有）。
    Hello {
        node_id: String,
        advertise: Option<String>,
    },
    Data {
        correlation_id: u64,
        sender: String,
        recipient: Option<String>,
        timestamp_ms: u64,
        payload: Bytes,
    },
    Ack {
        correlation_id: u64,
    },
    Ping {
        nonce: u64,
    },
    Pong {
        nonce: u64,
    },
    Control(ControlCommand),
    /// 有序关闭。
    Goodbye,
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::Data { .. } => "data",
            Frame::Ack { .. } => "ack",
            Frame::Ping { .. } => "ping",
            Frame::Pong { .. } => "pong",
            Frame::Control(_) => "control",
            Frame::Goodbye => "goodbye",
        }
    }
}
