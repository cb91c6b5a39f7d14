//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为会话、分发器、冗余管理器与传输层提供唯一的错误域 [`DcfError`]，调用方只需面对一套
//!   错误枚举即可完成重试、告警与路由修正决策；
//! - 每个变体都带有稳定错误码（`dcf.<域>.<语义>`），便于日志与指标按码聚合。
//!
//! ## 分类（What）
//! - [`ErrorKind`] 对应配置、连通性、路由、资源、插件与生命周期六类错误；
//! - 连通性错误在核心内部按冗余集合自动恢复，只有耗尽后才以 [`DcfError::MasterUnreachable`]
//!   形式暴露；其余类别在触发它们的调用上直接返回；
//! - [`SendStage`] 标注 `send_message` 失败发生在哪个阶段。

use core::fmt;

use thiserror::Error;

/// 稳定错误码常量。
pub mod codes {
    pub const CONFIG_INVALID: &str = "dcf.config.invalid";
    pub const MASTER_UNREACHABLE: &str = "dcf.redundancy.exhausted";
    pub const RECIPIENT_UNKNOWN: &str = "dcf.dispatch.recipient_unknown";
    pub const BACKPRESSURE: &str = "dcf.dispatch.backpressure";
    pub const PLUGIN_FAULT: &str = "dcf.plugin.fault";
    pub const PLUGIN_REJECTED: &str = "dcf.plugin.rejected";
    pub const TIMEOUT: &str = "dcf.channel.timeout";
    pub const CANCELLED: &str = "dcf.session.cancelled";
    pub const UNAVAILABLE: &str = "dcf.dispatch.unavailable";
    pub const INVALID_STATE: &str = "dcf.session.invalid_state";
    pub const TRANSPORT_CLOSED: &str = "dcf.transport.closed";
    pub const TRANSPORT_REFUSED: &str = "dcf.transport.refused";
    pub const TRANSPORT_PROTOCOL: &str = "dcf.transport.protocol";
}

/// 框架统一错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把全部错误类别落到一个可 `Clone` 的枚举上。排队中的发送请求在
///   重连完成或失败时需要把同一个错误分发给多个等待者，因此要求可克隆；
/// - **契约 (What)**：
///   - 所有变体满足 `Send + Sync + 'static`，可跨任务传播；
///   - [`code`](Self::code) 返回稳定错误码，[`kind`](Self::kind) 返回错误类别；
///   - [`PluginFault`](Self::PluginFault) 只作为事件出现，从不由 `send_message` 返回。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum DcfError {
    /// 配置结构非法或 Auto 探测全部失败。致命，不重试。
    #[error("invalid config: {detail}")]
    ConfigInvalid { detail: String },

    /// 冗余集合（主节点候选或对等节点集合）已经耗尽。
    #[error("master node unreachable: redundancy set `{role}` exhausted")]
    MasterUnreachable { role: String },

    /// 显式收件人没有对应的通道。调用方可修正，不重试。
    #[error("recipient `{recipient}` has no open channel")]
    RecipientUnknown { recipient: String },

    /// 重配置期间的有界队列已满。
    #[error("reconfiguration queue is full (capacity {capacity})")]
    Backpressure { capacity: usize },

    /// 插件内部故障，已被隔离。只以事件形式上报。
    #[error("plugin `{plugin}` faulted: {detail}")]
    PluginFault { plugin: String, detail: String },

    /// 插件显式拒绝了消息。
    #[error("plugin `{plugin}` rejected message: {reason}")]
    PluginRejected { plugin: String, reason: String },

    /// 传输层失败，`code` 由具体传输实现给出。
    #[error("transport failure `{code}` on `{endpoint}`: {detail}")]
    Transport {
        code: &'static str,
        endpoint: String,
        detail: String,
        retryable: bool,
    },

    /// 建连、握手或等待确认超时。
    #[error("{operation} timed out after {elapsed_ms} ms")]
    Timeout {
        operation: &'static str,
        elapsed_ms: u64,
    },

    /// 操作被 `stop()` 取消。
    #[error("{operation} cancelled")]
    Cancelled { operation: &'static str },

    /// 路由目标当前没有任何可用通道。
    #[error("no channel available for route `{route}`")]
    Unavailable { route: String },

    /// 在当前拓扑状态下不允许的调用。
    #[error("operation `{operation}` is not permitted in state {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },
}

/// 错误类别，决定核心是本地恢复还是直接交还调用方。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorKind {
    Configuration,
    Connectivity,
    Routing,
    Resource,
    Plugin,
    Lifecycle,
}

/// `send_message` 失败所处的阶段。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SendStage {
    Connection,
    Plugin,
    Routing,
    Queue,
    Timeout,
    Lifecycle,
}

impl DcfError {
    pub fn config(detail: impl Into<String>) -> Self {
        DcfError::ConfigInvalid {
            detail: detail.into(),
        }
    }

    pub fn master_unreachable(role: impl fmt::Display) -> Self {
        DcfError::MasterUnreachable {
            role: role.to_string(),
        }
    }

    pub fn recipient_unknown(recipient: impl fmt::Display) -> Self {
        DcfError::RecipientUnknown {
            recipient: recipient.to_string(),
        }
    }

    pub fn transport(
        code: &'static str,
        endpoint: impl fmt::Display,
        detail: impl Into<String>,
        retryable: bool,
    ) -> Self {
        DcfError::Transport {
            code,
            endpoint: endpoint.to_string(),
            detail: detail.into(),
            retryable,
        }
    }

    /// 对端有序关闭或链路被切断。
    pub fn closed(endpoint: impl fmt::Display) -> Self {
        Self::transport(codes::TRANSPORT_CLOSED, endpoint, "link closed", true)
    }

    pub fn timeout(operation: &'static str, elapsed: core::time::Duration) -> Self {
        DcfError::Timeout {
            operation,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn cancelled(operation: &'static str) -> Self {
        DcfError::Cancelled { operation }
    }

    pub fn invalid_state(operation: &'static str, state: impl fmt::Display) -> Self {
        DcfError::InvalidState {
            operation,
            state: state.to_string(),
        }
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            DcfError::ConfigInvalid { .. } => codes::CONFIG_INVALID,
            DcfError::MasterUnreachable { .. } => codes::MASTER_UNREACHABLE,
            DcfError::RecipientUnknown { .. } => codes::RECIPIENT_UNKNOWN,
            DcfError::Backpressure { .. } => codes::BACKPRESSURE,
            DcfError::PluginFault { .. } => codes::PLUGIN_FAULT,
            DcfError::PluginRejected { .. } => codes::PLUGIN_REJECTED,
            DcfError::Transport { code, .. } => *code,
            DcfError::Timeout { .. } => codes::TIMEOUT,
            DcfError::Cancelled { .. } => codes::CANCELLED,
            DcfError::Unavailable { .. } => codes::UNAVAILABLE,
            DcfError::InvalidState { .. } => codes::INVALID_STATE,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DcfError::ConfigInvalid { .. } => ErrorKind::Configuration,
            DcfError::MasterUnreachable { .. }
            | DcfError::Transport { .. }
            | DcfError::Timeout { .. }
            | DcfError::Unavailable { .. } => ErrorKind::Connectivity,
            DcfError::RecipientUnknown { .. } => ErrorKind::Routing,
            DcfError::Backpressure { .. } => ErrorKind::Resource,
            DcfError::PluginFault { .. } | DcfError::PluginRejected { .. } => ErrorKind::Plugin,
            DcfError::Cancelled { .. } | DcfError::InvalidState { .. } => ErrorKind::Lifecycle,
        }
    }

    /// 失败阶段；配置类与插件故障事件不属于发送路径，返回 `None`。
    pub fn stage(&self) -> Option<SendStage> {
        match self {
            DcfError::ConfigInvalid { .. } | DcfError::PluginFault { .. } => None,
            DcfError::MasterUnreachable { .. }
            | DcfError::Transport { .. }
            | DcfError::Unavailable { .. } => Some(SendStage::Connection),
            DcfError::RecipientUnknown { .. } => Some(SendStage::Routing),
            DcfError::Backpressure { .. } => Some(SendStage::Queue),
            DcfError::PluginRejected { .. } => Some(SendStage::Plugin),
            DcfError::Timeout { .. } => Some(SendStage::Timeout),
            DcfError::Cancelled { .. } | DcfError::InvalidState { .. } => {
                Some(SendStage::Lifecycle)
            }
        }
    }

    /// 调用方在退避后重试是否有意义。
    pub fn is_retryable(&self) -> bool {
        match self {
            DcfError::Transport { retryable, .. } => *retryable,
            DcfError::Timeout { .. } | DcfError::Unavailable { .. } | DcfError::Backpressure { .. } => {
                true
            }
            _ => false,
        }
    }
}

pub type Result<T, E = DcfError> = core::result::Result<T, E>;
