//! # plugin 模块说明
//!
//! ## 角色定位（Why）
//! - 插件是挂在每条入站、出站消息上的拦截器，可放行、改写、丢弃或拒绝消息；
//! - 框架只规定插件契约，唯一内置实现是记录日志的 [`LoggingPlugin`]。
//!
//! ## 契约（What）
//! - 钩子同步执行且不得阻塞，这是调用方义务，框架不强制；
//! - 出站与入站都按注册顺序执行，不存在隐含的逆序；
//! - 钩子返回 `Err` 或发生 panic 视为插件故障：记录日志、发布事件，链路以上一个有效信封继续。

mod chain;
mod logging;
mod registry;

use core::fmt;

use thiserror::Error;

use crate::envelope::Envelope;

pub use chain::{ChainOutcome, PluginChain};
pub use logging::LoggingPlugin;
pub use registry::{PluginFactory, PluginRegistry};

/// 插件对一条消息的裁决。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    /// 以新信封替换当前信封后继续。
    Mutate(Envelope),
    /// 短路：不再发送或投递，调用方得到“被插件丢弃”结果。
    Drop,
    /// 短路并以 [`DcfError::PluginRejected`](crate::error::DcfError::PluginRejected) 失败。
    Reject(String),
}

/// 插件内部故障。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct PluginError {
    message: String,
}

impl PluginError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// 消息拦截器契约。默认实现一律放行。
pub trait Plugin: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn on_outbound(&self, _envelope: &Envelope) -> Result<Verdict, PluginError> {
        Ok(Verdict::Pass)
    }

    fn on_inbound(&self, _envelope: &Envelope) -> Result<Verdict, PluginError> {
        Ok(Verdict::Pass)
    }
}

/// 注册后返回的插件句柄。
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PluginId(u64);

impl PluginId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "plugin#{}", self.0)
    }
}

/// 插件插入位置。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PluginPosition {
    First,
    Last,
    /// 插入到给定下标；超出长度时追加到末尾。
    At(usize),
    Before(PluginId),
    After(PluginId),
}
