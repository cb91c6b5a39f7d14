//! 运行模式与拓扑变体。
//!
//! [`Mode`] 是配置层面的五选一；`Auto` 在启动探测后被解析为 [`ResolvedMode`]，此后行为与
//! 解析结果完全一致。[`Topology`] 则是运行期的标签化变体，每个变体只携带自己需要的字段。

use core::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    endpoint::{EndpointId, RedundancySet},
    error::DcfError,
};

/// 配置层面的运行模式。
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Client,
    Server,
    P2P,
    #[default]
    Auto,
    Master,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Client => "client",
            Mode::Server => "server",
            Mode::P2P => "p2p",
            Mode::Auto => "auto",
            Mode::Master => "master",
        }
    }

    /// 非 Auto 模式可直接转换为已解析模式。
    pub fn resolved(self) -> Option<ResolvedMode> {
        match self {
            Mode::Client => Some(ResolvedMode::Client),
            Mode::Server => Some(ResolvedMode::Server),
            Mode::P2P => Some(ResolvedMode::P2P),
            Mode::Master => Some(ResolvedMode::Master),
            Mode::Auto => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = DcfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "client" => Ok(Mode::Client),
            "server" => Ok(Mode::Server),
            "p2p" => Ok(Mode::P2P),
            "auto" => Ok(Mode::Auto),
            "master" => Ok(Mode::Master),
            other => Err(DcfError::config(format!("unknown mode `{other}`"))),
        }
    }
}

/// Auto 解析后的具体模式。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ResolvedMode {
    Client,
    Server,
    P2P,
    Master,
}

impl ResolvedMode {
    pub fn as_mode(self) -> Mode {
        match self {
            ResolvedMode::Client => Mode::Client,
            ResolvedMode::Server => Mode::Server,
            ResolvedMode::P2P => Mode::P2P,
            ResolvedMode::Master => Mode::Master,
        }
    }

    /// 该模式下是否可能同时存在多条通道。
    pub fn is_multi_channel(self) -> bool {
        matches!(self, ResolvedMode::P2P | ResolvedMode::Server)
    }
}

impl fmt::Display for ResolvedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_mode().fmt(f)
    }
}

/// 运行期拓扑。
///
/// # 教案式说明
/// - **意图 (Why)**：五种模式之间互斥，用标签化变体代替共享可变基类，使 Client 不会意外读到
///   对等节点名册，Master 也不会误用单一端点；
/// - **契约 (What)**：`Client`/`Master` 对外只有一条通道；`Server` 为被动监听；`P2P` 对名册中
///   每个对等节点维护一条通道。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Topology {
    Client { endpoint: EndpointId },
    Server { bind: EndpointId },
    P2P { listen: EndpointId, roster: RedundancySet },
    Master { set: RedundancySet },
}

impl Topology {
    pub fn mode(&self) -> ResolvedMode {
        match self {
            Topology::Client { .. } => ResolvedMode::Client,
            Topology::Server { .. } => ResolvedMode::Server,
            Topology::P2P { .. } => ResolvedMode::P2P,
            Topology::Master { .. } => ResolvedMode::Master,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("P2P".parse::<Mode>().ok(), Some(Mode::P2P));
        assert_eq!(" master ".parse::<Mode>().ok(), Some(Mode::Master));
        assert!("mesh".parse::<Mode>().is_err());
    }

    #[test]
    fn auto_has_no_direct_resolution() {
        assert_eq!(Mode::Auto.resolved(), None);
        assert_eq!(Mode::Server.resolved(), Some(ResolvedMode::Server));
        assert_eq!(ResolvedMode::Master.as_mode(), Mode::Master);
    }
}
