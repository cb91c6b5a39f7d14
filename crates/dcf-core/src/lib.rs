#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = "dcf-core: 多拓扑通信框架核心。一个节点以 Client、Server、P2P、Master 或 Auto 模式运行，"]
#![doc = "模式之间可在运行期切换，主节点与对等节点的冗余集合在链路失效时自动故障转移。"]
#![doc = ""]
#![doc = "== 分层 =="]
#![doc = "1. [`session`]：拓扑控制器状态机，对外的唯一入口 [`Session`]；"]
#![doc = "2. [`dispatcher`] 与 [`plugin`]：出站与入站消息经插件链后按模式路由；"]
#![doc = "3. [`redundancy`]：按 rank 排序的冗余集合、活动端点与 RTT 分组；"]
#![doc = "4. [`channel`] 与 [`transport`]：单个远端的双向通道、存活探测与可替换的传输层。"]
#![doc = ""]
#![doc = "== 错误 =="]
#![doc = "全部可失败操作返回 [`DcfError`]，每个变体都带有稳定错误码（见 [`error::codes`]）。"]

pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod event;
pub mod frame;
pub mod mode;
pub mod plugin;
pub mod redundancy;
pub mod session;
pub mod transport;

pub use async_trait::async_trait;

pub use config::DcfConfig;
pub use endpoint::{Endpoint, EndpointId, RedundancySet, RoleHint};
pub use envelope::{AckToken, BroadcastReport, Envelope, SendOutcome};
pub use error::{DcfError, ErrorKind, SendStage};
pub use event::SessionEvent;
pub use frame::ControlCommand;
pub use mode::{Mode, ResolvedMode, Topology};
pub use session::{Session, SessionBuilder, TopologyState};

/// 常用类型的一站式导入。
pub mod prelude {
    pub use crate::{
        AckToken, ControlCommand, DcfConfig, DcfError, Envelope, Mode, ResolvedMode, SendOutcome,
        Session, SessionEvent, TopologyState,
        plugin::{Plugin, PluginError, PluginPosition, Verdict},
        transport::{Connector, memory::MemoryNetwork},
    };
}
