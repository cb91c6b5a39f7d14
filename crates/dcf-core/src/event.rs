//! 会话事件总线。
//!
//! 非致命信息（插件故障、故障转移、通道状态变化）以 [`SessionEvent`] 的形式广播给订阅者。
//! 总线基于 `tokio::sync::broadcast`：没有订阅者时事件直接丢弃，慢订阅者会收到 `Lagged`。

use tokio::sync::broadcast;

use crate::{
    channel::ChannelState,
    endpoint::EndpointId,
    error::DcfError,
    frame::ControlCommand,
    mode::ResolvedMode,
    redundancy::SetRole,
    session::TopologyState,
};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        from: TopologyState,
        to: TopologyState,
    },
    ModeResolved {
        mode: ResolvedMode,
    },
    ChannelOpened {
        endpoint: EndpointId,
    },
    ChannelClosed {
        endpoint: EndpointId,
        reason: Option<DcfError>,
    },
    ChannelDegraded {
        endpoint: EndpointId,
        state: ChannelState,
    },
    Failover {
        role: SetRole,
        from: EndpointId,
        to: EndpointId,
    },
    Rebound {
        endpoint: EndpointId,
    },
    Exhausted {
        role: SetRole,
        error: DcfError,
    },
    PluginFault {
        plugin: String,
        error: DcfError,
    },
    ControlApplied {
        command: ControlCommand,
    },
}

/// 可克隆的事件发布端。
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: SessionEvent) {
        // 无订阅者不是错误。
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }
}
