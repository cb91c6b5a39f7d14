use core::fmt;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::{
    error::DcfError,
    event::{EventBus, SessionEvent},
    mode::ResolvedMode,
};

/// 拓扑控制器状态。
///
/// # 教案式说明
/// - **意图 (Why)**：对外只暴露一个原子可见的状态，调用方任何时刻都看不到“半个模式”；
/// - **契约 (What)**：跃迁受 [`TopologyState::can_transition_to`] 约束，`Stopped` 为终态；
/// - **风险 (Trade-offs)**：`Reconfiguring` 记录的是旧模式，新模式在回到 `Running` 时才可见。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TopologyState {
    Uninitialized,
    Starting,
    Running(ResolvedMode),
    Reconfiguring(ResolvedMode),
    Stopped,
    Failed,
}

impl TopologyState {
    pub fn can_transition_to(self, target: TopologyState) -> bool {
        use TopologyState::*;
        matches!(
            (self, target),
            (Uninitialized, Starting)
                | (Uninitialized, Stopped)
                | (Starting, Running(_))
                | (Starting, Failed)
                | (Starting, Stopped)
                | (Running(_), Reconfiguring(_))
                | (Running(_), Failed)
                | (Running(_), Stopped)
                | (Reconfiguring(_), Running(_))
                | (Reconfiguring(_), Failed)
                | (Reconfiguring(_), Stopped)
                | (Failed, Stopped)
        )
    }

    /// 是否允许发送消息。
    pub fn accepts_sends(self) -> bool {
        matches!(self, TopologyState::Running(_) | TopologyState::Reconfiguring(_))
    }

    pub fn mode(self) -> Option<ResolvedMode> {
        match self {
            TopologyState::Running(mode) | TopologyState::Reconfiguring(mode) => Some(mode),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TopologyState::Stopped)
    }
}

impl fmt::Display for TopologyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyState::Uninitialized => f.write_str("uninitialized"),
            TopologyState::Starting => f.write_str("starting"),
            TopologyState::Running(mode) => write!(f, "running({mode})"),
            TopologyState::Reconfiguring(mode) => write!(f, "reconfiguring({mode})"),
            TopologyState::Stopped => f.write_str("stopped"),
            TopologyState::Failed => f.write_str("failed"),
        }
    }
}

/// 状态单元：互斥锁保存当前值，`watch` 向观察者广播。
pub(crate) struct StateCell {
    current: Mutex<TopologyState>,
    watch: watch::Sender<TopologyState>,
    events: EventBus,
}

impl StateCell {
    pub(crate) fn new(events: EventBus) -> Self {
        let (watch, _) = watch::channel(TopologyState::Uninitialized);
        Self {
            current: Mutex::new(TopologyState::Uninitialized),
            watch,
            events,
        }
    }

    pub(crate) fn get(&self) -> TopologyState {
        *self.current.lock()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<TopologyState> {
        self.watch.subscribe()
    }

    /// 执行一次跃迁；非法跃迁返回 [`DcfError::InvalidState`]。
    pub(crate) fn transition(
        &self,
        operation: &'static str,
        target: TopologyState,
    ) -> Result<TopologyState, DcfError> {
        self.transition_if(operation, |_| true, target)
    }

    /// 仅在当前状态满足 `predicate` 且跃迁合法时执行，判断与写入在同一临界区内完成。
    pub(crate) fn transition_if(
        &self,
        operation: &'static str,
        predicate: impl FnOnce(TopologyState) -> bool,
        target: TopologyState,
    ) -> Result<TopologyState, DcfError> {
        let from = {
            let mut current = self.current.lock();
            let from = *current;
            if !predicate(from) || !from.can_transition_to(target) {
                debug!(operation, from = %from, to = %target, "topology transition refused");
                return Err(DcfError::invalid_state(operation, from));
            }
            *current = target;
            self.watch.send_replace(target);
            from
        };
        info!(operation, from = %from, to = %target, "topology state changed");
        self.events.publish(SessionEvent::StateChanged { from, to: target });
        Ok(from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_graph() {
        use TopologyState::*;
        let master = ResolvedMode::Master;
        assert!(Uninitialized.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running(master)));
        assert!(Running(master).can_transition_to(Reconfiguring(master)));
        assert!(Reconfiguring(master).can_transition_to(Running(ResolvedMode::P2P)));
        assert!(Reconfiguring(master).can_transition_to(Failed));
        assert!(Failed.can_transition_to(Stopped));
        assert!(!Stopped.can_transition_to(Starting));
        assert!(!Failed.can_transition_to(Running(master)));
        assert!(!Running(master).can_transition_to(Starting));
    }

    #[test]
    fn cell_publishes_and_rejects() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let cell = StateCell::new(events);
        let watch = cell.subscribe();
        cell.transition("start", TopologyState::Starting).expect("start");
        assert_eq!(*watch.borrow(), TopologyState::Starting);
        assert!(matches!(
            rx.try_recv(),
            Ok(SessionEvent::StateChanged {
                from: TopologyState::Uninitialized,
                to: TopologyState::Starting
            })
        ));
        let err = cell.transition("start", TopologyState::Starting).unwrap_err();
        assert_eq!(err.code(), crate::error::codes::INVALID_STATE);
    }
}
