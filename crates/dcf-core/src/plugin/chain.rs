use std::{
    any::Any,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{Plugin, PluginError, PluginId, PluginPosition, Verdict};
use crate::{
    envelope::{Direction, Envelope},
    error::DcfError,
    event::{EventBus, SessionEvent},
};

struct PluginSlot {
    id: PluginId,
    plugin: Arc<dyn Plugin>,
}

/// 一次链路执行的结果。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainOutcome {
    Forward(Envelope),
    Dropped { plugin: String },
    Rejected { plugin: String, reason: String },
}

/// 会话级插件链。
///
/// # 教案式说明
/// - **意图 (Why)**：消息在途时也允许增删插件，同时保证一次分发只看到一种完整顺序；
/// - **执行 (How)**：
///   1. 插件列表保存在 `ArcSwap<Vec<Arc<PluginSlot>>>` 中，分发开始时加载一次快照；
///   2. 变更在 `mutation` 互斥锁内复制向量、修改后整体替换；
/// - **契约 (What)**：分发要么使用旧列表、要么使用新列表，不会看到半更新的顺序；
/// - **风险 (Trade-offs)**：每次变更复制整条向量，插件数量通常很小，可以接受。
pub struct PluginChain {
    slots: ArcSwap<Vec<Arc<PluginSlot>>>,
    mutation: Mutex<()>,
    sequence: AtomicU64,
    events: EventBus,
}

impl PluginChain {
    pub fn new(events: EventBus) -> Self {
        Self {
            slots: ArcSwap::from_pointee(Vec::new()),
            mutation: Mutex::new(()),
            sequence: AtomicU64::new(1),
            events,
        }
    }

    pub fn register(
        &self,
        plugin: Arc<dyn Plugin>,
        position: PluginPosition,
    ) -> Result<PluginId, DcfError> {
        let _guard = self.mutation.lock();
        let current = self.slots.load();
        let mut chain: Vec<_> = current.iter().cloned().collect();
        let index = match position {
            PluginPosition::First => 0,
            PluginPosition::Last => chain.len(),
            PluginPosition::At(index) => index.min(chain.len()),
            PluginPosition::Before(anchor) => Self::locate(&chain, anchor)?,
            PluginPosition::After(anchor) => Self::locate(&chain, anchor)? + 1,
        };
        let id = PluginId::new(self.sequence.fetch_add(1, Ordering::Relaxed));
        debug!(plugin = plugin.name(), id = %id, index, "plugin registered");
        chain.insert(index, Arc::new(PluginSlot { id, plugin }));
        self.slots.store(Arc::new(chain));
        Ok(id)
    }

    fn locate(chain: &[Arc<PluginSlot>], anchor: PluginId) -> Result<usize, DcfError> {
        chain
            .iter()
            .position(|slot| slot.id == anchor)
            .ok_or_else(|| DcfError::config(format!("unknown plugin anchor {anchor}")))
    }

    /// 移除插件；句柄不存在时返回 `false`。
    pub fn unregister(&self, id: PluginId) -> bool {
        let _guard = self.mutation.lock();
        let current = self.slots.load();
        let mut chain: Vec<_> = current.iter().cloned().collect();
        match chain.iter().position(|slot| slot.id == id) {
            Some(index) => {
                let removed = chain.remove(index);
                debug!(plugin = removed.plugin.name(), id = %id, "plugin unregistered");
                self.slots.store(Arc::new(chain));
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 当前顺序下的 `(句柄, 名称)` 列表。
    pub fn names(&self) -> Vec<(PluginId, String)> {
        self.slots
            .load()
            .iter()
            .map(|slot| (slot.id, slot.plugin.name().to_owned()))
            .collect()
    }

    /// 依注册顺序执行全部插件。
    pub fn run(&self, envelope: Envelope) -> ChainOutcome {
        let snapshot = self.slots.load_full();
        let direction = envelope.direction;
        let mut current = envelope;
        for slot in snapshot.iter() {
            let plugin = slot.plugin.as_ref();
            let verdict = catch_unwind(AssertUnwindSafe(|| match direction {
                Direction::Outbound => plugin.on_outbound(&current),
                Direction::Inbound => plugin.on_inbound(&current),
            }));
            match verdict {
                Ok(Ok(Verdict::Pass)) => {}
                Ok(Ok(Verdict::Mutate(next))) => current = next,
                Ok(Ok(Verdict::Drop)) => {
                    debug!(plugin = plugin.name(), direction = ?direction, "message dropped by plugin");
                    return ChainOutcome::Dropped {
                        plugin: plugin.name().to_owned(),
                    };
                }
                Ok(Ok(Verdict::Reject(reason))) => {
                    return ChainOutcome::Rejected {
                        plugin: plugin.name().to_owned(),
                        reason,
                    };
                }
                Ok(Err(err)) => self.report_fault(plugin.name(), direction, &err),
                Err(panic) => {
                    let err = PluginError::new(format!("panicked: {}", panic_message(&*panic)));
                    self.report_fault(plugin.name(), direction, &err);
                }
            }
        }
        ChainOutcome::Forward(current)
    }

    fn report_fault(&self, plugin: &str, direction: Direction, err: &PluginError) {
        warn!(
            plugin,
            direction = ?direction,
            error = %err,
            "plugin fault isolated, continuing chain"
        );
        self.events.publish(SessionEvent::PluginFault {
            plugin: plugin.to_owned(),
            error: DcfError::PluginFault {
                plugin: plugin.to_owned(),
                detail: err.message().to_owned(),
            },
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
