//! # dispatcher 模块说明
//!
//! ## 角色定位（Why）
//! - 位于拓扑控制器与通道之间：出站消息先经插件链，再按模式路由到一条或多条通道；入站消息经
//!   插件链后交给应用回调；
//! - 重配置期间，发往被替换通道的消息进入有界队列，替换通道就绪后按原顺序冲刷。
//!
//! ## 路由规则（What）
//! - Client/Master 默认走 [`Route::Sole`]；Master 的显式收件人必须属于主节点集合，否则
//!   [`DcfError::RecipientUnknown`]；
//! - Server 忽略收件人：一条入站通道时返回 `Delivered`，多条时广播，没有时 `Unavailable`；
//! - P2P 有收件人时走 [`Route::Direct`]，否则 [`Route::Broadcast`]，返回逐通道结果；收件人
//!   不在名册中为 [`DcfError::RecipientUnknown`]，在名册中但暂无通道为
//!   [`DcfError::MasterUnreachable`]，广播报告中也以同样的错误列出这些对等节点。
//!
//! ## 并发（How）
//! - 通道表为 `DashMap`；重绑队列位于一把 `parking_lot::Mutex` 下，检查“是否在重绑”与入队
//!   在同一临界区内完成，冲刷时也持有该锁按队列顺序提交，之后到达的发送必然排在其后；
//! - 应用回调存放于 `ArcSwapOption`，替换对下一条消息生效。

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use arc_swap::{ArcSwap, ArcSwapOption};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::{
    channel::{Channel, ChannelState},
    endpoint::EndpointId,
    envelope::{AckToken, BroadcastReport, Envelope, SendOutcome},
    error::{DcfError, ErrorKind},
    frame::ControlCommand,
    mode::ResolvedMode,
    plugin::{ChainOutcome, PluginChain},
    redundancy::SetRole,
};

/// 应用入站回调。
pub type Handler = Box<dyn Fn(Envelope) + Send + Sync>;

/// 出站路由。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Route {
    Sole,
    Direct(EndpointId),
    Broadcast,
}

/// 可进入重绑状态的发送槽位。
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Slot {
    Sole,
    Peer(EndpointId),
}

/// 当前模式下的路由策略。
#[derive(Clone, Debug, Default)]
pub enum RoutingPolicy {
    #[default]
    Idle,
    Client,
    Server,
    /// `roster` 为本节点应当拨号的对等节点，不含自身。
    P2P {
        roster: HashSet<EndpointId>,
    },
    Master {
        members: HashSet<EndpointId>,
    },
}

impl RoutingPolicy {
    pub fn mode(&self) -> Option<ResolvedMode> {
        match self {
            RoutingPolicy::Idle => None,
            RoutingPolicy::Client => Some(ResolvedMode::Client),
            RoutingPolicy::Server => Some(ResolvedMode::Server),
            RoutingPolicy::P2P { .. } => Some(ResolvedMode::P2P),
            RoutingPolicy::Master { .. } => Some(ResolvedMode::Master),
        }
    }
}

type Reply = oneshot::Sender<Result<AckToken, DcfError>>;

struct QueuedSend {
    envelope: Envelope,
    reply: Reply,
}

enum Staged {
    Ready(Channel),
    Queued(oneshot::Receiver<Result<AckToken, DcfError>>),
}

pub struct Dispatcher {
    chain: Arc<PluginChain>,
    channels: DashMap<EndpointId, Channel>,
    sole: Mutex<Option<EndpointId>>,
    policy: ArcSwap<RoutingPolicy>,
    rebinding: Mutex<HashMap<Slot, VecDeque<QueuedSend>>>,
    capacity: AtomicUsize,
    handler: ArcSwapOption<Handler>,
}

impl Dispatcher {
    pub fn new(chain: Arc<PluginChain>, queue_capacity: usize) -> Self {
        Self {
            chain,
            channels: DashMap::new(),
            sole: Mutex::new(None),
            policy: ArcSwap::from_pointee(RoutingPolicy::Idle),
            rebinding: Mutex::new(HashMap::new()),
            capacity: AtomicUsize::new(queue_capacity.max(1)),
            handler: ArcSwapOption::empty(),
        }
    }

    pub fn chain(&self) -> &Arc<PluginChain> {
        &self.chain
    }

    pub fn set_policy(&self, policy: RoutingPolicy) {
        self.policy.store(Arc::new(policy));
    }

    pub fn policy(&self) -> Arc<RoutingPolicy> {
        self.policy.load_full()
    }

    pub fn set_queue_capacity(&self, capacity: usize) {
        self.capacity.store(capacity.max(1), Ordering::Release);
    }

    pub fn queue_capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    pub fn set_handler(&self, handler: Option<Handler>) {
        self.handler.store(handler.map(Arc::new));
    }

    pub fn has_handler(&self) -> bool {
        self.handler.load().is_some()
    }

    // ---- 通道表 ----

    /// 加入可路由通道；`sole = true` 时同时成为唯一通道。
    pub fn insert_channel(&self, channel: Channel, sole: bool) -> Option<Channel> {
        let endpoint = channel.endpoint().clone();
        if sole {
            *self.sole.lock() = Some(endpoint.clone());
        }
        self.channels.insert(endpoint, channel)
    }

    /// 仅当表中仍是同一通道实例时移除。
    pub fn remove_channel(&self, channel: &Channel) -> bool {
        let removed = self
            .channels
            .remove_if(channel.endpoint(), |_, current| current.id() == channel.id())
            .is_some();
        if removed {
            let mut sole = self.sole.lock();
            if sole.as_ref() == Some(channel.endpoint()) {
                *sole = None;
            }
        }
        removed
    }

    pub fn channel(&self, endpoint: &EndpointId) -> Option<Channel> {
        self.channels.get(endpoint).map(|entry| entry.value().clone())
    }

    pub fn sole_channel(&self) -> Option<Channel> {
        let sole = self.sole.lock().clone()?;
        self.channel(&sole)
    }

    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> =
            self.channels.iter().map(|entry| entry.value().clone()).collect();
        channels.sort_by(|a, b| a.endpoint().cmp(b.endpoint()));
        channels
    }

    pub fn open_channels(&self) -> usize {
        self.channels
            .iter()
            .filter(|entry| entry.value().state().is_open())
            .count()
    }

    pub fn channel_states(&self) -> Vec<(EndpointId, ChannelState)> {
        self.channels()
            .into_iter()
            .map(|channel| (channel.endpoint().clone(), channel.state()))
            .collect()
    }

    /// 取出全部通道，供拆除使用。
    pub fn take_channels(&self) -> Vec<Channel> {
        let channels = self.channels();
        self.channels.clear();
        *self.sole.lock() = None;
        channels
    }

    // ---- 重绑 ----

    /// 进入重绑：此后发往该槽位的消息排队。幂等。
    pub fn begin_rebind(&self, slot: Slot) {
        let mut rebinding = self.rebinding.lock();
        if !rebinding.contains_key(&slot) {
            debug!(slot = ?slot, "rebind started, queueing sends");
            rebinding.insert(slot, VecDeque::new());
        }
    }

    pub fn is_rebinding(&self, slot: &Slot) -> bool {
        self.rebinding.lock().contains_key(slot)
    }

    pub fn queued(&self, slot: &Slot) -> usize {
        self.rebinding.lock().get(slot).map_or(0, VecDeque::len)
    }

    /// 以新通道结束重绑，并按队列顺序冲刷。
    pub fn complete_rebind(&self, slot: Slot, channel: Channel) {
        self.insert_channel(channel.clone(), slot == Slot::Sole);
        let mut rebinding = self.rebinding.lock();
        let Some(queue) = rebinding.remove(&slot) else {
            return;
        };
        debug!(slot = ?slot, flushed = queue.len(), endpoint = %channel.endpoint(), "rebind completed");
        for queued in queue {
            match channel.submit(&queued.envelope) {
                Ok(pending) => {
                    tokio::spawn(async move {
                        let _ = queued.reply.send(pending.wait().await);
                    });
                }
                Err(err) => {
                    let _ = queued.reply.send(Err(err));
                }
            }
        }
    }

    /// 放弃重绑，所有排队发送以 `error` 结束。
    pub fn abort_rebind(&self, slot: &Slot, error: DcfError) {
        let queue = self.rebinding.lock().remove(slot);
        if let Some(queue) = queue {
            debug!(slot = ?slot, failed = queue.len(), error = %error, "rebind aborted");
            for queued in queue {
                let _ = queued.reply.send(Err(error.clone()));
            }
        }
    }

    /// 取出某槽位的排队消息，按当前策略重新路由（跨模式重配置时使用）。
    pub fn release_rebind(self: &Arc<Self>, slot: &Slot) {
        let queue = self.rebinding.lock().remove(slot);
        let Some(queue) = queue else {
            return;
        };
        let dispatcher = self.clone();
        tokio::spawn(async move {
            for queued in queue {
                let result = match dispatcher.route(&queued.envelope) {
                    Ok(route) => dispatcher.deliver(route, queued.envelope).await,
                    Err(err) => Err(err),
                };
                let reply = match result {
                    Ok(SendOutcome::Delivered(token)) => Ok(token),
                    Ok(SendOutcome::Broadcast(report)) => report
                        .results
                        .into_iter()
                        .find_map(|(_, result)| result.ok())
                        .ok_or_else(|| DcfError::Unavailable {
                            route: "broadcast".into(),
                        }),
                    Ok(SendOutcome::Dropped { plugin }) => Err(DcfError::PluginRejected {
                        plugin,
                        reason: "dropped".into(),
                    }),
                    Err(err) => Err(err),
                };
                let _ = queued.reply.send(reply);
            }
        });
    }

    /// 停止时使用：放弃全部槽位。
    pub fn abort_all(&self, error: DcfError) {
        let slots: Vec<Slot> = self.rebinding.lock().keys().cloned().collect();
        for slot in slots {
            self.abort_rebind(&slot, error.clone());
        }
    }

    // ---- 出站 ----

    /// 出站：插件链 → 路由 → 通道。
    pub async fn send_out(&self, envelope: Envelope) -> Result<SendOutcome, DcfError> {
        let envelope = match self.chain.run(envelope) {
            ChainOutcome::Forward(envelope) => envelope,
            ChainOutcome::Dropped { plugin } => return Ok(SendOutcome::Dropped { plugin }),
            ChainOutcome::Rejected { plugin, reason } => {
                return Err(DcfError::PluginRejected { plugin, reason });
            }
        };
        let route = self.route(&envelope)?;
        self.deliver(route, envelope).await
    }

    fn is_server(&self) -> bool {
        matches!(**self.policy.load(), RoutingPolicy::Server)
    }

    pub fn route(&self, envelope: &Envelope) -> Result<Route, DcfError> {
        match self.policy.load().as_ref() {
            RoutingPolicy::Idle => Err(DcfError::Unavailable {
                route: "idle".into(),
            }),
            RoutingPolicy::Client | RoutingPolicy::Server => Ok(Route::Sole),
            RoutingPolicy::Master { members } => match &envelope.recipient {
                None => Ok(Route::Sole),
                Some(recipient) if members.contains(recipient) => Ok(Route::Sole),
                Some(recipient) => Err(DcfError::recipient_unknown(recipient)),
            },
            RoutingPolicy::P2P { roster } => match &envelope.recipient {
                None => Ok(Route::Broadcast),
                Some(recipient) if roster.contains(recipient) => {
                    Ok(Route::Direct(recipient.clone()))
                }
                Some(recipient) => Err(DcfError::recipient_unknown(recipient)),
            },
        }
    }

    async fn deliver(&self, route: Route, envelope: Envelope) -> Result<SendOutcome, DcfError> {
        let server = self.is_server();
        match route {
            Route::Sole if server => {
                let channels = self.channels();
                match channels.len() {
                    0 => Err(DcfError::Unavailable {
                        route: "sole".into(),
                    }),
                    1 => channels[0].send(&envelope).await.map(SendOutcome::Delivered),
                    _ => Ok(SendOutcome::Broadcast(
                        self.broadcast_to(channels, Vec::new(), &envelope).await,
                    )),
                }
            }
            Route::Sole => self
                .send_slot(Slot::Sole, &envelope)
                .await
                .map(SendOutcome::Delivered),
            Route::Direct(endpoint) => self
                .send_slot(Slot::Peer(endpoint), &envelope)
                .await
                .map(SendOutcome::Delivered),
            Route::Broadcast => {
                let channels = self.channels();
                let mut queued = self.enqueue_rebinding_peers(&envelope);
                if channels.is_empty() && queued.is_empty() {
                    return Err(DcfError::Unavailable {
                        route: "broadcast".into(),
                    });
                }
                queued.extend(
                    self.absent_peers()
                        .into_iter()
                        .map(|peer| (peer, Err(DcfError::master_unreachable(SetRole::Peers)))),
                );
                Ok(SendOutcome::Broadcast(
                    self.broadcast_to(channels, queued, &envelope).await,
                ))
            }
        }
    }

    fn stage(&self, slot: &Slot, envelope: &Envelope) -> Result<Staged, DcfError> {
        let mut rebinding = self.rebinding.lock();
        if let Some(queue) = rebinding.get_mut(slot) {
            let capacity = self.queue_capacity();
            if queue.len() >= capacity {
                return Err(DcfError::Backpressure { capacity });
            }
            let (reply, receiver) = oneshot::channel();
            queue.push_back(QueuedSend {
                envelope: envelope.clone(),
                reply,
            });
            return Ok(Staged::Queued(receiver));
        }
        drop(rebinding);
        let channel = match slot {
            Slot::Sole => self.sole_channel().ok_or_else(|| DcfError::Unavailable {
                route: "sole".into(),
            })?,
            Slot::Peer(endpoint) => self
                .channel(endpoint)
                .ok_or_else(|| self.missing_peer(endpoint))?,
        };
        Ok(Staged::Ready(channel))
    }

    /// 名册中的对等节点暂无通道时为 `MasterUnreachable`，否则为 `RecipientUnknown`。
    fn missing_peer(&self, endpoint: &EndpointId) -> DcfError {
        match self.policy.load().as_ref() {
            RoutingPolicy::P2P { roster } if roster.contains(endpoint) => {
                DcfError::master_unreachable(SetRole::Peers)
            }
            _ => DcfError::recipient_unknown(endpoint),
        }
    }

    /// 名册中既无通道、也不在重绑中的对等节点，按端点排序。
    pub fn absent_peers(&self) -> Vec<EndpointId> {
        let policy = self.policy.load_full();
        let RoutingPolicy::P2P { roster } = policy.as_ref() else {
            return Vec::new();
        };
        let rebinding = self.rebinding.lock();
        let mut absent: Vec<EndpointId> = roster
            .iter()
            .filter(|peer| !self.channels.contains_key(*peer))
            .filter(|peer| !rebinding.contains_key(&Slot::Peer((*peer).clone())))
            .cloned()
            .collect();
        absent.sort();
        absent
    }

    async fn await_queued(
        receiver: oneshot::Receiver<Result<AckToken, DcfError>>,
    ) -> Result<AckToken, DcfError> {
        receiver
            .await
            .unwrap_or_else(|_| Err(DcfError::cancelled("queued send")))
    }

    /// 经由槽位发送：重绑中则排队，否则直接发送；若发送因链路断开失败且槽位随即进入重绑，
    /// 则转入队列等待替换通道。
    async fn send_slot(&self, slot: Slot, envelope: &Envelope) -> Result<AckToken, DcfError> {
        let channel = match self.stage(&slot, envelope)? {
            Staged::Queued(receiver) => return Self::await_queued(receiver).await,
            Staged::Ready(channel) => channel,
        };
        match channel.send(envelope).await {
            Err(err) if err.kind() == ErrorKind::Connectivity && self.is_rebinding(&slot) => {
                debug!(slot = ?slot, error = %err, "send raced with channel loss, requeueing");
                match self.stage(&slot, envelope)? {
                    Staged::Queued(receiver) => Self::await_queued(receiver).await,
                    Staged::Ready(retry) => retry.send(envelope).await,
                }
            }
            other => other,
        }
    }

    fn enqueue_rebinding_peers(
        &self,
        envelope: &Envelope,
    ) -> Vec<(EndpointId, Result<oneshot::Receiver<Result<AckToken, DcfError>>, DcfError>)> {
        let mut rebinding = self.rebinding.lock();
        let capacity = self.queue_capacity();
        let mut staged = Vec::new();
        for (slot, queue) in rebinding.iter_mut() {
            let Slot::Peer(endpoint) = slot else {
                continue;
            };
            if self.channels.contains_key(endpoint) {
                continue;
            }
            if queue.len() >= capacity {
                staged.push((endpoint.clone(), Err(DcfError::Backpressure { capacity })));
                continue;
            }
            let (reply, receiver) = oneshot::channel();
            queue.push_back(QueuedSend {
                envelope: envelope.clone(),
                reply,
            });
            staged.push((endpoint.clone(), Ok(receiver)));
        }
        staged
    }

    async fn broadcast_to(
        &self,
        channels: Vec<Channel>,
        queued: Vec<(EndpointId, Result<oneshot::Receiver<Result<AckToken, DcfError>>, DcfError>)>,
        envelope: &Envelope,
    ) -> BroadcastReport {
        let direct = join_all(channels.into_iter().map(|channel| async move {
            let result = channel.send(envelope).await;
            (channel.endpoint().clone(), result)
        }));
        let waiting = join_all(queued.into_iter().map(|(endpoint, staged)| async move {
            let result = match staged {
                Ok(receiver) => Self::await_queued(receiver).await,
                Err(err) => Err(err),
            };
            (endpoint, result)
        }));
        let (mut results, queued_results) = futures::join!(direct, waiting);
        results.extend(queued_results);
        results.sort_by(|a, b| a.0.cmp(&b.0));
        BroadcastReport { results }
    }

    /// 发送控制指令，路由规则与数据消息相同，但不等待确认。
    pub fn send_control(
        &self,
        recipient: Option<EndpointId>,
        command: ControlCommand,
    ) -> Result<usize, DcfError> {
        let addressed = Envelope::outbound(bytes::Bytes::new(), recipient);
        let server = self.is_server();
        let open = |channels: Vec<Channel>| -> Vec<Channel> {
            channels
                .into_iter()
                .filter(|channel| channel.state().is_open())
                .collect()
        };
        let targets = match self.route(&addressed)? {
            Route::Sole if server => open(self.channels()),
            Route::Sole => vec![self.sole_channel().ok_or_else(|| DcfError::Unavailable {
                route: "sole".into(),
            })?],
            Route::Direct(endpoint) => vec![
                self.channel(&endpoint)
                    .ok_or_else(|| self.missing_peer(&endpoint))?,
            ],
            Route::Broadcast => open(self.channels()),
        };
        if targets.is_empty() {
            return Err(DcfError::Unavailable {
                route: "control".into(),
            });
        }
        let mut sent = 0;
        for channel in targets {
            channel.send_control(command.clone())?;
            sent += 1;
        }
        Ok(sent)
    }

    // ---- 入站 ----

    /// 入站：插件链 → 应用回调。未注册回调时直接丢弃，不做缓冲。
    pub fn deliver_in(&self, channel: &Channel, envelope: Envelope) {
        let envelope = match self.chain.run(envelope) {
            ChainOutcome::Forward(envelope) => envelope,
            ChainOutcome::Dropped { plugin } => {
                debug!(endpoint = %channel.endpoint(), plugin = %plugin, "inbound message dropped by plugin");
                return;
            }
            ChainOutcome::Rejected { plugin, reason } => {
                debug!(endpoint = %channel.endpoint(), plugin = %plugin, reason = %reason, "inbound message rejected by plugin");
                return;
            }
        };
        match self.handler.load_full() {
            Some(handler) => (*handler)(envelope),
            None => debug!(
                endpoint = %channel.endpoint(),
                correlation_id = envelope.correlation_id,
                "no handler registered, inbound message discarded"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;

    fn dispatcher(capacity: usize) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            Arc::new(PluginChain::new(EventBus::default())),
            capacity,
        ))
    }

    fn to(recipient: Option<EndpointId>) -> Envelope {
        Envelope::outbound("m", recipient)
    }

    #[test]
    fn routes_follow_mode_rules() {
        let d = dispatcher(4);
        let master_a = EndpointId::new("a", 1);
        let stranger = EndpointId::new("z", 9);

        d.set_policy(RoutingPolicy::Master {
            members: HashSet::from([master_a.clone()]),
        });
        assert_eq!(d.route(&to(None)).ok(), Some(Route::Sole));
        assert_eq!(d.route(&to(Some(master_a))).ok(), Some(Route::Sole));
        assert!(matches!(
            d.route(&to(Some(stranger.clone()))),
            Err(DcfError::RecipientUnknown { .. })
        ));

        let peer = EndpointId::new("p", 1);
        d.set_policy(RoutingPolicy::P2P {
            roster: HashSet::from([peer.clone()]),
        });
        assert_eq!(d.route(&to(None)).ok(), Some(Route::Broadcast));
        assert_eq!(
            d.route(&to(Some(peer.clone()))).ok(),
            Some(Route::Direct(peer))
        );
        assert!(matches!(
            d.route(&to(Some(stranger.clone()))),
            Err(DcfError::RecipientUnknown { .. })
        ));

        d.set_policy(RoutingPolicy::Client);
        assert_eq!(d.route(&to(Some(stranger))).ok(), Some(Route::Sole));
    }

    #[tokio::test]
    async fn missing_channels_surface_routing_errors() {
        let d = dispatcher(4);
        let peer = EndpointId::new("p", 1);
        d.set_policy(RoutingPolicy::P2P {
            roster: HashSet::from([peer.clone()]),
        });
        assert!(matches!(
            d.send_out(to(Some(EndpointId::new("q", 2)))).await,
            Err(DcfError::RecipientUnknown { .. })
        ));
        assert_eq!(
            d.send_out(to(Some(peer.clone()))).await,
            Err(DcfError::master_unreachable(SetRole::Peers))
        );
        assert_eq!(d.absent_peers(), vec![peer.clone()]);
        assert!(matches!(
            d.send_out(to(None)).await,
            Err(DcfError::Unavailable { .. })
        ));

        d.begin_rebind(Slot::Peer(peer));
        assert!(d.absent_peers().is_empty());
        d.set_policy(RoutingPolicy::Server);
        assert!(matches!(
            d.send_out(to(None)).await,
            Err(DcfError::Unavailable { .. })
        ));
    }

    #[tokio::test]
    async fn rebind_queue_is_bounded_and_aborts_with_error() {
        let d = dispatcher(1);
        d.set_policy(RoutingPolicy::Client);
        d.begin_rebind(Slot::Sole);

        let first = tokio::spawn({
            let d = d.clone();
            async move { d.send_out(to(None)).await }
        });
        while d.queued(&Slot::Sole) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            d.send_out(to(None)).await,
            Err(DcfError::Backpressure { capacity: 1 })
        );

        d.abort_rebind(&Slot::Sole, DcfError::master_unreachable("masters"));
        let result = first.await.expect("join");
        assert!(matches!(result, Err(DcfError::MasterUnreachable { .. })));
        assert!(!d.is_rebinding(&Slot::Sole));
    }
}
