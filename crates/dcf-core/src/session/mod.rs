//! # session 模块说明
//!
//! ## 角色定位（Why）
//! - [`Session`] 是拓扑控制器的对外门面：持有配置、插件链、分发器与冗余管理器，驱动
//!   `Uninitialized → Starting → Running(mode) ⇄ Reconfiguring(mode) → Stopped | Failed`；
//! - 所有改变拓扑的动作（启动、停止、重配置、故障恢复、远端指令）都经由同一把异步互斥锁串行化，
//!   对外始终只能观察到一个完整的模式。
//!
//! ## 任务结构（How）
//! - **监督任务**：接收通道丢失与控制指令信号，执行故障转移、重拨与指令应用，并周期补连
//!   P2P 名册中缺席的对等节点；
//! - **接入任务**：Server/P2P 模式下的监听循环，为每条入站链路完成握手；
//! - 通道回调在通道自身的任务中同步执行，只做“摘除通道、进入重绑、投递信号”这类非阻塞动作。
//!
//! ## 取消（Trade-offs）
//! - `stop()` 先置位停止信号，再获取互斥锁；任何持锁的挂起操作都在停止信号上 `select!`，
//!   因此停止不会被一次漫长的重拨阻塞。

mod state;
mod supervisor;
mod wiring;

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info};

pub use state::TopologyState;
use state::StateCell;

use crate::{
    channel::{Channel, ChannelObserver, ChannelOptions, ChannelState, Origin},
    config::DcfConfig,
    dispatcher::{Dispatcher, Slot},
    endpoint::EndpointId,
    envelope::{Envelope, SendOutcome, parse_recipient},
    error::DcfError,
    event::{EventBus, SessionEvent},
    frame::ControlCommand,
    mode::{Mode, ResolvedMode, Topology},
    plugin::{Plugin, PluginChain, PluginFactory, PluginId, PluginPosition, PluginRegistry},
    redundancy::{EndpointStatus, RedundancyManager, SetRole},
    transport::Connector,
};

/// 通道与监督任务之间的信号。
pub(crate) enum Signal {
    Lost {
        channel: Channel,
        error: DcfError,
        generation: u64,
    },
    Control {
        channel: Channel,
        command: ControlCommand,
    },
}

pub(crate) struct SessionInner {
    config: RwLock<DcfConfig>,
    /// 构建时配置的模式；Auto 节点在运行期仍以此判断是否接受远端指令。
    configured_mode: Mode,
    connector: Arc<dyn Connector>,
    events: EventBus,
    chain: Arc<PluginChain>,
    dispatcher: Arc<Dispatcher>,
    redundancy: Arc<RedundancyManager>,
    state: StateCell,
    runtime: tokio::sync::Mutex<()>,
    topology: Mutex<Option<Topology>>,
    local_endpoint: Mutex<Option<EndpointId>>,
    /// P2P 模式下的入站通道：只接收，不参与路由。
    accepted: DashMap<u64, Channel>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    stop_tx: watch::Sender<bool>,
    signal_tx: mpsc::UnboundedSender<Signal>,
    signal_rx: Mutex<Option<mpsc::UnboundedReceiver<Signal>>>,
    /// 每次接线递增；旧接线的通道丢失信号据此被忽略。
    generation: AtomicU64,
    next_correlation: AtomicU64,
    failure: Mutex<Option<DcfError>>,
    weak: Weak<SessionInner>,
}

/// 会话构建器。
///
/// # 教案式说明
/// - **契约 (What)**：`build()` 校验配置、确认传输连接器已提供、按配置顺序实例化插件；
///   任何一项失败都返回 [`DcfError::ConfigInvalid`]，不产生副作用。
pub struct SessionBuilder {
    config: DcfConfig,
    connector: Option<Arc<dyn Connector>>,
    registry: PluginRegistry,
    handler: Option<Box<dyn Fn(Envelope) + Send + Sync>>,
    event_capacity: usize,
}

impl SessionBuilder {
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// 注册一个可在配置 `plugins` 列表中按名称引用的插件工厂。
    pub fn plugin_factory(self, name: impl Into<String>, factory: PluginFactory) -> Self {
        self.registry.register(name, factory);
        self
    }

    pub fn handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Envelope) + Send + Sync + 'static,
    {
        self.handler = Some(Box::new(handler));
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn build(mut self) -> Result<Session, DcfError> {
        self.config.validate()?;
        self.config.assign_node_id();
        let connector = self
            .connector
            .ok_or_else(|| DcfError::config("no transport connector configured"))?;
        if let Some(missing) = self
            .config
            .plugins
            .iter()
            .find(|name| !self.registry.contains(name))
        {
            return Err(DcfError::config(format!("unknown plugin `{missing}`")));
        }

        let events = EventBus::new(self.event_capacity);
        let chain = Arc::new(PluginChain::new(events.clone()));
        for name in &self.config.plugins {
            chain.register(self.registry.create(name)?, PluginPosition::Last)?;
        }
        let dispatcher = Arc::new(Dispatcher::new(
            chain.clone(),
            self.config.dispatch.queue_capacity,
        ));
        dispatcher.set_handler(self.handler);
        let redundancy = Arc::new(RedundancyManager::new(self.config.rtt_threshold()));
        let (stop_tx, _) = watch::channel(false);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let configured_mode = self.config.mode;

        let inner = Arc::new_cyclic(|weak| SessionInner {
            config: RwLock::new(self.config),
            configured_mode,
            connector,
            state: StateCell::new(events.clone()),
            events,
            chain,
            dispatcher,
            redundancy,
            runtime: tokio::sync::Mutex::new(()),
            topology: Mutex::new(None),
            local_endpoint: Mutex::new(None),
            accepted: DashMap::new(),
            listeners: Mutex::new(Vec::new()),
            supervisor: Mutex::new(None),
            stop_tx,
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
            generation: AtomicU64::new(0),
            next_correlation: AtomicU64::new(1),
            failure: Mutex::new(None),
            weak: weak.clone(),
        });
        Ok(Session { inner })
    }
}

/// 一个通信节点。
///
/// # 教案式说明
/// - **意图 (Why)**：调用方只面对“启动、发送、停止”，模式选择、通道维护与故障转移由会话内部完成；
/// - **契约 (What)**：
///   - `start()` 只能调用一次，成功后进入 `Running(mode)`；
///   - `send_message` 仅在 `Running`/`Reconfiguring` 下可用，重配置期间的发送排队并按序冲刷；
///   - `stop()` 幂等，返回后不再有打开的通道与后台任务；
/// - **风险 (Trade-offs)**：句柄被直接丢弃时只能同步中止通道，不会发送 `Goodbye`。
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn builder(config: DcfConfig) -> SessionBuilder {
        SessionBuilder {
            config,
            connector: None,
            registry: PluginRegistry::new(),
            handler: None,
            event_capacity: 256,
        }
    }

    /// 解析模式并建立该模式所需的全部通道与监听。
    pub async fn start(&self) -> Result<ResolvedMode, DcfError> {
        self.inner.start().await
    }

    pub async fn stop(&self) -> Result<(), DcfError> {
        self.inner.stop().await
    }

    /// 发送一条消息。
    ///
    /// `recipient` 为空字符串时走默认路由（P2P 为广播）；Client/Server 模式忽略该参数。
    pub async fn send_message(
        &self,
        payload: impl Into<Bytes>,
        recipient: &str,
    ) -> Result<SendOutcome, DcfError> {
        self.inner.send_message(payload.into(), recipient).await
    }

    /// 替换入站回调，对下一条入站消息生效。
    pub fn register_handler<F>(&self, handler: F)
    where
        F: Fn(Envelope) + Send + Sync + 'static,
    {
        self.inner.dispatcher.set_handler(Some(Box::new(handler)));
    }

    pub fn clear_handler(&self) {
        self.inner.dispatcher.set_handler(None);
    }

    pub fn register_plugin(
        &self,
        plugin: Arc<dyn Plugin>,
        position: PluginPosition,
    ) -> Result<PluginId, DcfError> {
        self.inner.chain.register(plugin, position)
    }

    pub fn unregister_plugin(&self, id: PluginId) -> Result<(), DcfError> {
        if self.inner.chain.unregister(id) {
            Ok(())
        } else {
            Err(DcfError::config(format!("{id} is not registered")))
        }
    }

    /// 切换到另一模式。期间状态为 `Reconfiguring(旧模式)`，发送排队。
    pub async fn reconfigure(&self, mode: Mode) -> Result<ResolvedMode, DcfError> {
        self.inner.reconfigure(mode).await
    }

    /// 向远端下发控制指令，返回写入的通道数。路由规则与 `send_message` 相同。
    pub fn send_control(
        &self,
        recipient: &str,
        command: ControlCommand,
    ) -> Result<usize, DcfError> {
        let state = self.state();
        if !state.accepts_sends() {
            return Err(DcfError::invalid_state("send_control", state));
        }
        let recipient = parse_recipient(recipient)?;
        self.inner.dispatcher.send_control(recipient, command)
    }

    /// 运行期按键更新配置，与远端 `UpdateConfig` 指令走同一路径；
    /// 排队上限与 RTT 阈值立即生效，其余键在下一次接线时生效。
    pub fn update_config(&self, key: &str, value: &str) -> Result<(), DcfError> {
        self.inner.apply_update(key, value)
    }

    pub fn state(&self) -> TopologyState {
        self.inner.state.get()
    }

    pub fn watch_state(&self) -> watch::Receiver<TopologyState> {
        self.inner.state.subscribe()
    }

    pub fn mode(&self) -> Option<ResolvedMode> {
        self.state().mode()
    }

    pub fn topology(&self) -> Option<Topology> {
        self.inner.topology.lock().clone()
    }

    /// 当前打开的通道数（含 P2P 的只收通道）。
    pub fn open_channels(&self) -> usize {
        let accepted = self
            .inner
            .accepted
            .iter()
            .filter(|entry| entry.value().state().is_open())
            .count();
        self.inner.dispatcher.open_channels() + accepted
    }

    pub fn channel_states(&self) -> Vec<(EndpointId, ChannelState)> {
        self.inner.dispatcher.channel_states()
    }

    pub fn peers(&self, role: SetRole) -> Vec<EndpointStatus> {
        self.inner.redundancy.snapshot(role)
    }

    /// 集合中 RTT 最低的存活端点，未测量的排在最后，rank 裁决平局。
    ///
    /// RTT 来自 Auto 探测与拨号通道的存活探测，因此运行期持续刷新。
    pub fn optimal_route(&self, role: SetRole) -> Option<EndpointId> {
        self.inner.redundancy.optimal_route(role, None)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// 监听地址；仅 Server/P2P 模式在运行期有值。
    pub fn local_endpoint(&self) -> Option<EndpointId> {
        self.inner.local_endpoint.lock().clone()
    }

    pub fn node_id(&self) -> String {
        self.inner.config.read().node_id()
    }

    pub fn config(&self) -> DcfConfig {
        self.inner.config.read().clone()
    }

    /// 插件链当前的执行顺序。
    pub fn plugins(&self) -> Vec<(PluginId, String)> {
        self.inner.chain.names()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.inner.abort_now();
    }
}

impl SessionInner {
    fn arc(&self) -> Option<Arc<SessionInner>> {
        self.weak.upgrade()
    }

    fn stopping(&self) -> bool {
        *self.stop_tx.borrow()
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn channel_options(&self) -> ChannelOptions {
        let advertise = self.local_endpoint.lock().clone();
        ChannelOptions::from_config(&self.config.read(), advertise)
    }

    fn observer(&self) -> Arc<dyn ChannelObserver> {
        Arc::new(SessionObserver {
            session: self.weak.clone(),
            generation: self.current_generation(),
        })
    }

    /// 在停止信号上竞争执行 `future`；停止先到达时返回 [`DcfError::Cancelled`]。
    async fn until_stopped<T>(
        &self,
        operation: &'static str,
        future: impl Future<Output = Result<T, DcfError>>,
    ) -> Result<T, DcfError> {
        let mut stop = self.stop_tx.subscribe();
        if *stop.borrow_and_update() {
            return Err(DcfError::cancelled(operation));
        }
        tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => Err(DcfError::cancelled(operation)),
            result = future => result,
        }
    }

    async fn pause(&self, duration: Duration) -> Result<(), DcfError> {
        self.until_stopped("retry backoff", async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }

    async fn start(&self) -> Result<ResolvedMode, DcfError> {
        let _guard = self.runtime.lock().await;
        self.state.transition_if(
            "start",
            |state| state == TopologyState::Uninitialized,
            TopologyState::Starting,
        )?;
        self.spawn_supervisor();

        let mode = self.config.read().mode;
        match self.until_stopped("start", self.wire(mode)).await {
            Ok(resolved) => {
                self.state.transition("start", TopologyState::Running(resolved))?;
                self.events.publish(SessionEvent::ModeResolved { mode: resolved });
                info!(mode = %resolved, node = %self.config.read().node_id(), "session started");
                Ok(resolved)
            }
            Err(err) => {
                if !self.stopping() {
                    self.teardown().await;
                    self.fail(err.clone());
                }
                Err(err)
            }
        }
    }

    async fn stop(&self) -> Result<(), DcfError> {
        if self.state.get() == TopologyState::Stopped {
            return Ok(());
        }
        self.stop_tx.send_replace(true);
        let _guard = self.runtime.lock().await;
        if self.state.get() == TopologyState::Stopped {
            return Ok(());
        }
        self.dispatcher.abort_all(DcfError::cancelled("send_message"));
        if let Some(supervisor) = self.supervisor.lock().take() {
            supervisor.abort();
        }
        self.teardown().await;
        self.redundancy.clear();
        self.state.transition("stop", TopologyState::Stopped)?;
        info!("session stopped");
        Ok(())
    }

    async fn send_message(&self, payload: Bytes, recipient: &str) -> Result<SendOutcome, DcfError> {
        let state = self.state.get();
        let mode = match state {
            TopologyState::Running(mode) | TopologyState::Reconfiguring(mode) => mode,
            TopologyState::Failed => {
                return Err(self
                    .failure
                    .lock()
                    .clone()
                    .unwrap_or_else(|| DcfError::master_unreachable("session")));
            }
            other => return Err(DcfError::invalid_state("send_message", other)),
        };
        let recipient = match mode {
            ResolvedMode::Client | ResolvedMode::Server => None,
            ResolvedMode::P2P | ResolvedMode::Master => parse_recipient(recipient)?,
        };
        let mut envelope = Envelope::outbound(payload, recipient);
        envelope.correlation_id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        envelope.sender = Some(self.config.read().node_id());
        self.dispatcher.send_out(envelope).await
    }

    async fn reconfigure(&self, mode: Mode) -> Result<ResolvedMode, DcfError> {
        let _guard = self.runtime.lock().await;
        self.reconfigure_locked(mode).await
    }

    /// 调用方须已持有 `runtime` 锁。
    async fn reconfigure_locked(&self, mode: Mode) -> Result<ResolvedMode, DcfError> {
        let from = match self.state.get() {
            TopologyState::Running(from) => from,
            other => return Err(DcfError::invalid_state("reconfigure", other)),
        };
        self.state
            .transition("reconfigure", TopologyState::Reconfiguring(from))?;
        info!(from = %from, to = %mode, "reconfiguring topology");

        let mut slots = vec![Slot::Sole];
        slots.extend(
            self.dispatcher
                .channels()
                .into_iter()
                .filter(|_| from == ResolvedMode::P2P)
                .map(|channel| Slot::Peer(channel.endpoint().clone())),
        );
        for slot in &slots {
            self.dispatcher.begin_rebind(slot.clone());
        }

        self.teardown().await;
        self.redundancy.clear();
        self.config.write().mode = mode;

        match self.until_stopped("reconfigure", self.wire(mode)).await {
            Ok(resolved) => {
                for slot in slots {
                    let replacement = match &slot {
                        Slot::Sole if !resolved.is_multi_channel() => {
                            self.dispatcher.sole_channel()
                        }
                        Slot::Sole => None,
                        Slot::Peer(endpoint) if resolved == ResolvedMode::P2P => {
                            self.dispatcher.channel(endpoint)
                        }
                        Slot::Peer(_) => None,
                    };
                    match replacement {
                        Some(channel) => self.dispatcher.complete_rebind(slot, channel),
                        None => self.dispatcher.release_rebind(&slot),
                    }
                }
                self.state
                    .transition("reconfigure", TopologyState::Running(resolved))?;
                self.events.publish(SessionEvent::ModeResolved { mode: resolved });
                Ok(resolved)
            }
            Err(err) => {
                if !self.stopping() {
                    self.dispatcher.abort_all(err.clone());
                    self.teardown().await;
                    self.fail(err.clone());
                }
                Err(err)
            }
        }
    }

    fn fail(&self, error: DcfError) {
        info!(error = %error, code = error.code(), "topology failed");
        *self.failure.lock() = Some(error);
        let _ = self.state.transition("fail", TopologyState::Failed);
    }

    fn spawn_supervisor(&self) {
        let Some(signals) = self.signal_rx.lock().take() else {
            return;
        };
        let Some(session) = self.arc() else {
            return;
        };
        let stop = self.stop_tx.subscribe();
        let handle = tokio::spawn(supervisor::supervise(session, signals, stop));
        *self.supervisor.lock() = Some(handle);
    }

    /// 关闭全部通道与监听，不改变拓扑状态。
    async fn teardown(&self) {
        let listeners = std::mem::take(&mut *self.listeners.lock());
        for listener in listeners {
            listener.abort();
            // 任务退出后监听地址才被释放。
            let _ = listener.await;
        }
        let mut channels = self.dispatcher.take_channels();
        let accepted: Vec<u64> = self.accepted.iter().map(|entry| *entry.key()).collect();
        for id in accepted {
            if let Some((_, channel)) = self.accepted.remove(&id) {
                channels.push(channel);
            }
        }
        debug!(channels = channels.len(), "closing channels");
        futures::future::join_all(channels.iter().map(Channel::close)).await;
        *self.topology.lock() = None;
        *self.local_endpoint.lock() = None;
        self.dispatcher.set_policy(Default::default());
    }

    /// 句柄被丢弃时的同步收尾。
    fn abort_now(&self) {
        self.stop_tx.send_replace(true);
        if let Some(supervisor) = self.supervisor.lock().take() {
            supervisor.abort();
        }
        for listener in std::mem::take(&mut *self.listeners.lock()) {
            listener.abort();
        }
        for channel in self.dispatcher.take_channels() {
            channel.abort();
        }
        self.accepted.retain(|_, channel| {
            channel.abort();
            false
        });
        self.dispatcher.abort_all(DcfError::cancelled("send_message"));
    }
}

/// 会话对通道回调的实现。
///
/// 持有弱引用，通道任务不会延长会话的生命周期。
struct SessionObserver {
    session: Weak<SessionInner>,
    generation: u64,
}

impl ChannelObserver for SessionObserver {
    fn on_data(&self, channel: &Channel, envelope: Envelope) {
        if let Some(session) = self.session.upgrade() {
            session.dispatcher.deliver_in(channel, envelope);
        }
    }

    fn on_control(&self, channel: &Channel, command: ControlCommand) {
        if let Some(session) = self.session.upgrade() {
            let _ = session.signal_tx.send(Signal::Control {
                channel: channel.clone(),
                command,
            });
        }
    }

    fn on_liveness(&self, channel: &Channel, state: ChannelState) {
        if let Some(session) = self.session.upgrade() {
            session.events.publish(SessionEvent::ChannelDegraded {
                endpoint: channel.endpoint().clone(),
                state,
            });
        }
    }

    fn on_rtt(&self, channel: &Channel, rtt: Duration) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let role = match session.dispatcher.policy().mode() {
            Some(ResolvedMode::Master) => SetRole::Masters,
            Some(ResolvedMode::P2P) => SetRole::Peers,
            _ => return,
        };
        session.redundancy.record_rtt(role, channel.endpoint(), rtt);
    }

    fn on_lost(&self, channel: &Channel, error: DcfError) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        if session.stopping() || self.generation != session.current_generation() {
            return;
        }
        match channel.origin() {
            Origin::Dialed => {
                let slot = match session.dispatcher.policy().mode() {
                    Some(ResolvedMode::P2P) => Slot::Peer(channel.endpoint().clone()),
                    _ => Slot::Sole,
                };
                session.dispatcher.begin_rebind(slot);
                session.dispatcher.remove_channel(channel);
                let _ = session.signal_tx.send(Signal::Lost {
                    channel: channel.clone(),
                    error: error.clone(),
                    generation: self.generation,
                });
            }
            Origin::Accepted => {
                session.dispatcher.remove_channel(channel);
                session.accepted.remove(&channel.id());
            }
        }
        session.events.publish(SessionEvent::ChannelClosed {
            endpoint: channel.endpoint().clone(),
            reason: Some(error),
        });
    }
}
