//! # channel 模块说明
//!
//! ## 角色定位（Why）
//! - [`Channel`] 独占一条到单个远端端点的双向链路，对上提供发送、接收、关闭与存活状态；
//! - 连接的建立（`dial`/`accept`）、确认等待与存活探测是全框架仅有的挂起点，全部收敛在此。
//!
//! ## 任务结构（How）
//! - **写任务**：从单一 FIFO 队列取帧写入链路，保证同一通道上的提交顺序即线上顺序；
//! - **读任务**：为每个 `Data` 回 `Ack`，为每个 `Ping` 回 `Pong`，解析挂起确认，转交 `Control`；
//! - **存活任务**（仅拨号端）：周期性发送 `Ping`，一次未应答进入 `Degraded`，连续
//!   `miss_threshold` 次未应答判定不可达。
//!
//! ## 状态机（What）
//! - `Disconnected → Connecting → Connected → {Degraded → Connected | Disconnected} → Closed`；
//! - 非法跃迁被忽略并记录日志，`Closed` 为终态。

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    config::DcfConfig,
    endpoint::EndpointId,
    envelope::{AckToken, Envelope},
    error::DcfError,
    frame::{ControlCommand, Frame},
    transport::{Connector, Link},
};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// 通道状态。
///
/// # 教案式说明
/// - **意图 (Why)**：`Degraded` 与 `Disconnected` 分开，使存活探测能在拆除前留出宽限期；
/// - **契约 (What)**：跃迁受 [`ChannelState::can_transition_to`] 约束。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    /// 已连接，但最近的存活探测未获应答。
    Degraded,
    Closed,
}

impl ChannelState {
    pub fn can_transition_to(self, target: ChannelState) -> bool {
        matches!(
            (self, target),
            (ChannelState::Disconnected, ChannelState::Connecting)
                | (ChannelState::Connecting, ChannelState::Connected)
                | (ChannelState::Connecting, ChannelState::Disconnected)
                | (ChannelState::Connected, ChannelState::Degraded)
                | (ChannelState::Connected, ChannelState::Disconnected)
                | (ChannelState::Degraded, ChannelState::Connected)
                | (ChannelState::Degraded, ChannelState::Disconnected)
                | (ChannelState::Disconnected, ChannelState::Closed)
                | (ChannelState::Connecting, ChannelState::Closed)
                | (ChannelState::Connected, ChannelState::Closed)
                | (ChannelState::Degraded, ChannelState::Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Closed)
    }

    /// 是否仍可承载发送。
    pub fn is_open(self) -> bool {
        matches!(self, ChannelState::Connected | ChannelState::Degraded)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ChannelState::Disconnected => "disconnected",
            ChannelState::Connecting => "connecting",
            ChannelState::Connected => "connected",
            ChannelState::Degraded => "degraded",
            ChannelState::Closed => "closed",
        };
        f.write_str(text)
    }
}

/// 通道的建立方向。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Origin {
    Dialed,
    Accepted,
}

/// 通道运行参数。
#[derive(Clone, Debug)]
pub struct ChannelOptions {
    pub node_id: String,
    /// 本节点可被回拨的地址，随 `Hello` 发给对端。
    pub advertise: Option<EndpointId>,
    pub liveness_interval: Duration,
    pub miss_threshold: u32,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub handshake_timeout: Duration,
    pub drain_timeout: Duration,
}

impl ChannelOptions {
    pub fn from_config(config: &DcfConfig, advertise: Option<EndpointId>) -> Self {
        Self {
            node_id: config.node_id(),
            advertise,
            liveness_interval: config.liveness_interval(),
            miss_threshold: config.liveness.miss_threshold,
            connect_timeout: config.connect_timeout(),
            send_timeout: config.send_timeout(),
            handshake_timeout: config.handshake_timeout(),
            drain_timeout: config.drain_timeout(),
        }
    }
}

/// 通道向所有者回报的观察接口。
///
/// 回调在通道的读任务或存活任务中同步执行；`on_data` 的调用顺序即该通道的接收顺序。
pub trait ChannelObserver: Send + Sync + 'static {
    fn on_data(&self, channel: &Channel, envelope: Envelope);

    fn on_control(&self, channel: &Channel, command: ControlCommand);

    /// `Connected ⇄ Degraded` 之间的变化。
    fn on_liveness(&self, _channel: &Channel, _state: ChannelState) {}

    /// 拨号端收到与最近一次 `Ping` 匹配的 `Pong`，`rtt` 为两者的间隔。
    fn on_rtt(&self, _channel: &Channel, _rtt: Duration) {}

    /// 通道因传输错误、对端关闭或存活耗尽而断开。挂起确认在此回调返回后才失败。
    fn on_lost(&self, channel: &Channel, error: DcfError);
}

type AckSlot = oneshot::Sender<Result<(), DcfError>>;

struct ChannelInner {
    id: u64,
    endpoint: EndpointId,
    origin: Origin,
    peer_node: Option<String>,
    link: Arc<dyn Link>,
    options: ChannelOptions,
    observer: Arc<dyn ChannelObserver>,
    state: Mutex<ChannelState>,
    state_tx: watch::Sender<ChannelState>,
    queue: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    pending: DashMap<u64, AckSlot>,
    outstanding_ping: AtomicU64,
    ping_sent: Mutex<Option<Instant>>,
    rtt: Mutex<Option<Duration>>,
    next_nonce: AtomicU64,
    closing: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

/// 到单个远端端点的通道。克隆共享同一条链路。
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.endpoint)
            .field("origin", &self.inner.origin)
            .field("state", &self.state())
            .finish()
    }
}

/// 一次已提交、尚未确认的发送。
#[must_use = "the acknowledgement must be awaited"]
pub struct PendingAck {
    channel: Channel,
    correlation_id: u64,
    receiver: oneshot::Receiver<Result<(), DcfError>>,
}

impl PendingAck {
    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    /// 等待远端 `Ack`，最长为通道的发送超时。
    pub async fn wait(self) -> Result<AckToken, DcfError> {
        let timeout = self.channel.inner.options.send_timeout;
        match tokio::time::timeout(timeout, self.receiver).await {
            Ok(Ok(Ok(()))) => Ok(AckToken::new(
                &self.channel.inner.endpoint,
                self.correlation_id,
            )),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => Err(DcfError::closed(&self.channel.inner.endpoint)),
            Err(_) => {
                self.channel.inner.pending.remove(&self.correlation_id);
                Err(DcfError::timeout("send acknowledgement", timeout))
            }
        }
    }
}

impl Channel {
    /// 主动建连：拨号（受连接超时约束）、发送 `Hello`，然后启动读、写与存活任务。
    pub async fn dial(
        connector: &dyn Connector,
        endpoint: &EndpointId,
        options: ChannelOptions,
        observer: Arc<dyn ChannelObserver>,
    ) -> Result<Channel, DcfError> {
        debug!(endpoint = %endpoint, scheme = connector.scheme(), "dialing channel");
        let link = match tokio::time::timeout(options.connect_timeout, connector.dial(endpoint))
            .await
        {
            Ok(result) => result?,
            Err(_) => return Err(DcfError::timeout("connect", options.connect_timeout)),
        };
        link.send(Frame::Hello {
            node_id: options.node_id.clone(),
            advertise: options.advertise.as_ref().map(ToString::to_string),
        })
        .await?;
        Ok(Self::spawn(
            link,
            endpoint.clone(),
            None,
            Origin::Dialed,
            options,
            observer,
        ))
    }

    /// 被动建连：在握手超时内等待 `Hello`，以对端声明的地址（否则以传输层标识）作为通道键。
    pub async fn accept(
        link: Arc<dyn Link>,
        options: ChannelOptions,
        observer: Arc<dyn ChannelObserver>,
    ) -> Result<Channel, DcfError> {
        let label = link.remote_label();
        let handshake = async {
            loop {
                match link.recv().await? {
                    Some(Frame::Hello { node_id, advertise }) => return Ok((node_id, advertise)),
                    Some(other) => {
                        debug!(remote = %label, frame = other.kind(), "frame before hello ignored");
                    }
                    None => return Err(DcfError::closed(&label)),
                }
            }
        };
        let (node_id, advertise) =
            match tokio::time::timeout(options.handshake_timeout, handshake).await {
                Ok(result) => result?,
                Err(_) => {
                    let _ = link.close().await;
                    return Err(DcfError::timeout("handshake", options.handshake_timeout));
                }
            };
        let endpoint = advertise
            .as_deref()
            .and_then(|text| text.parse::<EndpointId>().ok())
            .or_else(|| label.parse::<EndpointId>().ok())
            .unwrap_or_else(|| EndpointId::new(label.clone(), 0));
        Ok(Self::spawn(
            link,
            endpoint,
            Some(node_id),
            Origin::Accepted,
            options,
            observer,
        ))
    }

    fn spawn(
        link: Arc<dyn Link>,
        endpoint: EndpointId,
        peer_node: Option<String>,
        origin: Origin,
        options: ChannelOptions,
        observer: Arc<dyn ChannelObserver>,
    ) -> Channel {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        let channel = Channel {
            inner: Arc::new(ChannelInner {
                id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
                endpoint,
                origin,
                peer_node,
                link,
                options,
                observer,
                state: Mutex::new(ChannelState::Disconnected),
                state_tx,
                queue: Mutex::new(Some(queue_tx)),
                pending: DashMap::new(),
                outstanding_ping: AtomicU64::new(0),
                ping_sent: Mutex::new(None),
                rtt: Mutex::new(None),
                next_nonce: AtomicU64::new(1),
                closing: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
                writer: Mutex::new(None),
            }),
        };
        channel.transition(ChannelState::Connecting);
        channel.transition(ChannelState::Connected);

        let writer = tokio::spawn(channel.clone().write_loop(queue_rx));
        *channel.inner.writer.lock() = Some(writer);
        let mut tasks = vec![tokio::spawn(channel.clone().read_loop())];
        if origin == Origin::Dialed {
            tasks.push(tokio::spawn(channel.clone().liveness_loop()));
        }
        *channel.inner.tasks.lock() = tasks;

        info!(
            channel = channel.inner.id,
            endpoint = %channel.inner.endpoint,
            origin = ?origin,
            "channel connected"
        );
        channel
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn endpoint(&self) -> &EndpointId {
        &self.inner.endpoint
    }

    pub fn origin(&self) -> Origin {
        self.inner.origin
    }

    /// 对端在 `Hello` 中声明的节点标识（仅被动建连的通道）。
    pub fn peer_node(&self) -> Option<&str> {
        self.inner.peer_node.as_deref()
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.lock()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state_tx.subscribe()
    }

    /// 最近一次 `Ping`/`Pong` 往返时延；被动建连的通道不探测，始终为 `None`。
    pub fn rtt(&self) -> Option<Duration> {
        *self.inner.rtt.lock()
    }

    /// 按状态机跃迁；非法跃迁被忽略并返回 `false`。
    fn transition(&self, target: ChannelState) -> bool {
        let mut state = self.inner.state.lock();
        if *state == target {
            return false;
        }
        if !state.can_transition_to(target) {
            debug!(
                channel = self.inner.id,
                from = %*state,
                to = %target,
                "illegal channel transition ignored"
            );
            return false;
        }
        *state = target;
        self.inner.state_tx.send_replace(target);
        true
    }

    fn enqueue(&self, frame: Frame) -> Result<(), DcfError> {
        let queue = self.inner.queue.lock();
        match queue.as_ref() {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| DcfError::closed(&self.inner.endpoint)),
            None => Err(DcfError::closed(&self.inner.endpoint)),
        }
    }

    /// 同步提交一帧数据到写队列，返回待确认句柄。
    ///
    /// 提交顺序即线上顺序；重绑冲刷依赖这一点在持锁期间按队列顺序提交。
    pub fn submit(&self, envelope: &Envelope) -> Result<PendingAck, DcfError> {
        if !self.state().is_open() {
            return Err(DcfError::closed(&self.inner.endpoint));
        }
        let correlation_id = envelope.correlation_id;
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(correlation_id, tx);
        let frame = Frame::Data {
            correlation_id,
            sender: envelope
                .sender
                .clone()
                .unwrap_or_else(|| self.inner.options.node_id.clone()),
            recipient: envelope.recipient.as_ref().map(ToString::to_string),
            timestamp_ms: envelope.timestamp_ms,
            payload: envelope.payload.clone(),
        };
        if let Err(err) = self.enqueue(frame) {
            self.inner.pending.remove(&correlation_id);
            return Err(err);
        }
        Ok(PendingAck {
            channel: self.clone(),
            correlation_id,
            receiver: rx,
        })
    }

    /// 发送并等待远端确认。
    pub async fn send(&self, envelope: &Envelope) -> Result<AckToken, DcfError> {
        self.submit(envelope)?.wait().await
    }

    /// 发送控制指令，不等待确认。
    pub fn send_control(&self, command: ControlCommand) -> Result<(), DcfError> {
        if !self.state().is_open() {
            return Err(DcfError::closed(&self.inner.endpoint));
        }
        self.enqueue(Frame::Control(command))
    }

    pub fn pending_acks(&self) -> usize {
        self.inner.pending.len()
    }

    fn fail_pending(&self, error: &DcfError) {
        let ids: Vec<u64> = self.inner.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, slot)) = self.inner.pending.remove(&id) {
                let _ = slot.send(Err(error.clone()));
            }
        }
    }

    /// 链路失效：进入 `Disconnected`，通知所有者，然后使挂起确认失败。
    fn mark_lost(&self, error: DcfError) {
        if self.inner.closing.load(Ordering::Acquire) {
            return;
        }
        if !self.transition(ChannelState::Disconnected) {
            return;
        }
        warn!(
            channel = self.inner.id,
            endpoint = %self.inner.endpoint,
            error = %error,
            "channel lost"
        );
        self.inner.queue.lock().take();
        self.inner.observer.on_lost(self, error.clone());
        self.fail_pending(&error);
    }

    /// 有序关闭。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：幂等；在 `drain_timeout` 内尽力冲刷写队列并等待在途确认，随后发送
    ///   `Goodbye`、关闭链路，剩余挂起确认以 [`DcfError::Cancelled`] 失败，状态进入 `Closed`；
    /// - **执行 (How)**：先丢弃写队列发送端，让写任务在排空后自然退出；确认等待以 5ms 轮询。
    pub async fn close(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let deadline = Instant::now() + self.inner.options.drain_timeout;
        let was_open = self.state().is_open();
        self.inner.queue.lock().take();

        let writer = self.inner.writer.lock().take();
        if let Some(mut writer) = writer {
            if was_open {
                if tokio::time::timeout_at(deadline, &mut writer).await.is_err() {
                    writer.abort();
                }
            } else {
                writer.abort();
            }
        }
        if was_open {
            while !self.inner.pending.is_empty() && Instant::now() < deadline {
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
            let goodbye = self.inner.link.send(Frame::Goodbye);
            let _ = tokio::time::timeout(self.inner.options.drain_timeout, goodbye).await;
        }
        let _ = self.inner.link.close().await;

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            task.abort();
        }
        self.fail_pending(&DcfError::cancelled("send"));
        self.transition(ChannelState::Closed);
        info!(
            channel = self.inner.id,
            endpoint = %self.inner.endpoint,
            "channel closed"
        );
    }

    /// 同步中止：不冲刷、不发送 `Goodbye`，用于会话句柄被直接丢弃的场景。
    pub fn abort(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.queue.lock().take();
        if let Some(writer) = self.inner.writer.lock().take() {
            writer.abort();
        }
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            task.abort();
        }
        self.fail_pending(&DcfError::cancelled("send"));
        self.transition(ChannelState::Closed);
    }

    async fn write_loop(self, mut queue: mpsc::UnboundedReceiver<Frame>) {
        while let Some(frame) = queue.recv().await {
            if let Err(err) = self.inner.link.send(frame).await {
                debug!(channel = self.inner.id, error = %err, "channel write failed");
                self.mark_lost(err);
                break;
            }
        }
    }

    async fn read_loop(self) {
        loop {
            let frame = match self.inner.link.recv().await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    self.mark_lost(DcfError::closed(&self.inner.endpoint));
                    break;
                }
                Err(err) => {
                    debug!(channel = self.inner.id, error = %err, "channel read failed");
                    self.mark_lost(err);
                    break;
                }
            };
            match frame {
                Frame::Data {
                    correlation_id,
                    sender,
                    timestamp_ms,
                    payload,
                    ..
                } => {
                    let _ = self.enqueue(Frame::Ack { correlation_id });
                    let envelope =
                        Envelope::inbound(payload, Some(sender), correlation_id, timestamp_ms);
                    self.inner.observer.on_data(&self, envelope);
                }
                Frame::Ack { correlation_id } => {
                    if let Some((_, slot)) = self.inner.pending.remove(&correlation_id) {
                        let _ = slot.send(Ok(()));
                    }
                }
                Frame::Ping { nonce } => {
                    let _ = self.enqueue(Frame::Pong { nonce });
                }
                Frame::Pong { nonce } => {
                    let answered = self
                        .inner
                        .outstanding_ping
                        .compare_exchange(nonce, 0, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok();
                    if !answered {
                        continue;
                    }
                    if let Some(sent) = self.inner.ping_sent.lock().take() {
                        let rtt = sent.elapsed();
                        *self.inner.rtt.lock() = Some(rtt);
                        self.inner.observer.on_rtt(&self, rtt);
                    }
                    if self.transition(ChannelState::Connected) {
                        info!(channel = self.inner.id, "channel liveness restored");
                        self.inner
                            .observer
                            .on_liveness(&self, ChannelState::Connected);
                    }
                }
                Frame::Control(command) => self.inner.observer.on_control(&self, command),
                Frame::Hello { .. } => {
                    debug!(channel = self.inner.id, "duplicate hello ignored");
                }
                Frame::Goodbye => {
                    self.mark_lost(DcfError::closed(&self.inner.endpoint));
                    break;
                }
            }
        }
    }

    async fn liveness_loop(self) {
        let interval = self.inner.options.liveness_interval;
        let threshold = self.inner.options.miss_threshold.max(1);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut missed = 0u32;
        loop {
            ticker.tick().await;
            if !self.state().is_open() {
                break;
            }
            if self.inner.outstanding_ping.load(Ordering::Acquire) != 0 {
                missed += 1;
                if missed >= threshold {
                    self.mark_lost(DcfError::timeout(
                        "liveness",
                        interval.saturating_mul(missed),
                    ));
                    break;
                }
                if self.transition(ChannelState::Degraded) {
                    warn!(
                        channel = self.inner.id,
                        endpoint = %self.inner.endpoint,
                        missed,
                        "channel degraded"
                    );
                    self.inner
                        .observer
                        .on_liveness(&self, ChannelState::Degraded);
                }
            } else {
                missed = 0;
            }
            let nonce = self.inner.next_nonce.fetch_add(1, Ordering::Relaxed);
            *self.inner.ping_sent.lock() = Some(Instant::now());
            self.inner.outstanding_ping.store(nonce, Ordering::Release);
            if self.enqueue(Frame::Ping { nonce }).is_err() {
                break;
            }
        }
    }
}
