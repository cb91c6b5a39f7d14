//! 进程内传输。
//!
//! # 教案式说明
//! - **意图 (Why)**：在同一进程内运行多个会话节点，并以确定的方式制造不可达与丢包，
//!   用于验证故障转移、存活探测与排队语义；
//! - **契约 (What)**：
//!   - 端点在 `listen` 后才可被拨号，监听端被丢弃后自动注销；
//!   - [`MemoryNetwork::set_reachable`] 置为 `false` 时拒绝新拨号，并切断所有连到该端点的链路；
//!   - [`MemoryNetwork::set_muted`] 置为 `true` 时，发往该端点的帧被静默丢弃；
//!   - 监听端口 0 时分配一个合成的临时端口；
//! - **执行 (How)**：每条链路是一对无界 `mpsc` 队列，双方共享目标端点的 `watch<bool>`
//!   可达标志，`recv` 通过 `select!` 同时等待数据与切断信号。

use std::sync::{
    Arc, Weak,
    atomic::{AtomicU16, AtomicU64, Ordering},
};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};

use super::{Acceptor, Connector, Link};
use crate::{
    endpoint::EndpointId,
    error::{DcfError, codes},
    frame::Frame,
};

const FIRST_EPHEMERAL_PORT: u16 = 40_000;

#[derive(Debug)]
struct NetworkInner {
    listeners: DashMap<EndpointId, mpsc::UnboundedSender<Arc<MemoryLink>>>,
    reachability: DashMap<EndpointId, watch::Sender<bool>>,
    muted: DashMap<EndpointId, bool>,
    next_port: AtomicU16,
    next_dialer: AtomicU64,
}

impl NetworkInner {
    fn reachability(&self, endpoint: &EndpointId) -> watch::Receiver<bool> {
        self.reachability
            .entry(endpoint.clone())
            .or_insert_with(|| watch::channel(true).0)
            .subscribe()
    }

    fn is_reachable(&self, endpoint: &EndpointId) -> bool {
        self.reachability
            .get(endpoint)
            .is_none_or(|sender| *sender.borrow())
    }

    fn is_muted(&self, endpoint: &EndpointId) -> bool {
        self.muted.get(endpoint).is_some_and(|muted| *muted)
    }

    fn ephemeral_port(&self, host: &str) -> u16 {
        loop {
            let port = self.next_port.fetch_add(1, Ordering::Relaxed);
            if port == 0 {
                continue;
            }
            if !self.listeners.contains_key(&EndpointId::new(host, port)) {
                return port;
            }
        }
    }
}

/// 进程内网络。克隆共享同一张端点表。
#[derive(Clone, Debug)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                listeners: DashMap::new(),
                reachability: DashMap::new(),
                muted: DashMap::new(),
                next_port: AtomicU16::new(FIRST_EPHEMERAL_PORT),
                next_dialer: AtomicU64::new(1),
            }),
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector {
            network: self.inner.clone(),
        })
    }

    /// 切换端点可达性；置为不可达会立即切断所有连到该端点的链路。
    pub fn set_reachable(&self, endpoint: &EndpointId, reachable: bool) {
        self.inner
            .reachability
            .entry(endpoint.clone())
            .or_insert_with(|| watch::channel(true).0)
            .send_replace(reachable);
        tracing::debug!(endpoint = %endpoint, reachable, "memory endpoint reachability changed");
    }

    pub fn set_muted(&self, endpoint: &EndpointId, muted: bool) {
        self.inner.muted.insert(endpoint.clone(), muted);
    }

    pub fn is_listening(&self, endpoint: &EndpointId) -> bool {
        self.inner.listeners.contains_key(endpoint)
    }
}

#[derive(Debug)]
struct MemoryConnector {
    network: Arc<NetworkInner>,
}

#[async_trait]
impl Connector for MemoryConnector {
    fn scheme(&self) -> &'static str {
        "memory"
    }

    async fn dial(&self, endpoint: &EndpointId) -> Result<Arc<dyn Link>, DcfError> {
        let refused = || {
            DcfError::transport(
                codes::TRANSPORT_REFUSED,
                endpoint,
                "connection refused",
                true,
            )
        };
        if !self.network.is_reachable(endpoint) {
            return Err(refused());
        }
        let accept_queue = self
            .network
            .listeners
            .get(endpoint)
            .map(|entry| entry.value().clone())
            .ok_or_else(refused)?;

        let dialer = format!(
            "memory-dialer-{}",
            self.network.next_dialer.fetch_add(1, Ordering::Relaxed)
        );
        let reachable = self.network.reachability(endpoint);
        let (to_listener, from_dialer) = mpsc::unbounded_channel();
        let (to_dialer, from_listener) = mpsc::unbounded_channel();

        let dialer_end = Arc::new(MemoryLink {
            network: self.network.clone(),
            label: endpoint.to_string(),
            target: Some(endpoint.clone()),
            tx: Mutex::new(Some(to_listener)),
            rx: AsyncMutex::new(from_listener),
            reachable: reachable.clone(),
        });
        let listener_end = Arc::new(MemoryLink {
            network: self.network.clone(),
            label: dialer,
            target: None,
            tx: Mutex::new(Some(to_dialer)),
            rx: AsyncMutex::new(from_dialer),
            reachable,
        });
        accept_queue.send(listener_end).map_err(|_| refused())?;
        Ok(dialer_end)
    }

    async fn listen(&self, endpoint: &EndpointId) -> Result<Box<dyn Acceptor>, DcfError> {
        let bound = if endpoint.port() == 0 {
            endpoint.with_port(self.network.ephemeral_port(endpoint.host()))
        } else {
            endpoint.clone()
        };
        let (sender, receiver) = mpsc::unbounded_channel();
        match self.network.listeners.entry(bound.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(DcfError::transport(
                    codes::TRANSPORT_REFUSED,
                    &bound,
                    "address already in use",
                    false,
                ));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(sender);
            }
        }
        Ok(Box::new(MemoryAcceptor {
            network: Arc::downgrade(&self.network),
            endpoint: bound,
            queue: AsyncMutex::new(receiver),
        }))
    }
}

#[derive(Debug)]
struct MemoryAcceptor {
    network: Weak<NetworkInner>,
    endpoint: EndpointId,
    queue: AsyncMutex<mpsc::UnboundedReceiver<Arc<MemoryLink>>>,
}

#[async_trait]
impl Acceptor for MemoryAcceptor {
    async fn accept(&self) -> Result<Arc<dyn Link>, DcfError> {
        let mut queue = self.queue.lock().await;
        match queue.recv().await {
            Some(link) => Ok(link),
            None => Err(DcfError::closed(&self.endpoint)),
        }
    }

    fn local_endpoint(&self) -> EndpointId {
        self.endpoint.clone()
    }
}

impl Drop for MemoryAcceptor {
    fn drop(&mut self) {
        if let Some(network) = self.network.upgrade() {
            network.listeners.remove(&self.endpoint);
        }
    }
}

#[derive(Debug)]
struct MemoryLink {
    network: Arc<NetworkInner>,
    label: String,
    /// 拨号端指向的监听端点，静默判断以它为准。
    target: Option<EndpointId>,
    tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<Frame>>,
    reachable: watch::Receiver<bool>,
}

impl MemoryLink {
    fn severed(&self) -> DcfError {
        DcfError::closed(&self.label)
    }
}

#[async_trait]
impl Link for MemoryLink {
    async fn send(&self, frame: Frame) -> Result<(), DcfError> {
        let up = *self.reachable.borrow();
        if !up {
            return Err(self.severed());
        }
        if let Some(target) = &self.target
            && self.network.is_muted(target)
        {
            return Ok(());
        }
        let guard = self.tx.lock();
        match guard.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| self.severed()),
            None => Err(self.severed()),
        }
    }

    async fn recv(&self) -> Result<Option<Frame>, DcfError> {
        let mut reachable = self.reachable.clone();
        let up = *reachable.borrow_and_update();
        if !up {
            return Err(self.severed());
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            frame = rx.recv() => Ok(frame),
            _ = reachable.wait_for(|up| !*up) => Err(self.severed()),
        }
    }

    async fn close(&self) -> Result<(), DcfError> {
        self.tx.lock().take();
        Ok(())
    }

    fn remote_label(&self) -> String {
        self.label.clone()
    }
}
