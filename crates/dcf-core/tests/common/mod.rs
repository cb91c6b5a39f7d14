//! 集成测试共用的节点搭建与等待工具。
//!
//! 所有节点运行在同一个 [`MemoryNetwork`] 上，时间参数压缩到毫秒级，使故障转移与重试在
//! 测试时限内完成。

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use dcf_core::{
    DcfConfig, EndpointId, Envelope, Mode, Session, SessionEvent, TopologyState,
    config::EndpointEntry, transport::memory::MemoryNetwork,
};
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn ep(host: &str, port: u16) -> EndpointId {
    EndpointId::new(host, port)
}

/// 压缩后的时间参数：20ms 存活间隔、10ms 退避、两轮重试。
pub fn fast(mut config: DcfConfig) -> DcfConfig {
    config.liveness.interval_ms = 20;
    config.liveness.miss_threshold = 3;
    config.timeouts.connect_ms = 200;
    config.timeouts.send_ms = 1000;
    config.timeouts.probe_ms = 100;
    config.timeouts.handshake_ms = 200;
    config.timeouts.drain_ms = 20;
    config.redundancy.retry_rounds = 2;
    config.redundancy.retry_backoff_ms = 10;
    config
}

pub fn config(mode: Mode, host: &str, port: u16) -> DcfConfig {
    let mut config = fast(DcfConfig::new(mode));
    config.host = host.to_owned();
    config.port = port;
    config
}

pub fn entries(endpoints: &[EndpointId]) -> Vec<EndpointEntry> {
    endpoints.iter().cloned().map(EndpointEntry::Address).collect()
}

pub fn master_config(host: &str, masters: &[EndpointId]) -> DcfConfig {
    let mut config = config(Mode::Master, host, 0);
    config.masters = entries(masters);
    config
}

pub fn p2p_config(host: &str, peers: &[EndpointId]) -> DcfConfig {
    let mut config = config(Mode::P2P, host, 0);
    config.peers = entries(peers);
    config
}

pub fn build(network: &MemoryNetwork, config: DcfConfig) -> Session {
    Session::builder(config)
        .connector(network.connector())
        .build()
        .expect("session builds")
}

/// 收集入站载荷的回调。
#[derive(Clone, Default)]
pub struct Inbox {
    received: Arc<Mutex<Vec<Envelope>>>,
}

impl Inbox {
    pub fn attach(&self, session: &Session) {
        let received = self.received.clone();
        session.register_handler(move |envelope| received.lock().push(envelope));
    }

    pub fn payloads(&self) -> Vec<Bytes> {
        self.received
            .lock()
            .iter()
            .map(|envelope| envelope.payload.clone())
            .collect()
    }

    pub fn envelopes(&self) -> Vec<Envelope> {
        self.received.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.received.lock().len()
    }
}

/// 启动一个 Server 节点作为远端，返回会话与其收件箱。
pub async fn server(network: &MemoryNetwork, host: &str, port: u16) -> (Session, Inbox) {
    let session = build(network, config(Mode::Server, host, port));
    let inbox = Inbox::default();
    inbox.attach(&session);
    session.start().await.expect("server starts");
    (session, inbox)
}

pub async fn wait_state(session: &Session, predicate: impl Fn(&TopologyState) -> bool) {
    let mut watch = session.watch_state();
    tokio::time::timeout(WAIT, watch.wait_for(|state| predicate(state)))
        .await
        .expect("state reached in time")
        .expect("state watch open");
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

pub async fn wait_event(
    events: &mut broadcast::Receiver<SessionEvent>,
    mut predicate: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("event observed in time")
}
