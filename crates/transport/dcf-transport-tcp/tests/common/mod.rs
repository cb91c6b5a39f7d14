//! TCP 场景测试共用的节点搭建与等待工具。

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use dcf_core::{
    DcfConfig, EndpointId, Envelope, Mode, Session, SessionEvent, config::EndpointEntry,
};
use dcf_transport_tcp::TcpConnector;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};

pub const WAIT: Duration = Duration::from_secs(10);
pub const LOOPBACK: &str = "127.0.0.1";

pub fn config(mode: Mode, port: u16) -> DcfConfig {
    let mut config = DcfConfig::new(mode);
    config.host = LOOPBACK.to_owned();
    config.port = port;
    config.liveness.interval_ms = 50;
    config.liveness.miss_threshold = 3;
    config.timeouts.connect_ms = 500;
    config.timeouts.send_ms = 2000;
    config.timeouts.probe_ms = 500;
    config.timeouts.handshake_ms = 500;
    config.timeouts.drain_ms = 50;
    config.redundancy.retry_rounds = 1;
    config.redundancy.retry_backoff_ms = 20;
    config
}

pub fn master_config(masters: &[EndpointId]) -> DcfConfig {
    let mut config = config(Mode::Master, 0);
    config.masters = masters.iter().cloned().map(EndpointEntry::Address).collect();
    config
}

pub fn build(config: DcfConfig) -> Session {
    Session::builder(config)
        .connector(
            TcpConnector::new()
                .with_connect_timeout(Duration::from_millis(500))
                .shared(),
        )
        .build()
        .expect("session builds")
}

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

    pub fn len(&self) -> usize {
        self.received.lock().len()
    }
}

/// 在内核分配的端口上启动一个 Server 节点，返回会话、收件箱与实际监听端点。
pub async fn server() -> (Session, Inbox, EndpointId) {
    let session = build(config(Mode::Server, 0));
    let inbox = Inbox::default();
    inbox.attach(&session);
    session.start().await.expect("server starts");
    let local = session.local_endpoint().expect("server is listening");
    (session, inbox, local)
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
