//! # transport 模块说明
//!
//! ## 角色定位（Why）
//! - 定义核心对 RPC/流式传输层的全部要求：拨号、流式收发、监听以及基于 Ping/Pong 的存活探测；
//! - 核心只交换 [`Frame`]，线格式由具体实现决定（见 `dcf-transport-tcp`）。
//!
//! ## 契约（What）
//! - [`Connector`]：按端点拨号得到 [`Link`]，或在端点上监听得到 [`Acceptor`]；
//! - [`Link`]：所有方法取 `&self`，读写可在不同任务中并发执行；`recv` 返回 `Ok(None)` 表示有序关闭；
//! - [`probe`]：一次性探测，返回往返时延。
//!
//! ## 内置实现
//! - [`memory::MemoryNetwork`]：进程内传输，支持切断与静默端点，用于多节点场景与测试。

pub mod memory;

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;

use crate::{
    endpoint::EndpointId,
    error::{DcfError, codes},
    frame::Frame,
};

/// 一条已建立的双向帧链路。
#[async_trait]
pub trait Link: Send + Sync + 'static {
    async fn send(&self, frame: Frame) -> Result<(), DcfError>;

    /// 读取下一帧；`Ok(None)` 表示对端有序关闭。
    async fn recv(&self) -> Result<Option<Frame>, DcfError>;

    async fn close(&self) -> Result<(), DcfError>;

    /// 对端的可读标识，TCP 实现返回 `ip:port`。
    fn remote_label(&self) -> String;
}

/// 被动监听端。
#[async_trait]
pub trait Acceptor: Send + Sync + 'static {
    async fn accept(&self) -> Result<Arc<dyn Link>, DcfError>;

    /// 实际绑定的端点；请求端口为 0 时返回分配后的端口。
    fn local_endpoint(&self) -> EndpointId;
}

/// 传输实现入口。
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    fn scheme(&self) -> &'static str;

    async fn dial(&self, endpoint: &EndpointId) -> Result<Arc<dyn Link>, DcfError>;

    async fn listen(&self, endpoint: &EndpointId) -> Result<Box<dyn Acceptor>, DcfError>;
}

static PROBE_NONCE: AtomicU64 = AtomicU64::new(1);

/// 存活探测原语。
///
/// # 教案式说明
/// - **契约 (What)**：拨号、发送 `Hello` 与一次 `Ping`，等待匹配的 `Pong` 后发送 `Goodbye` 并关闭；
///   返回从发出 `Ping` 到收到 `Pong` 的时延；
/// - **执行 (How)**：整个过程受 `timeout` 约束，期间收到的其他帧被忽略；
/// - **风险 (Trade-offs)**：被探测方会短暂看到一条新通道，随即因 `Goodbye` 关闭。
pub async fn probe(
    connector: &dyn Connector,
    endpoint: &EndpointId,
    node_id: &str,
    timeout: Duration,
) -> Result<Duration, DcfError> {
    let attempt = async {
        let link = connector.dial(endpoint).await?;
        link.send(Frame::Hello {
            node_id: node_id.to_owned(),
            advertise: None,
        })
        .await?;
        let nonce = PROBE_NONCE.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        link.send(Frame::Ping { nonce }).await?;
        let rtt = loop {
            match link.recv().await? {
                Some(Frame::Pong { nonce: echoed }) if echoed == nonce => break started.elapsed(),
                Some(_) => continue,
                None => {
                    return Err(DcfError::transport(
                        codes::TRANSPORT_CLOSED,
                        endpoint,
                        "closed before answering probe",
                        true,
                    ));
                }
            }
        };
        let _ = link.send(Frame::Goodbye).await;
        let _ = link.close().await;
        Ok(rtt)
    };
    match tokio::time::timeout(timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(DcfError::timeout("probe", timeout)),
    }
}
