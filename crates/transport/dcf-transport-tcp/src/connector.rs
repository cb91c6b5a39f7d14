use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use dcf_core::{
    DcfError, EndpointId,
    transport::{Acceptor, Connector, Link},
};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::{
    codec::{DEFAULT_MAX_FRAME, FrameCodec},
    error,
    link::{TcpLink, TcpSocketConfig},
    util::run_io,
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// 基于 `tokio::net` 的 [`Connector`] 实现。
///
/// # 教案式注释
///
/// ## 契约 (What)
/// - `dial`：在 `connect_timeout` 内建立连接并应用 [`TcpSocketConfig`]，链路标识为目标端点；
/// - `listen`：绑定 `host:port`，端口 0 时由内核分配，[`Acceptor::local_endpoint`]
///   返回请求的主机与实际端口；
/// - 同一连接器的全部链路共享一个帧长度上限。
///
/// ## 注意事项 (Trade-offs)
/// - 主机名解析交给 `tokio::net`，解析失败同样归入 `dcf.transport.tcp.connect_failed`。
#[derive(Clone, Debug)]
pub struct TcpConnector {
    socket: TcpSocketConfig,
    connect_timeout: Duration,
    codec: FrameCodec,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpConnector {
    pub fn new() -> Self {
        Self {
            socket: TcpSocketConfig::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            codec: FrameCodec::new(DEFAULT_MAX_FRAME),
        }
    }

    pub fn with_socket_config(mut self, socket: TcpSocketConfig) -> Self {
        self.socket = socket;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_frame_size(mut self, max_frame: usize) -> Self {
        self.codec = FrameCodec::new(max_frame);
        self
    }

    pub fn socket_config(&self) -> &TcpSocketConfig {
        &self.socket
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn max_frame_size(&self) -> usize {
        self.codec.max_frame()
    }

    /// 以共享指针形式交给 `SessionBuilder::connector`。
    pub fn shared(self) -> Arc<dyn Connector> {
        Arc::new(self)
    }

    /// 拨号并返回具体类型的链路，便于需要套接字地址的调用方。
    pub async fn connect(&self, endpoint: &EndpointId) -> Result<TcpLink, DcfError> {
        let stream = run_io(
            error::CONNECT,
            endpoint,
            Some(self.connect_timeout),
            TcpStream::connect((endpoint.host(), endpoint.port())),
        )
        .await?;
        let link = TcpLink::from_stream(
            stream,
            endpoint.to_string(),
            self.codec,
            self.socket.clone(),
        )?;
        debug!(endpoint = %endpoint, local = %link.local_addr(), "tcp link dialed");
        Ok(link)
    }

    /// 绑定并返回具体类型的监听端。
    pub async fn bind(&self, endpoint: &EndpointId) -> Result<TcpAcceptor, DcfError> {
        let listener = run_io(
            error::BIND,
            endpoint,
            None,
            TcpListener::bind((endpoint.host(), endpoint.port())),
        )
        .await?;
        let bound = listener
            .local_addr()
            .map_err(|err| error::map_io_error(error::BIND, endpoint, err))?;
        let local = endpoint.with_port(bound.port());
        info!(endpoint = %local, "tcp listener bound");
        Ok(TcpAcceptor {
            listener,
            local,
            socket: self.socket.clone(),
            codec: self.codec,
        })
    }
}

#[async_trait]
impl Connector for TcpConnector {
    fn scheme(&self) -> &'static str {
        "tcp"
    }

    async fn dial(&self, endpoint: &EndpointId) -> Result<Arc<dyn Link>, DcfError> {
        let link = self.connect(endpoint).await?;
        Ok(Arc::new(link))
    }

    async fn listen(&self, endpoint: &EndpointId) -> Result<Box<dyn Acceptor>, DcfError> {
        let acceptor = self.bind(endpoint).await?;
        Ok(Box::new(acceptor))
    }
}

/// TCP 监听端。丢弃即释放端口。
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
    local: EndpointId,
    socket: TcpSocketConfig,
    codec: FrameCodec,
}

impl TcpAcceptor {
    /// 接受一个入站连接；链路标识为对端的 `ip:port`。
    pub async fn accept_link(&self) -> Result<TcpLink, DcfError> {
        let (stream, peer) = run_io(error::ACCEPT, &self.local, None, self.listener.accept()).await?;
        debug!(local = %self.local, peer = %peer, "tcp link accepted");
        TcpLink::from_stream(stream, peer.to_string(), self.codec, self.socket.clone())
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&self) -> Result<Arc<dyn Link>, DcfError> {
        let link = self.accept_link().await?;
        Ok(Arc::new(link))
    }

    fn local_endpoint(&self) -> EndpointId {
        self.local.clone()
    }
}
