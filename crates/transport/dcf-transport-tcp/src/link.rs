use std::{net::SocketAddr, time::Duration};

use async_trait::async_trait;
use bytes::BytesMut;
use dcf_core::{DcfError, frame::Frame, transport::Link};
use socket2::SockRef;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex as AsyncMutex,
};
use tracing::debug;

use crate::{
    codec::FrameCodec,
    error::{self, map_codec_error, map_io_error},
    util::run_io,
};

const READ_CHUNK: usize = 8 * 1024;

/// TCP 套接字级配置项。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把 `TCP_NODELAY` 与 `SO_LINGER` 显式配置化，避免调用方直接操作 `socket2`；
/// - 拨号与接受两侧使用同一结构，保证两端关闭行为一致。
///
/// ## 契约（What）
/// - `nodelay` 默认开启；
/// - `linger = Some(dur)` 时 `close`/`drop` 在 `dur` 后未完成即发送 RST，`None` 沿用内核默认；
/// - **后置条件**：`apply` 返回 `Ok(())` 时两项选项均已落地。
///
/// ## 注意事项（Trade-offs）
/// - `SO_LINGER` 在 Linux 上取整到秒，测试中应使用 `None` 或整秒值。
#[derive(Clone, Debug)]
pub struct TcpSocketConfig {
    nodelay: bool,
    linger: Option<Duration>,
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpSocketConfig {
    pub const fn new() -> Self {
        Self {
            nodelay: true,
            linger: None,
        }
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    pub fn nodelay(&self) -> bool {
        self.nodelay
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger
    }

    pub(crate) fn apply(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        SockRef::from(stream).set_linger(self.linger)
    }
}

#[derive(Debug)]
struct ReadState {
    half: OwnedReadHalf,
    buffer: BytesMut,
}

#[derive(Debug)]
struct WriteState {
    half: OwnedWriteHalf,
    buffer: BytesMut,
    shut: bool,
}

/// 一条 TCP 帧链路。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把字节流包装成 [`Link`]：核心只看到 [`Frame`]，长度前缀与标签由 [`FrameCodec`] 处理；
///
/// ## 逻辑 (How)
/// - 套接字拆成独立的读写两半，各自由 `tokio::sync::Mutex` 保护，读任务阻塞在 `recv`
///   时写任务仍可发送；
/// - 读缓冲在多次 `recv` 之间保留，一次读入的多帧会被逐帧取出；
///
/// ## 契约 (What)
/// - `recv` 在对端干净关闭（缓冲为空时读到 EOF）时返回 `Ok(None)`；帧中途断开是
///   `dcf.transport.tcp.frame_invalid`；
/// - `close` 半关闭写方向，对端随后读到 EOF；重复调用无副作用。
#[derive(Debug)]
pub struct TcpLink {
    reader: AsyncMutex<ReadState>,
    writer: AsyncMutex<WriteState>,
    codec: FrameCodec,
    label: String,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    config: TcpSocketConfig,
}

impl TcpLink {
    /// 以已建立的流构造链路。`label` 为对端的可读标识（拨号端使用目标端点）。
    pub(crate) fn from_stream(
        stream: TcpStream,
        label: String,
        codec: FrameCodec,
        config: TcpSocketConfig,
    ) -> Result<Self, DcfError> {
        config
            .apply(&stream)
            .map_err(|err| map_io_error(error::CONFIGURE, &label, err))?;
        let peer_addr = stream
            .peer_addr()
            .map_err(|err| map_io_error(error::CONFIGURE, &label, err))?;
        let local_addr = stream
            .local_addr()
            .map_err(|err| map_io_error(error::CONFIGURE, &label, err))?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: AsyncMutex::new(ReadState {
                half: read,
                buffer: BytesMut::with_capacity(READ_CHUNK),
            }),
            writer: AsyncMutex::new(WriteState {
                half: write,
                buffer: BytesMut::with_capacity(READ_CHUNK),
                shut: false,
            }),
            codec,
            label,
            peer_addr,
            local_addr,
            config,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn socket_config(&self) -> &TcpSocketConfig {
        &self.config
    }
}

#[async_trait]
impl Link for TcpLink {
    async fn send(&self, frame: Frame) -> Result<(), DcfError> {
        let mut guard = self.writer.lock().await;
        let state = &mut *guard;
        if state.shut {
            return Err(DcfError::closed(&self.label));
        }
        state.buffer.clear();
        self.codec
            .encode(&frame, &mut state.buffer)
            .map_err(|err| map_codec_error(&self.label, err))?;
        run_io(
            error::WRITE,
            &self.label,
            None,
            state.half.write_all(&state.buffer),
        )
        .await
    }

    async fn recv(&self) -> Result<Option<Frame>, DcfError> {
        let mut guard = self.reader.lock().await;
        let state = &mut *guard;
        loop {
            if let Some(frame) = self
                .codec
                .decode(&mut state.buffer)
                .map_err(|err| map_codec_error(&self.label, err))?
            {
                return Ok(Some(frame));
            }
            state.buffer.reserve(READ_CHUNK);
            let read = run_io(
                error::READ,
                &self.label,
                None,
                state.half.read_buf(&mut state.buffer),
            )
            .await?;
            if read == 0 {
                if state.buffer.is_empty() {
                    return Ok(None);
                }
                debug!(peer = %self.label, pending = state.buffer.len(), "eof inside a frame");
                return Err(DcfError::transport(
                    error::FRAME_INVALID,
                    &self.label,
                    "connection closed inside a frame",
                    true,
                ));
            }
        }
    }

    async fn close(&self) -> Result<(), DcfError> {
        let mut guard = self.writer.lock().await;
        if guard.shut {
            return Ok(());
        }
        guard.shut = true;
        match guard.half.shutdown().await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(map_io_error(error::SHUTDOWN, &self.label, err)),
        }
    }

    fn remote_label(&self) -> String {
        self.label.clone()
    }
}
