#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = "dcf-transport-tcp: `dcf-core` 传输契约的 TCP 实现。"]
#![doc = ""]
#![doc = "== 组成 =="]
#![doc = "1. [`TcpConnector`]：拨号与监听，入口为 [`dcf_core::transport::Connector`]；"]
#![doc = "2. [`TcpLink`]：读写分离的帧链路，帧格式见 [`codec`]；"]
#![doc = "3. [`TcpSocketConfig`]：`TCP_NODELAY` 与 `SO_LINGER`。"]
#![doc = ""]
#![doc = "== 错误 =="]
#![doc = "IO 失败统一映射为 `DcfError::Transport`，错误码形如 `dcf.transport.tcp.connect_failed`。"]

pub mod codec;
mod connector;
pub mod error;
mod link;
mod util;

pub use codec::{CodecError, DEFAULT_MAX_FRAME, FrameCodec};
pub use connector::{TcpAcceptor, TcpConnector};
pub use link::{TcpLink, TcpSocketConfig};
