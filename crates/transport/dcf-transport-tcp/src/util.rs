use core::fmt;
use std::{future::Future, io, time::Duration};

use dcf_core::DcfError;

use crate::error::{OperationKind, map_io_error};

/// 执行一次 IO Future，可选地受 `timeout` 约束，并把 IO 错误映射为带稳定错误码的传输错误。
///
/// # 教案式说明
/// - **契约 (What)**：超时返回 [`DcfError::Timeout`]，`operation` 取自 `kind.message`；
///   IO 失败返回 [`DcfError::Transport`]，`endpoint` 用于定位；
/// - **风险 (Trade-offs)**：超时后被丢弃的 Future 会同时释放半建立的套接字。
pub(crate) async fn run_io<F, T>(
    kind: OperationKind,
    endpoint: impl fmt::Display,
    timeout: Option<Duration>,
    future: F,
) -> Result<T, DcfError>
where
    F: Future<Output = io::Result<T>>,
{
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, future).await {
            Ok(result) => result,
            Err(_) => return Err(DcfError::timeout(kind.message, limit)),
        },
        None => future.await,
    };
    result.map_err(|err| map_io_error(kind, endpoint, err))
}
