use core::fmt;
use std::io;

use dcf_core::DcfError;

use crate::codec::CodecError;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: "dcf.transport.tcp.bind_failed",
    message: "tcp bind",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "dcf.transport.tcp.accept_failed",
    message: "tcp accept",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "dcf.transport.tcp.connect_failed",
    message: "tcp connect",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "dcf.transport.tcp.read_failed",
    message: "tcp read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "dcf.transport.tcp.write_failed",
    message: "tcp write",
};
pub(crate) const SHUTDOWN: OperationKind = OperationKind {
    code: "dcf.transport.tcp.shutdown_failed",
    message: "tcp shutdown",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "dcf.transport.tcp.configure_failed",
    message: "tcp configure",
};

/// 帧格式错误的稳定错误码。
pub const FRAME_INVALID: &str = "dcf.transport.tcp.frame_invalid";
/// 帧长度超过上限的稳定错误码。
pub const FRAME_TOO_LARGE: &str = "dcf.transport.tcp.frame_too_large";

/// 将 IO 错误映射为 [`DcfError::Transport`]，并按 IO 类别给出是否可重试。
pub(crate) fn map_io_error(
    kind: OperationKind,
    endpoint: impl fmt::Display,
    error: io::Error,
) -> DcfError {
    let retryable = is_retryable(&error);
    DcfError::transport(
        kind.code,
        endpoint,
        format!("{}: {}", kind.message, error),
        retryable,
    )
}

/// 将编解码错误映射为不可重试的传输错误。
pub(crate) fn map_codec_error(endpoint: impl fmt::Display, error: CodecError) -> DcfError {
    let code = match error {
        CodecError::Oversize { .. } => FRAME_TOO_LARGE,
        _ => FRAME_INVALID,
    };
    DcfError::transport(code, endpoint, error.to_string(), false)
}

fn is_retryable(error: &io::Error) -> bool {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::TimedOut
        | ErrorKind::WouldBlock
        | ErrorKind::Interrupted
        | ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::AddrInUse
        | ErrorKind::AddrNotAvailable
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof
        | ErrorKind::WriteZero => true,
        ErrorKind::PermissionDenied | ErrorKind::Unsupported => false,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_connect_is_retryable_connectivity() {
        let err = map_io_error(
            CONNECT,
            "127.0.0.1:1",
            io::Error::from(io::ErrorKind::ConnectionRefused),
        );
        assert_eq!(err.code(), "dcf.transport.tcp.connect_failed");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("tcp connect"));
    }

    #[test]
    fn permission_denied_is_not_retryable() {
        let err = map_io_error(
            BIND,
            "0.0.0.0:80",
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        match err {
            DcfError::Transport {
                code, retryable, ..
            } => {
                assert_eq!(code, "dcf.transport.tcp.bind_failed");
                assert!(!retryable);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn oversize_frames_get_their_own_code() {
        let err = map_codec_error("peer", CodecError::Oversize { len: 10, max: 4 });
        assert_eq!(err.code(), FRAME_TOO_LARGE);
        let err = map_codec_error("peer", CodecError::UnknownTag(99));
        assert_eq!(err.code(), FRAME_INVALID);
    }
}
