/// 自定义错误类型
///
/// 使用 thiserror 定义精确的错误类型，替代泛型的 anyhow::Error
/// 对应隧道各层的错误分类：传输通道、内联协议、控制面 API、本地连接、会话状态
use std::io;
use thiserror::Error;

/// 服务端上报的错误级别
///
/// 随传输层错误一起下发，决定会话关闭后是否允许重试。
/// 认证类与超时类为致命错误，其余级别按未知处理（记录日志后可重试）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorLevel {
    /// 客户端认证失败
    ClientAuthentication,
    /// 连接超时
    Timeout,
    /// 其他级别（保留原始字符串）
    Other(String),
}

impl ErrorLevel {
    /// 从线上字符串解析
    pub fn parse(s: &str) -> Self {
        match s {
            "client-authentication" => ErrorLevel::ClientAuthentication,
            "timeout" | "connection-timeout" => ErrorLevel::Timeout,
            other => ErrorLevel::Other(other.to_string()),
        }
    }

    /// 致命级别不进入重试路径
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorLevel::ClientAuthentication | ErrorLevel::Timeout)
    }

    pub fn as_str(&self) -> &str {
        match self {
            ErrorLevel::ClientAuthentication => "client-authentication",
            ErrorLevel::Timeout => "timeout",
            ErrorLevel::Other(s) => s,
        }
    }
}

impl std::fmt::Display for ErrorLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 本地连接失败的分类
///
/// 映射到错误页标题；未覆盖的错误码一律归入 Unknown 而不是报错
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalErrorKind {
    /// 连接被拒绝（端口未监听）
    Refused,
    /// 地址无法解析或不可达
    NotFound,
    /// 连接超时（可能被防火墙拦截）
    TimedOut,
    /// 其他错误
    Unknown,
}

impl LocalErrorKind {
    /// 错误页标题
    pub fn title(&self) -> &'static str {
        match self {
            LocalErrorKind::Refused => "Connection refused",
            LocalErrorKind::NotFound => "Address not found",
            LocalErrorKind::TimedOut => "Connection timeout",
            LocalErrorKind::Unknown => "Unknown error",
        }
    }
}

/// 隧道的主要错误类型
#[derive(Error, Debug)]
pub enum TunnelError {
    /// 传输通道错误（连接、握手、多路复用失败）
    #[error("Transport error: {message}")]
    Transport {
        level: Option<ErrorLevel>,
        message: String,
    },

    /// 内联协议错误（请求前导格式损坏等）
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// 控制面 API 错误
    #[error("Control plane error: {message}")]
    ControlPlane {
        status: Option<u16>,
        message: String,
    },

    /// 本地服务连接错误
    #[error("Local connect error ({}): {message}", .kind.title())]
    LocalConnect {
        kind: LocalErrorKind,
        message: String,
    },

    /// 会话状态错误（当前状态下不允许的操作）
    #[error("Invalid session state: {0}")]
    SessionState(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// 创建不带级别的传输错误
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            level: None,
            message: msg.into(),
        }
    }

    /// 创建带服务端级别的传输错误
    pub fn transport_with_level(level: ErrorLevel, msg: impl Into<String>) -> Self {
        Self::Transport {
            level: Some(level),
            message: msg.into(),
        }
    }

    /// 创建协议错误
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// 创建控制面错误
    pub fn control_plane(status: Option<u16>, msg: impl Into<String>) -> Self {
        Self::ControlPlane {
            status,
            message: msg.into(),
        }
    }

    /// 创建本地连接错误
    pub fn local_connect(kind: LocalErrorKind, msg: impl Into<String>) -> Self {
        Self::LocalConnect {
            kind,
            message: msg.into(),
        }
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// 取出服务端上报的错误级别（仅传输错误携带）
    pub fn level(&self) -> Option<&ErrorLevel> {
        match self {
            Self::Transport { level, .. } => level.as_ref(),
            _ => None,
        }
    }

    /// 取出本地连接错误的分类
    pub fn local_kind(&self) -> Option<LocalErrorKind> {
        match self {
            Self::LocalConnect { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// 检查是否为致命（不可重试）错误
    pub fn is_fatal(&self) -> bool {
        self.level().is_some_and(ErrorLevel::is_fatal)
    }
}

impl From<reqwest::Error> for TunnelError {
    fn from(err: reqwest::Error) -> Self {
        Self::ControlPlane {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_level_parse() {
        assert_eq!(
            ErrorLevel::parse("client-authentication"),
            ErrorLevel::ClientAuthentication
        );
        assert_eq!(ErrorLevel::parse("timeout"), ErrorLevel::Timeout);
        assert_eq!(ErrorLevel::parse("connection-timeout"), ErrorLevel::Timeout);
        assert_eq!(
            ErrorLevel::parse("billing"),
            ErrorLevel::Other("billing".to_string())
        );
    }

    #[test]
    fn test_fatal_levels() {
        assert!(ErrorLevel::ClientAuthentication.is_fatal());
        assert!(ErrorLevel::Timeout.is_fatal());
        assert!(!ErrorLevel::Other("billing".to_string()).is_fatal());
    }

    #[test]
    fn test_transport_error_level() {
        let err =
            TunnelError::transport_with_level(ErrorLevel::ClientAuthentication, "key rejected");
        assert!(err.is_fatal());
        assert_eq!(err.level(), Some(&ErrorLevel::ClientAuthentication));
        assert_eq!(err.to_string(), "Transport error: key rejected");

        let plain = TunnelError::transport("connection refused");
        assert!(!plain.is_fatal());
        assert!(plain.level().is_none());
    }

    #[test]
    fn test_local_error_titles() {
        assert_eq!(LocalErrorKind::Refused.title(), "Connection refused");
        assert_eq!(LocalErrorKind::NotFound.title(), "Address not found");
        assert_eq!(LocalErrorKind::TimedOut.title(), "Connection timeout");
        assert_eq!(LocalErrorKind::Unknown.title(), "Unknown error");
    }

    #[test]
    fn test_local_connect_display() {
        let err = TunnelError::local_connect(LocalErrorKind::Refused, "127.0.0.1:9999");
        assert!(err.to_string().contains("Connection refused"));
        assert_eq!(err.local_kind(), Some(LocalErrorKind::Refused));
    }
}
