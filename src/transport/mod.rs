mod connection;
mod tls;
mod wss;

pub use connection::{Connection, ConnectionCtl, RequestStream, TransportEvent};
pub use tls::TlsChannel;
pub use wss::WssChannel;

use crate::descriptor::ConnectionDescriptor;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// 传输层类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// TCP + TLS，远端口转发式（显式绑定握手）
    #[default]
    Tls,
    /// WebSocket Secure，持久套接字式（隐式绑定）
    Wss,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Tls => write!(f, "tls"),
            TransportKind::Wss => write!(f, "wss"),
        }
    }
}

impl std::str::FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tls" => Ok(Self::Tls),
            "wss" | "websocket" => Ok(Self::Wss),
            _ => anyhow::bail!("Unknown transport type: {}", s),
        }
    }
}

/// 传输层选项
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    /// 跳过服务器证书验证（仅用于测试）
    pub skip_verify: bool,
    /// 自定义 CA 证书路径
    pub ca_cert_path: Option<PathBuf>,
}

/// 传输层字节流抽象
///
/// 统一封装不同传输方式（TLS、WebSocket）建立的安全通道
pub trait TransportStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

// 为所有满足条件的类型自动实现 TransportStream
impl<T> TransportStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// 安全通道变体接口
///
/// 两个实现共享同一能力集：建立安全字节流、绑定远端转发规则。
/// 多路复用与事件分发由通用的 Connection 驱动完成
#[async_trait]
pub trait SecureChannel: Send + Sync {
    /// 传输类型
    fn kind(&self) -> TransportKind;

    /// 建立到服务器的安全字节流
    async fn establish(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Pin<Box<dyn TransportStream>>>;

    /// 绑定远端转发规则；完成后远端才会投递请求流
    async fn bind_forwards(
        &self,
        descriptor: &ConnectionDescriptor,
        stream: &mut Pin<Box<dyn TransportStream>>,
    ) -> Result<()>;
}

/// 按类型创建安全通道变体
pub fn create_channel(kind: TransportKind, options: &TransportOptions) -> Arc<dyn SecureChannel> {
    match kind {
        TransportKind::Tls => Arc::new(TlsChannel::new(options.clone())),
        TransportKind::Wss => Arc::new(WssChannel::new(options.clone())),
    }
}

/// 创建并启动一条传输连接；所有结果以事件形式投递
pub fn connect(
    kind: TransportKind,
    descriptor: ConnectionDescriptor,
    options: &TransportOptions,
) -> Connection {
    Connection::connect(create_channel(kind, options), descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_kind_round_trip() {
        assert_eq!(TransportKind::from_str("tls").unwrap(), TransportKind::Tls);
        assert_eq!(TransportKind::from_str("wss").unwrap(), TransportKind::Wss);
        assert_eq!(
            TransportKind::from_str("websocket").unwrap(),
            TransportKind::Wss
        );
        assert!(TransportKind::from_str("carrier-pigeon").is_err());

        assert_eq!(TransportKind::Tls.to_string(), "tls");
        assert_eq!(TransportKind::Wss.to_string(), "wss");
    }

    #[test]
    fn test_kind_default() {
        assert_eq!(TransportKind::default(), TransportKind::Tls);
    }
}
