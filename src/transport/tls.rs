/// TLS 传输变体（远端口转发式）
///
/// TCP + TLS 建立安全通道后，在裸流上完成一次长度前缀 JSON 绑定握手：
/// 服务端确认转发规则生效后回一个确认字节，之后才进入多路复用阶段。
/// 服务端拒绝时回错误帧，其 level 字段映射为会话可见的错误级别
use super::{SecureChannel, TransportKind, TransportOptions, TransportStream};
use crate::descriptor::ConnectionDescriptor;
use crate::error::{ErrorLevel, Result, TunnelError};
use crate::tls;
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

/// 绑定帧（长度前缀 JSON）
#[derive(Debug, Serialize)]
struct BindRequest<'a> {
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    forward_port: Option<u16>,
}

/// 服务端拒绝时的错误帧
#[derive(Debug, Deserialize)]
struct ErrorFrame {
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

const MAX_FRAME_SIZE: u32 = 64 * 1024;

pub struct TlsChannel {
    options: TransportOptions,
}

impl TlsChannel {
    pub fn new(options: TransportOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl SecureChannel for TlsChannel {
    fn kind(&self) -> TransportKind {
        TransportKind::Tls
    }

    async fn establish(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Pin<Box<dyn TransportStream>>> {
        let addr = format!("{}:{}", descriptor.host, descriptor.port);
        info!("Connecting to {} via TLS", addr);

        let tcp_stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| TunnelError::transport(format!("failed to connect to {addr}: {e}")))?;

        let config = tls::load_client_config(
            self.options.ca_cert_path.as_deref(),
            self.options.skip_verify,
        )
        .map_err(|e| TunnelError::transport(format!("TLS configuration failed: {e}")))?;
        let connector = TlsConnector::from(config);

        let server_name = ServerName::try_from(descriptor.host.clone())
            .map_err(|e| TunnelError::transport(format!("invalid server name: {e}")))?
            .to_owned();

        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| TunnelError::transport(format!("TLS handshake failed: {e}")))?;

        info!("TLS connection established to {}", addr);
        Ok(Box::pin(tls_stream))
    }

    async fn bind_forwards(
        &self,
        descriptor: &ConnectionDescriptor,
        stream: &mut Pin<Box<dyn TransportStream>>,
    ) -> Result<()> {
        let request = BindRequest {
            id: &descriptor.id,
            user: descriptor.user.as_deref(),
            key: descriptor.key.as_deref(),
            forward_port: descriptor.forward_port,
        };
        let json = serde_json::to_vec(&request)
            .map_err(|e| TunnelError::protocol(format!("failed to encode bind frame: {e}")))?;

        stream.write_all(&(json.len() as u32).to_be_bytes()).await?;
        stream.write_all(&json).await?;
        stream.flush().await?;
        debug!("Sent forward binding for connection {}", descriptor.id);

        let mut ack = [0u8; 1];
        stream.read_exact(&mut ack).await?;

        if ack[0] != 1 {
            let frame = read_error_frame(stream).await;
            let level = frame
                .level
                .as_deref()
                .map(ErrorLevel::parse);
            let message = frame
                .message
                .unwrap_or_else(|| "forward binding rejected".to_string());
            return Err(TunnelError::Transport { level, message });
        }

        debug!("Forward binding acknowledged");
        Ok(())
    }
}

/// 读取服务端的错误帧；帧本身损坏时退化为空帧
async fn read_error_frame(stream: &mut Pin<Box<dyn TransportStream>>) -> ErrorFrame {
    let empty = ErrorFrame {
        level: None,
        message: None,
    };

    let mut len_buf = [0u8; 4];
    if stream.read_exact(&mut len_buf).await.is_err() {
        return empty;
    }
    let len = u32::from_be_bytes(len_buf);
    if len == 0 || len > MAX_FRAME_SIZE {
        return empty;
    }

    let mut buf = vec![0u8; len as usize];
    if stream.read_exact(&mut buf).await.is_err() {
        return empty;
    }

    serde_json::from_slice(&buf).unwrap_or(empty)
}
