/// WebSocket 传输变体（持久套接字式）
///
/// 连接 ID 和密钥随连接 URL 携带，服务端在接受连接时即完成转发注册，
/// 因此 bind_forwards 无需额外握手。消息套接字通过适配器暴露为字节流，
/// 供通用驱动在其上运行多路复用
use super::{SecureChannel, TransportKind, TransportOptions, TransportStream};
use crate::descriptor::ConnectionDescriptor;
use crate::error::{Result, TunnelError};
use crate::tls;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Sink, Stream};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::info;

pub struct WssChannel {
    options: TransportOptions,
}

impl WssChannel {
    pub fn new(options: TransportOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl SecureChannel for WssChannel {
    fn kind(&self) -> TransportKind {
        TransportKind::Wss
    }

    async fn establish(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Pin<Box<dyn TransportStream>>> {
        let mut url = url::Url::parse(&format!(
            "wss://{}:{}/tunnel",
            descriptor.host, descriptor.port
        ))
        .map_err(|e| TunnelError::transport(format!("invalid broker address: {e}")))?;

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("id", &descriptor.id);
            if let Some(key) = descriptor.key.as_deref() {
                query.append_pair("key", key);
            }
        }

        info!("Connecting to {}:{} via WSS", descriptor.host, descriptor.port);

        let config = tls::load_client_config(
            self.options.ca_cert_path.as_deref(),
            self.options.skip_verify,
        )
        .map_err(|e| TunnelError::transport(format!("TLS configuration failed: {e}")))?;

        let (socket, _response) = tokio_tungstenite::connect_async_tls_with_config(
            url.as_str(),
            None,
            false,
            Some(Connector::Rustls(config)),
        )
        .await
        .map_err(|e| TunnelError::transport(format!("websocket connect failed: {e}")))?;

        info!("WebSocket connection established");
        Ok(Box::pin(WsByteStream::new(socket)))
    }

    async fn bind_forwards(
        &self,
        _descriptor: &ConnectionDescriptor,
        _stream: &mut Pin<Box<dyn TransportStream>>,
    ) -> Result<()> {
        // 绑定随连接参数隐式完成
        Ok(())
    }
}

/// 消息套接字到字节流的适配器
///
/// 二进制消息即载荷；文本消息按 UTF-8 字节处理；Close 或流结束视为 EOF
struct WsByteStream {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
    read_buf: BytesMut,
}

impl WsByteStream {
    fn new(inner: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        Self {
            inner,
            read_buf: BytesMut::new(),
        }
    }
}

impl AsyncRead for WsByteStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.read_buf.is_empty() {
                let n = buf.remaining().min(this.read_buf.len());
                buf.put_slice(&this.read_buf.split_to(n));
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(message))) => match message {
                    Message::Binary(data) => this.read_buf.extend_from_slice(&data),
                    Message::Text(text) => this.read_buf.extend_from_slice(text.as_str().as_bytes()),
                    Message::Close(_) => return Poll::Ready(Ok(())),
                    // Ping/Pong 由协议栈自动应答
                    _ => {}
                },
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(io::Error::other(e))),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for WsByteStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {
                Pin::new(&mut this.inner)
                    .start_send(Message::Binary(Bytes::copy_from_slice(buf)))
                    .map_err(io::Error::other)?;
                Poll::Ready(Ok(buf.len()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::other(e))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner)
            .poll_flush(cx)
            .map_err(io::Error::other)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner)
            .poll_close(cx)
            .map_err(io::Error::other)
    }
}
