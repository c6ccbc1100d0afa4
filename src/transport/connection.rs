/// 传输连接通用驱动
///
/// 持有一条已建立的安全通道，在其上运行 yamux 多路复用，并把连接生命周期
/// 归一化为有序事件流：Connect → Ready → 若干 Request → 一次终止性 Close
/// （或 Error 后 Close）。每条入站 yamux 子流对应一条被转发的公网连接
use super::{SecureChannel, TransportStream};
use crate::descriptor::ConnectionDescriptor;
use crate::error::TunnelError;
use futures::future::poll_fn;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tracing::{debug, warn};
use yamux::{Config as YamuxConfig, Connection as YamuxConnection, Mode as YamuxMode};

/// 单条转发请求的双向字节流
pub type RequestStream = Pin<Box<dyn TransportStream>>;

/// 传输连接事件（按发生顺序投递，不重排不合并）
pub enum TransportEvent {
    /// 安全通道已建立
    Connect,
    /// 远端转发规则已就绪，请求流即将到来
    Ready,
    /// 一条入站请求流
    Request(RequestStream),
    /// 通道错误（之后必有一次 Close）
    Error(TunnelError),
    /// 终止：连接已关闭
    Close { had_error: bool },
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::Connect => write!(f, "Connect"),
            TransportEvent::Ready => write!(f, "Ready"),
            TransportEvent::Request(_) => write!(f, "Request(..)"),
            TransportEvent::Error(e) => write!(f, "Error({e})"),
            TransportEvent::Close { had_error } => write!(f, "Close {{ had_error: {had_error} }}"),
        }
    }
}

enum Command {
    /// 优雅关闭；回执恰好发送一次
    Close(oneshot::Sender<()>),
    /// 立即强制拆除，不发出任何事件
    Destroy,
}

/// 传输连接控制句柄（可克隆，close/destroy 入口）
#[derive(Clone)]
pub struct ConnectionCtl {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl ConnectionCtl {
    /// 优雅关闭；无论驱动任务是否存活都恰好完成一次
    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Close(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// 强制拆除，无回执、无事件
    pub fn destroy(&self) {
        let _ = self.cmd_tx.send(Command::Destroy);
    }
}

/// 一条传输连接
///
/// `connect` 不会同步失败；包括建立失败在内的所有结果都以事件投递
pub struct Connection {
    ctl: ConnectionCtl,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Connection {
    /// 启动连接驱动任务
    pub fn connect(channel: Arc<dyn SecureChannel>, descriptor: ConnectionDescriptor) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        tokio::spawn(drive(channel, descriptor, event_tx, cmd_rx));

        Self {
            ctl: ConnectionCtl { cmd_tx },
            events: event_rx,
        }
    }

    /// 控制句柄
    pub fn ctl(&self) -> ConnectionCtl {
        self.ctl.clone()
    }

    /// 取下一个事件；驱动任务结束后返回 None
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }
}

/// 连接驱动循环
async fn drive(
    channel: Arc<dyn SecureChannel>,
    descriptor: ConnectionDescriptor,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
) {
    // 建立阶段也要响应关闭命令，避免慢连接拖住主动关闭
    let mut stream = tokio::select! {
        result = channel.establish(&descriptor) => match result {
            Ok(stream) => stream,
            Err(err) => {
                let _ = event_tx.send(TransportEvent::Error(err));
                let _ = event_tx.send(TransportEvent::Close { had_error: true });
                return;
            }
        },
        cmd = cmd_rx.recv() => {
            if let Some(Command::Close(ack)) = cmd {
                let _ = event_tx.send(TransportEvent::Close { had_error: false });
                let _ = ack.send(());
            }
            return;
        }
    };

    let _ = event_tx.send(TransportEvent::Connect);
    debug!("Secure channel established via {}", channel.kind());

    if let Err(err) = channel.bind_forwards(&descriptor, &mut stream).await {
        let _ = event_tx.send(TransportEvent::Error(err));
        let _ = event_tx.send(TransportEvent::Close { had_error: true });
        return;
    }

    let mut conn = YamuxConnection::new(stream.compat(), YamuxConfig::default(), YamuxMode::Client);

    let _ = event_tx.send(TransportEvent::Ready);
    debug!("Forwards bound; ready for requests");

    loop {
        tokio::select! {
            inbound = poll_fn(|cx| conn.poll_next_inbound(cx)) => match inbound {
                Some(Ok(stream)) => {
                    debug!("Inbound request stream");
                    let boxed: RequestStream = Box::pin(stream.compat());
                    if event_tx.send(TransportEvent::Request(boxed)).is_err() {
                        return;
                    }
                }
                Some(Err(e)) => {
                    warn!("Multiplexer error: {}", e);
                    let _ = event_tx.send(TransportEvent::Error(TunnelError::transport(
                        format!("multiplexer error: {e}"),
                    )));
                    let _ = event_tx.send(TransportEvent::Close { had_error: true });
                    return;
                }
                None => {
                    debug!("Connection closed by remote");
                    let _ = event_tx.send(TransportEvent::Close { had_error: false });
                    return;
                }
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Close(ack)) => {
                    debug!("Closing connection");
                    let _ = poll_fn(|cx| conn.poll_close(cx)).await;
                    let _ = event_tx.send(TransportEvent::Close { had_error: false });
                    let _ = ack.send(());
                    return;
                }
                // 句柄全部丢弃等同于强制拆除
                Some(Command::Destroy) | None => return,
            },
        }
    }
}
