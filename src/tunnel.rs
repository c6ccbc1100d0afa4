/// 隧道
///
/// 持有一条传输连接并驱动其生命周期：连接、重连退避、空闲看门狗、
/// 入站请求分路。子域名查找表在构造时建立一次，此后只读。
/// 所有状态变更归一化为事件流供会话消费
use crate::descriptor::{ConnectionDescriptor, ForwardDescriptor};
use crate::error::{LocalErrorKind, Result, TunnelError};
use crate::transport::{
    self, ConnectionCtl, RequestStream, TransportEvent, TransportKind, TransportOptions,
};
use crate::{error_page, local, protocol, retry};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// 隧道事件
#[derive(Debug)]
pub enum TunnelEvent {
    /// 安全通道已建立
    Connect,
    /// 转发规则就绪（错误仅在绑定失败的历史路径上携带）
    Ready(Option<TunnelError>),
    /// 一条请求已路由到本地服务
    Request { subdomain: String },
    /// 收到心跳帧；令牌的真实语义由控制面校验
    Ping(String),
    /// 有数据经过隧道
    Data,
    /// 空闲看门狗到期（只上报，不主动关闭）
    Idle,
    /// 传输连接已关闭
    Close { had_error: bool },
    /// 传输通道错误
    Error(TunnelError),
    /// 单条转发的本地侧错误（错误页已写回公网访问者）
    LocalError {
        error: TunnelError,
        forward: ForwardDescriptor,
    },
    /// 单条转发的公网侧错误
    RemoteError(String),
}

/// 隧道配置
#[derive(Debug, Clone, Default)]
pub struct TunnelConfig {
    /// 传输变体
    pub kind: TransportKind,
    /// 传输层选项
    pub options: TransportOptions,
    /// 空闲看门狗超时；None 表示不启用
    pub idle_timeout: Option<Duration>,
}

/// 隧道句柄（可克隆）
#[derive(Clone)]
pub struct Tunnel {
    shared: Arc<Shared>,
}

struct Shared {
    descriptor: ConnectionDescriptor,
    /// 子域名到转发的查找表；构造后只读
    forwards: HashMap<String, ForwardDescriptor>,
    kind: TransportKind,
    options: TransportOptions,
    idle_timeout: Option<Duration>,
    events: mpsc::UnboundedSender<TunnelEvent>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    connection: Option<ConnectionCtl>,
    pump: Option<JoinHandle<()>>,
    connected: bool,
    retries: u32,
    idle_timer: Option<JoinHandle<()>>,
    retry_timer: Option<JoinHandle<()>>,
}

impl Tunnel {
    /// 由连接描述构造隧道（不发起连接）
    pub fn new(
        descriptor: ConnectionDescriptor,
        config: TunnelConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TunnelEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let forwards = descriptor.forward_map();
        let shared = Arc::new(Shared {
            descriptor,
            forwards,
            kind: config.kind,
            options: config.options,
            idle_timeout: config.idle_timeout,
            events: events_tx,
            state: Mutex::new(State::default()),
        });
        (Self { shared }, events_rx)
    }

    /// 发起（或重新发起）连接；结果以事件投递
    pub fn connect(&self) {
        debug!(
            "Connecting forwards via {}:{}",
            self.shared.descriptor.host, self.shared.descriptor.port
        );

        let mut conn = transport::connect(
            self.shared.kind,
            self.shared.descriptor.clone(),
            &self.shared.options,
        );
        let ctl = conn.ctl();
        let shared = Arc::clone(&self.shared);
        let pump = tokio::spawn(async move { pump(shared, &mut conn).await });

        let mut st = self.shared.state.lock();
        // 同一时刻至多一个活动传输实例
        if let Some(old) = st.connection.take() {
            old.destroy();
        }
        if let Some(old) = st.pump.take() {
            old.abort();
        }
        st.connection = Some(ctl);
        st.pump = Some(pump);
    }

    /// 重置空闲看门狗
    pub fn touch(&self) {
        self.shared.touch();
    }

    /// 调度一次重连：递增尝试计数并在退避延迟后丢弃旧传输重连
    pub fn retry(&self) {
        let this = self.clone();
        let mut st = self.shared.state.lock();
        st.retries += 1;
        let attempt = st.retries;
        let delay = retry::backoff_delay(attempt);
        debug!("Scheduling reconnect attempt {} in {:?}", attempt, delay);

        if let Some(old) = st.retry_timer.take() {
            old.abort();
        }
        st.retry_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!("Trying to re-establish connection...");
            this.connect();
        }));
    }

    /// 优雅关闭
    ///
    /// 未连接时直接销毁传输并合成 Close 事件；已连接时委托传输优雅关闭，
    /// Close 事件由驱动发出。两条路径都恰好完成一次
    pub async fn close(&self) -> Result<()> {
        debug!("Closing forward channel");
        self.clear_handlers();

        let (ctl, connected) = {
            let mut st = self.shared.state.lock();
            (st.connection.take(), st.connected)
        };

        match ctl {
            Some(ctl) if connected => {
                ctl.close().await;
            }
            other => {
                debug!("Not currently connected, destroying transport");
                if let Some(ctl) = other {
                    ctl.destroy();
                }
                let _ = self.shared.events.send(TunnelEvent::Close { had_error: false });
            }
        }
        Ok(())
    }

    /// 无条件强制拆除；不发出事件，无回执
    pub fn destroy(&self) {
        debug!("Destroying secure channel");
        self.clear_handlers();
        let mut st = self.shared.state.lock();
        if let Some(ctl) = st.connection.take() {
            ctl.destroy();
        }
        if let Some(pump) = st.pump.take() {
            pump.abort();
        }
        st.connected = false;
    }

    /// 成对取消重试与空闲定时器
    pub fn clear_handlers(&self) {
        let mut st = self.shared.state.lock();
        if let Some(timer) = st.retry_timer.take() {
            timer.abort();
        }
        if let Some(timer) = st.idle_timer.take() {
            timer.abort();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().connected
    }

    pub fn retries(&self) -> u32 {
        self.shared.state.lock().retries
    }
}

impl Shared {
    /// 重置空闲看门狗；到期只发 Idle 事件，由调用方决定动作
    fn touch(self: &Arc<Self>) {
        let Some(timeout) = self.idle_timeout else {
            return;
        };
        let mut st = self.state.lock();
        if let Some(timer) = st.idle_timer.take() {
            timer.abort();
        }
        let shared = Arc::clone(self);
        st.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = shared.events.send(TunnelEvent::Idle);
        }));
    }
}

/// 传输事件泵：把连接事件翻译为隧道事件并维护连接状态
async fn pump(shared: Arc<Shared>, conn: &mut transport::Connection) {
    while let Some(event) = conn.next_event().await {
        match event {
            TransportEvent::Connect => {
                {
                    let mut st = shared.state.lock();
                    st.connected = true;
                    st.retries = 0;
                }
                let _ = shared.events.send(TunnelEvent::Connect);
            }
            TransportEvent::Ready => {
                let _ = shared.events.send(TunnelEvent::Ready(None));
                shared.touch();
            }
            TransportEvent::Request(stream) => {
                let shared = Arc::clone(&shared);
                tokio::spawn(handle_request(shared, stream));
            }
            TransportEvent::Error(err) => {
                shared.state.lock().connected = false;
                let _ = shared.events.send(TunnelEvent::Error(err));
            }
            TransportEvent::Close { had_error } => {
                shared.state.lock().connected = false;
                let _ = shared.events.send(TunnelEvent::Close { had_error });
                return;
            }
        }
    }
}

/// 处理一条入站请求流
///
/// 首块按原始 HTTP 前导解析：心跳帧内联应答后结束；普通请求按
/// `x-subdomain` 查表路由到本地连接器并双向搬运
async fn handle_request(shared: Arc<Shared>, mut remote: RequestStream) {
    let mut first = vec![0u8; 8192];
    let n = match remote.read(&mut first).await {
        Ok(0) => return,
        Ok(n) => n,
        Err(e) => {
            debug!("Request stream ended before preamble: {}", e);
            return;
        }
    };
    first.truncate(n);

    let preamble = protocol::RequestPreamble::parse(&String::from_utf8_lossy(&first));

    if let Some(token) = preamble.ping_token(&shared.descriptor.id) {
        debug!("Heartbeat frame");
        let _ = shared.events.send(TunnelEvent::Ping(token.to_string()));
        let _ = remote.write_all(protocol::HEARTBEAT_ACK).await;
        let _ = remote.shutdown().await;
        return;
    }

    shared.touch();

    let forward = match preamble.subdomain().and_then(|s| shared.forwards.get(s)) {
        Some(forward) => forward.clone(),
        None => {
            // 不可路由：结束响应流，无响应体
            debug!("Unroutable request (subdomain {:?})", preamble.subdomain());
            let _ = remote.shutdown().await;
            return;
        }
    };

    let _ = shared.events.send(TunnelEvent::Request {
        subdomain: forward.subdomain.clone(),
    });

    let mut local_stream = match local::connect(&forward).await {
        Ok(stream) => stream,
        Err(error) => {
            let kind = error.local_kind().unwrap_or(LocalErrorKind::Unknown);
            let _ = remote
                .write_all(error_page::response_for(kind).as_bytes())
                .await;
            let _ = remote.shutdown().await;
            let _ = shared.events.send(TunnelEvent::LocalError { error, forward });
            return;
        }
    };

    debug!(
        "Issuing request: {} {}",
        preamble.method.as_deref().unwrap_or("-"),
        preamble.path.as_deref().unwrap_or("-")
    );

    // 已缓冲的首块直接写入本地套接字，之后才开始双向搬运
    if let Err(e) = local_stream.write_all(&first).await {
        let kind = local::classify(&e);
        let _ = remote
            .write_all(error_page::response_for(kind).as_bytes())
            .await;
        let _ = remote.shutdown().await;
        let _ = shared.events.send(TunnelEvent::LocalError {
            error: TunnelError::local_connect(kind, e.to_string()),
            forward,
        });
        return;
    }

    splice(shared, forward, local_stream, remote).await;
}

/// 区分读写两侧的搬运错误，用于归属本地/公网
enum SpliceError {
    Read(io::Error),
    Write(io::Error),
}

/// 分块搬运；每块都走一次有界缓冲，慢端自然形成背压
async fn copy_chunks<R, W>(
    reader: &mut R,
    writer: &mut W,
    events: &mpsc::UnboundedSender<TunnelEvent>,
) -> std::result::Result<u64, SpliceError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; 8192];

    loop {
        let n = reader.read(&mut buf).await.map_err(SpliceError::Read)?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .await
            .map_err(SpliceError::Write)?;
        total += n as u64;
        let _ = events.send(TunnelEvent::Data);
    }

    writer.flush().await.map_err(SpliceError::Write)?;
    Ok(total)
}

/// 双向搬运；本地侧出错时先停止两个方向再写错误页，避免部分双写
async fn splice(
    shared: Arc<Shared>,
    forward: ForwardDescriptor,
    local_stream: Pin<Box<dyn transport::TransportStream>>,
    remote: RequestStream,
) {
    enum Finished {
        Inbound(std::result::Result<u64, SpliceError>),
        Outbound(std::result::Result<u64, SpliceError>),
    }

    let (mut local_read, mut local_write) = tokio::io::split(local_stream);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);
    let events = shared.events.clone();

    let inbound = copy_chunks(&mut remote_read, &mut local_write, &events);
    let outbound = copy_chunks(&mut local_read, &mut remote_write, &events);

    let finished = tokio::select! {
        result = inbound => Finished::Inbound(result),
        result = outbound => Finished::Outbound(result),
    };

    match finished {
        Finished::Inbound(Ok(_)) | Finished::Outbound(Ok(_)) => {
            debug!("Splice finished for '{}'", forward.subdomain);
            let _ = remote_write.shutdown().await;
        }
        Finished::Inbound(Err(SpliceError::Write(e)))
        | Finished::Outbound(Err(SpliceError::Read(e))) => {
            let kind = local::classify(&e);
            let _ = remote_write
                .write_all(error_page::response_for(kind).as_bytes())
                .await;
            let _ = remote_write.shutdown().await;
            let _ = events.send(TunnelEvent::LocalError {
                error: TunnelError::local_connect(kind, e.to_string()),
                forward,
            });
        }
        Finished::Inbound(Err(SpliceError::Read(e)))
        | Finished::Outbound(Err(SpliceError::Write(e))) => {
            let _ = events.send(TunnelEvent::RemoteError(e.to_string()));
        }
    }
}
