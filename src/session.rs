/// 会话
///
/// 面向调用方的生命周期封装：一条隧道加上它的控制面身份（连接 ID、密钥）。
/// 解释隧道事件、与控制面核对心跳与清理、把关闭归类为吊销/错误/意外三种
/// 互斥原因，并以统一事件面向外发布
use crate::api::{self, CreateConnection, DeleteReason, PingReplyType};
use crate::config::ClientConfig;
use crate::descriptor::{ConnectionDescriptor, ForwardDescriptor};
use crate::error::{ErrorLevel, Result, TunnelError};
use crate::transport::TransportOptions;
use crate::tunnel::{Tunnel, TunnelConfig, TunnelEvent};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// 发布给调用方的单条转发
#[derive(Debug, Clone)]
pub struct PublicForward {
    pub subdomain: String,
    /// 完整公网地址
    pub url: String,
    /// 短地址
    pub short_url: String,
}

/// 关闭原因（互斥）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// 会话自身请求的关闭
    Requested,
    /// 服务端吊销
    Revoked,
    /// 服务端上报错误级别后的关闭
    Error,
    /// 意外关闭（无已记录错误、非会话发起）
    Unexpected,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Requested => "requested",
            CloseReason::Revoked => "revoked",
            CloseReason::Error => "error",
            CloseReason::Unexpected => "unexpected",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 关闭详情
#[derive(Debug, Clone)]
pub struct CloseInfo {
    pub reason: CloseReason,
    pub message: String,
    /// 是否已调度重连；这是"该关闭是否终止会话"的权威信号
    pub will_retry: bool,
}

/// 会话事件面
#[derive(Debug)]
pub enum SessionEvent {
    Connect,
    Ready(Option<TunnelError>),
    Start,
    Closing,
    Close(CloseInfo),
    Revoking,
    Error(TunnelError),
    Data,
    Idle,
    LocalError {
        error: TunnelError,
        forward: ForwardDescriptor,
    },
    RemoteError(String),
}

/// forward 调用的参数
#[derive(Debug, Clone, Default)]
pub struct ForwardOptions {
    /// 申请注册的转发
    pub forwards: Vec<ForwardDescriptor>,
    /// 认证密钥
    pub key: String,
    pub consumer_key: Option<String>,
    pub edgy: Option<bool>,
    /// 每会话空闲看门狗超时；覆盖配置值
    pub idle_timeout: Option<Duration>,
}

/// 已记录的最近一次错误（关闭归类时查询）
#[derive(Debug, Clone)]
struct RecordedError {
    level: Option<ErrorLevel>,
    message: String,
}

struct SessionState {
    closing: bool,
    revoking: bool,
    active: bool,
    should_retry: bool,
    retries_left: u32,
    last_error: Option<RecordedError>,
}

struct SessionShared {
    api: api::Client,
    descriptor: ConnectionDescriptor,
    key: String,
    tunnel: Tunnel,
    forwards: Vec<PublicForward>,
    retry_budget: u32,
    close_grace: Duration,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: Mutex<SessionState>,
}

/// 一个活动会话
pub struct Session {
    shared: Arc<SessionShared>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// 会话控制句柄（可克隆；供信号处理等旁路发起关闭）
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    /// 用户主动关闭
    pub async fn close(&self) -> Result<()> {
        close_session(&self.shared, DeleteReason::Disconnect).await
    }

    /// 空闲超时关闭
    pub async fn timeout(&self) -> Result<()> {
        close_session(&self.shared, DeleteReason::Timeout).await
    }

    /// 无条件强制拆除
    pub fn destroy(&self) {
        self.shared.tunnel.destroy();
    }
}

/// 建立会话：创建远端连接、构造隧道、绑定事件泵并发起连接
pub async fn forward(config: &ClientConfig, options: ForwardOptions) -> Result<Session> {
    let client = api::Client::new(&config.api)?;

    let mut request = CreateConnection::new(options.forwards.clone());
    request.consumer_key = options.consumer_key.clone();
    request.edgy = options.edgy;

    let reply = client.create_connection(&request, &options.key).await?;
    if let Some(warning) = reply.warning {
        return Err(TunnelError::control_plane(None, warning));
    }
    let descriptor = reply.connection;
    info!("Connection ID: {}", descriptor.id);

    let forwards: Vec<PublicForward> = descriptor
        .forwards
        .iter()
        .map(|f| PublicForward {
            subdomain: f.subdomain.clone(),
            url: f.public_url(&descriptor.domain, &config.public.protocol, &config.public.suffix),
            short_url: f.short_url(&descriptor.domain),
        })
        .collect();

    let tunnel_config = TunnelConfig {
        kind: config.transport,
        options: TransportOptions {
            skip_verify: config.skip_verify,
            ca_cert_path: config.ca_cert_path.clone(),
        },
        idle_timeout: options.idle_timeout.or_else(|| config.idle_timeout()),
    };
    let (tunnel, tunnel_rx) = Tunnel::new(descriptor.clone(), tunnel_config);

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(SessionShared {
        api: client,
        descriptor,
        key: options.key,
        tunnel,
        forwards,
        retry_budget: config.retry_budget,
        close_grace: config.close_grace(),
        events: events_tx,
        state: Mutex::new(SessionState {
            closing: false,
            revoking: false,
            active: true,
            should_retry: true,
            retries_left: config.retry_budget,
            last_error: None,
        }),
    });

    tokio::spawn(pump(Arc::clone(&shared), tunnel_rx));

    let _ = shared.events.send(SessionEvent::Start);
    shared.tunnel.connect();

    Ok(Session {
        shared,
        events: events_rx,
    })
}

impl Session {
    /// 已注册转发的公网地址
    pub fn forwards(&self) -> &[PublicForward] {
        &self.shared.forwards
    }

    pub fn connection_id(&self) -> &str {
        &self.shared.descriptor.id
    }

    /// 取下一个会话事件
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// 控制句柄
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// 用户主动关闭
    pub async fn close(&self) -> Result<()> {
        close_session(&self.shared, DeleteReason::Disconnect).await
    }

    /// 空闲超时关闭
    pub async fn timeout(&self) -> Result<()> {
        close_session(&self.shared, DeleteReason::Timeout).await
    }

    /// 无条件强制拆除，绕过所有守卫（进程退出等场景）
    pub fn destroy(&self) {
        self.shared.tunnel.destroy();
    }
}

/// 幂等关闭流程，按原因参数化
///
/// 先从控制面拆除连接（计费意义上不再有流量经过），随后在宽限窗口内
/// 等待隧道优雅关闭，超时则强制销毁。所有路径恰好完成一次
async fn close_session(shared: &Arc<SessionShared>, reason: DeleteReason) -> Result<()> {
    {
        let mut st = shared.state.lock();
        if st.closing {
            debug!("Ignoring close request; session is already closing");
            return Ok(());
        }
        if !st.active {
            return Ok(());
        }
        st.closing = true;
    }

    let _ = shared.events.send(SessionEvent::Closing);
    // 用户主动关闭必须先取消挂起的重试/空闲定时器，避免过期重试竞争
    shared.tunnel.clear_handlers();

    shared
        .api
        .delete_connection(&shared.descriptor.id, reason, &shared.key)
        .await?;

    match tokio::time::timeout(shared.close_grace, shared.tunnel.close()).await {
        Ok(_) => {
            debug!("Tunnel closed cleanly");
        }
        Err(_) => {
            warn!("Tunnel close took too long; destroying");
            shared.tunnel.destroy();
        }
    }

    shared.state.lock().active = false;
    Ok(())
}

/// 清理瞬态标记并重置重试预算（连接/就绪时调用，覆盖未完全断开的重连路径）
fn reset_transient(shared: &SessionShared) {
    let mut st = shared.state.lock();
    st.closing = false;
    st.revoking = false;
    st.last_error = None;
    st.retries_left = shared.retry_budget;
}

/// 隧道事件泵：实现事件处理契约
async fn pump(shared: Arc<SessionShared>, mut rx: mpsc::UnboundedReceiver<TunnelEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            TunnelEvent::Connect => {
                reset_transient(&shared);
                let _ = shared.events.send(SessionEvent::Connect);
            }
            TunnelEvent::Ready(err) => {
                reset_transient(&shared);
                let _ = shared.events.send(SessionEvent::Ready(err));
            }
            TunnelEvent::Ping(token) => {
                tokio::spawn(verify_ping(Arc::clone(&shared), token));
            }
            TunnelEvent::Close { had_error } => {
                handle_close(&shared, had_error).await;
            }
            TunnelEvent::Error(err) => {
                {
                    let mut st = shared.state.lock();
                    st.last_error = Some(RecordedError {
                        level: err.level().cloned(),
                        message: err.to_string(),
                    });
                }
                let _ = shared.events.send(SessionEvent::Error(err));
            }
            TunnelEvent::Data => {
                let _ = shared.events.send(SessionEvent::Data);
            }
            TunnelEvent::Idle => {
                let _ = shared.events.send(SessionEvent::Idle);
            }
            TunnelEvent::Request { subdomain } => {
                debug!("Forwarding request for '{}'", subdomain);
            }
            TunnelEvent::LocalError { error, forward } => {
                let _ = shared
                    .events
                    .send(SessionEvent::LocalError { error, forward });
            }
            TunnelEvent::RemoteError(message) => {
                let _ = shared.events.send(SessionEvent::RemoteError(message));
            }
        }
    }
}

/// 用控制面核对心跳令牌的真实语义
async fn verify_ping(shared: Arc<SessionShared>, token: String) {
    debug!("Verifying ping request");

    match shared.api.verify_ping(&token, &shared.key).await {
        Err(e) => {
            // 多半是误发的心跳；静默忽略
            debug!("Ignoring invalid ping: {}", e);
        }
        Ok(reply) => match reply.reply {
            PingReplyType::Ping => {}
            PingReplyType::Disconnect => {
                {
                    let mut st = shared.state.lock();
                    if st.revoking {
                        return;
                    }
                    st.revoking = true;
                }
                let _ = shared.events.send(SessionEvent::Revoking);
                // 服务端已吊销本连接：关闭隧道，不重试也不做清理删除
                let _ = shared.tunnel.close().await;
            }
            PingReplyType::Unknown => {
                warn!("Unhandled ping response type");
            }
        },
    }
}

/// 清理动作（互斥）
#[derive(Debug, PartialEq, Eq)]
enum CleanupAction {
    None,
    Retry,
    Delete(DeleteReason),
}

/// 把一次传输关闭归类为互斥的关闭原因与后续动作
///
/// 优先级：会话自身发起 > 吊销 > 已记录错误级别 > 意外。
/// 致命级别（认证、超时）永不重试；其余在预算内重试，超出预算走清理删除
fn classify_close(st: &SessionState) -> (CloseInfo, CleanupAction) {
    if st.closing {
        return (
            CloseInfo {
                reason: CloseReason::Requested,
                message: "session close requested".to_string(),
                will_retry: false,
            },
            CleanupAction::None,
        );
    }

    if st.revoking {
        return (
            CloseInfo {
                reason: CloseReason::Revoked,
                message: "connection revoked by server".to_string(),
                will_retry: false,
            },
            CleanupAction::None,
        );
    }

    if let Some(err) = &st.last_error {
        if let Some(level) = &err.level {
            if level.is_fatal() {
                return (
                    CloseInfo {
                        reason: CloseReason::Error,
                        message: err.message.clone(),
                        will_retry: false,
                    },
                    CleanupAction::Delete(DeleteReason::ConnectionError),
                );
            }
            if st.should_retry && st.retries_left > 0 {
                return (
                    CloseInfo {
                        reason: CloseReason::Error,
                        message: err.message.clone(),
                        will_retry: true,
                    },
                    CleanupAction::Retry,
                );
            }
            return (
                CloseInfo {
                    reason: CloseReason::Error,
                    message: err.message.clone(),
                    will_retry: false,
                },
                CleanupAction::Delete(DeleteReason::ConnectionError),
            );
        }
    }

    if st.should_retry && st.retries_left > 0 {
        (
            CloseInfo {
                reason: CloseReason::Unexpected,
                message: "connection closed unexpectedly".to_string(),
                will_retry: true,
            },
            CleanupAction::Retry,
        )
    } else {
        (
            CloseInfo {
                reason: CloseReason::Unexpected,
                message: "connection closed unexpectedly".to_string(),
                will_retry: false,
            },
            CleanupAction::Delete(DeleteReason::UnknownError),
        )
    }
}

/// 处理传输关闭：归类、执行清理动作、发布 Close 事件
async fn handle_close(shared: &Arc<SessionShared>, had_error: bool) {
    debug!("Secure connection closed (had_error: {})", had_error);

    let (info, action) = {
        let mut st = shared.state.lock();
        let (info, action) = classify_close(&st);
        match action {
            CleanupAction::Retry => {
                st.retries_left = st.retries_left.saturating_sub(1);
                if st.retries_left == 0 {
                    // 预算耗尽后本会话永久不再重试
                    st.should_retry = false;
                }
            }
            CleanupAction::Delete(_) => {
                st.closing = true;
                st.active = false;
            }
            CleanupAction::None => {
                if !info.will_retry {
                    st.active = false;
                }
            }
        }
        (info, action)
    };

    match action {
        CleanupAction::Retry => {
            shared.tunnel.retry();
        }
        CleanupAction::Delete(reason) => {
            debug!("Session closed unexpectedly; attempting cleanup");
            // 清理失败只记录；不得改写已裁定的关闭原因
            if let Err(e) = shared
                .api
                .delete_connection(&shared.descriptor.id, reason, &shared.key)
                .await
            {
                warn!("Could not clean up connection: {}", e);
            } else {
                debug!("Connection cleaned up successfully");
            }
        }
        CleanupAction::None => {}
    }

    let _ = shared.events.send(SessionEvent::Close(info));
}
