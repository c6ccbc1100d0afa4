/// 反向隧道客户端库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod api;
pub mod cli;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod error_page;
pub mod local;
pub mod prefs;
pub mod protocol;
pub mod retry;
pub mod session;
pub mod tls;
pub mod transport;
pub mod tunnel;

// 重新导出常用类型
pub use api::{Client, DeleteReason, PingReplyType};
pub use config::ClientConfig;
pub use descriptor::{ConnectionDescriptor, ForwardDescriptor, ForwardTarget};
pub use error::{ErrorLevel, LocalErrorKind, Result, TunnelError};
pub use session::{
    forward, CloseInfo, CloseReason, ForwardOptions, PublicForward, Session, SessionEvent,
    SessionHandle,
};
pub use transport::TransportKind;
pub use tunnel::{Tunnel, TunnelConfig, TunnelEvent};
