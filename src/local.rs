/// 本地连接器
///
/// 按转发描述打开到本地服务的 TCP 或 TLS 套接字。主机名解析考虑所有
/// 地址族，逐个尝试直到成功。本地服务常用自签名证书，TLS 连接放宽校验。
/// 连接失败归类为小型分类法，供错误页使用；不会导致隧道整体失败
use crate::descriptor::ForwardDescriptor;
use crate::error::{LocalErrorKind, Result, TunnelError};
use crate::tls;
use crate::transport::TransportStream;
use rustls::pki_types::ServerName;
use std::io;
use std::pin::Pin;
use tokio::net::{lookup_host, TcpStream};
use tokio_rustls::TlsConnector;
use tracing::debug;

/// 将套接字错误码映射到用户可见分类
///
/// 未覆盖的错误码归入 Unknown 而不是报错；EINVAL（无效地址）归入 NotFound
pub fn classify(err: &io::Error) -> LocalErrorKind {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => LocalErrorKind::Refused,
        io::ErrorKind::NotFound
        | io::ErrorKind::HostUnreachable
        | io::ErrorKind::NetworkUnreachable
        | io::ErrorKind::InvalidInput => LocalErrorKind::NotFound,
        io::ErrorKind::TimedOut => LocalErrorKind::TimedOut,
        _ => LocalErrorKind::Unknown,
    }
}

/// 连接转发目标的本地服务
pub async fn connect(forward: &ForwardDescriptor) -> Result<Pin<Box<dyn TransportStream>>> {
    let host = forward.private_host.as_str();
    let port = forward.private_port;
    debug!("Connecting local socket to {}:{}", host, port);

    let addrs: Vec<_> = lookup_host((host, port))
        .await
        .map_err(|e| {
            TunnelError::local_connect(
                LocalErrorKind::NotFound,
                format!("failed to resolve {host}: {e}"),
            )
        })?
        .collect();

    if addrs.is_empty() {
        return Err(TunnelError::local_connect(
            LocalErrorKind::NotFound,
            format!("no addresses for {host}"),
        ));
    }

    // 逐地址尝试，保留最后一个错误用于归类
    let mut last_err: Option<io::Error> = None;
    let mut stream = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(s) => {
                stream = Some(s);
                break;
            }
            Err(e) => last_err = Some(e),
        }
    }

    let tcp = match stream {
        Some(s) => s,
        None => {
            let err = last_err
                .unwrap_or_else(|| io::Error::other(format!("no usable address for {host}")));
            let kind = classify(&err);
            return Err(TunnelError::local_connect(
                kind,
                format!("failed to connect to {host}:{port}: {err}"),
            ));
        }
    };

    if !forward.ssl {
        debug!("Local TCP socket connected to {}:{}", host, port);
        return Ok(Box::pin(tcp));
    }

    // TLS 目标：放宽证书校验以支持自签名的本地服务
    debug!("Upgrading local socket to TLS");
    let connector = TlsConnector::from(tls::relaxed_client_config());
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| {
            TunnelError::local_connect(
                LocalErrorKind::NotFound,
                format!("invalid local host name {host}: {e}"),
            )
        })?
        .to_owned();

    let tls_stream = connector.connect(server_name, tcp).await.map_err(|e| {
        let kind = classify(&e);
        TunnelError::local_connect(kind, format!("local TLS handshake failed: {e}"))
    })?;

    Ok(Box::pin(tls_stream))
}
