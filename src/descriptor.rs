/// 连接与转发描述
///
/// 控制面在创建连接时下发 ConnectionDescriptor，其生命周期内不可变；
/// ForwardDescriptor 是单条子域名到本地服务的映射，隧道按子域名查表路由
use crate::error::{Result, TunnelError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 单条转发映射
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardDescriptor {
    /// 公网子域名（路由键，连接内唯一）
    pub subdomain: String,
    /// 本地服务主机
    pub private_host: String,
    /// 本地服务端口
    pub private_port: u16,
    /// 本地服务是否为 TLS
    #[serde(default)]
    pub ssl: bool,
    /// 可选子路径
    #[serde(default)]
    pub path: Option<String>,
    /// 可选展示标题
    #[serde(default)]
    pub title: Option<String>,
    /// UI 提示：重写页面内链接
    #[serde(default)]
    pub rewrite_links: bool,
    /// UI 提示：限制访问路径
    #[serde(default)]
    pub restrict_path: bool,
    /// UI 提示：同步浏览
    #[serde(default)]
    pub synchronize: bool,
}

impl ForwardDescriptor {
    /// 由子域名和本地目标构造
    pub fn new(subdomain: impl Into<String>, target: ForwardTarget) -> Self {
        Self {
            subdomain: subdomain.into(),
            private_host: target.private_host,
            private_port: target.private_port,
            ssl: target.ssl,
            path: target.path,
            title: None,
            rewrite_links: false,
            restrict_path: false,
            synchronize: false,
        }
    }

    /// 完整公网地址：`{protocol}://{subdomain}.{domain}{suffix}[/path]`
    pub fn public_url(&self, domain: &str, protocol: &str, suffix: &str) -> String {
        let base = format!("{}://{}.{}{}", protocol, self.subdomain, domain, suffix);
        match self.path.as_deref() {
            Some(p) if !p.is_empty() => format!("{}/{}", base, p.trim_start_matches('/')),
            _ => base,
        }
    }

    /// 短地址：`{subdomain}.{domain}`
    pub fn short_url(&self, domain: &str) -> String {
        format!("{}.{}", self.subdomain, domain)
    }
}

/// 解析后的本地目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub private_host: String,
    pub private_port: u16,
    pub ssl: bool,
    pub path: Option<String>,
}

impl ForwardTarget {
    /// 解析本地目标字符串
    ///
    /// 接受 `https://host:port/path`、`host:port` 或裸 `host` 三种写法。
    /// http 明确指到 443 或 https 指到 80 视为配置矛盾，拒绝
    pub fn parse(input: &str) -> Result<Self> {
        if input.starts_with("http://") || input.starts_with("https://") {
            let url = url::Url::parse(input)
                .map_err(|e| TunnelError::config_error(format!("invalid target '{input}': {e}")))?;
            let ssl = url.scheme() == "https";
            let host = url
                .host_str()
                .ok_or_else(|| {
                    TunnelError::config_error(format!("target '{input}' has no host"))
                })?
                .to_string();
            let port = url
                .port()
                .unwrap_or(if ssl { 443 } else { 80 });

            if (ssl && port == 80) || (!ssl && port == 443) {
                let expected = if ssl { "http" } else { "https" };
                return Err(TunnelError::config_error(format!(
                    "port {port} is assumed to be {expected}, but target '{input}' specifies {}",
                    url.scheme()
                )));
            }

            let path = match url.path().trim_start_matches('/') {
                "" => None,
                p => Some(p.to_string()),
            };

            Ok(Self {
                private_host: host,
                private_port: port,
                ssl,
                path,
            })
        } else {
            // 朴素 host[:port] 写法
            let (host, port_str) = match input.split_once(':') {
                Some((h, p)) => (h, Some(p)),
                None => (input, None),
            };
            if host.is_empty() {
                return Err(TunnelError::config_error(format!(
                    "please specify a host (input: '{input}')"
                )));
            }
            let port = match port_str {
                None => 80,
                Some(p) => p.parse::<u16>().map_err(|_| {
                    TunnelError::config_error(format!(
                        "'{p}' does not appear to be a valid port number"
                    ))
                })?,
            };
            Ok(Self {
                private_host: host.to_string(),
                private_port: port,
                ssl: port == 443,
                path: None,
            })
        }
    }
}

/// 一条远端隧道连接的身份与拓扑
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    /// 连接 ID（控制面分配）
    pub id: String,
    /// 隧道服务器主机
    pub host: String,
    /// 隧道服务器端口
    pub port: u16,
    /// 凭据：用户名
    #[serde(default)]
    pub user: Option<String>,
    /// 凭据：密钥或令牌
    #[serde(default)]
    pub key: Option<String>,
    /// 分配的公网域名
    pub domain: String,
    /// 分配的转发列表
    #[serde(default)]
    pub forwards: Vec<ForwardDescriptor>,
    /// 服务端指定的转发端口（远端口转发型传输使用）
    #[serde(default)]
    pub forward_port: Option<u16>,
}

impl ConnectionDescriptor {
    /// 构建子域名到转发的只读查找表（构造一次，此后只读）
    pub fn forward_map(&self) -> HashMap<String, ForwardDescriptor> {
        self.forwards
            .iter()
            .map(|f| (f.subdomain.clone(), f.clone()))
            .collect()
    }
}
