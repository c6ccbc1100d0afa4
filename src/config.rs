/// 客户端配置
///
/// TOML 文件加载，带字段级默认值与加载后校验
use crate::transport::TransportKind;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// 控制面 API 端点
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API 基地址
    pub url: String,
    /// 路径前缀（例如 /v1）
    #[serde(default)]
    pub path: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: "https://api.example.com".to_string(),
            path: String::new(),
        }
    }
}

/// 公网地址拼装参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicConfig {
    /// 公网协议（http 或 https）
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// 域名后缀（例如非标准端口 ":8000"）
    #[serde(default)]
    pub suffix: String,
}

fn default_protocol() -> String {
    "https".to_string()
}

impl Default for PublicConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            suffix: String::new(),
        }
    }
}

/// 客户端完整配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// 控制面端点
    #[serde(default)]
    pub api: ApiConfig,
    /// 公网地址参数
    #[serde(default)]
    pub public: PublicConfig,
    /// 传输变体
    #[serde(default)]
    pub transport: TransportKind,
    /// 空闲看门狗超时（毫秒）；缺省不启用
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
    /// 重试次数预算
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    /// 优雅关闭宽限（毫秒），超时强制销毁隧道
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
    /// 跳过服务器证书验证（仅用于测试）
    #[serde(default)]
    pub skip_verify: bool,
    /// 自定义 CA 证书路径
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
}

fn default_retry_budget() -> u32 {
    120
}

fn default_close_grace_ms() -> u64 {
    5000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            public: PublicConfig::default(),
            transport: TransportKind::default(),
            idle_timeout_ms: None,
            retry_budget: default_retry_budget(),
            close_grace_ms: default_close_grace_ms(),
            skip_verify: false,
            ca_cert_path: None,
        }
    }
}

impl ClientConfig {
    /// 从文件加载配置
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration from {}", path))?;
        let config: ClientConfig =
            toml::from_str(&content).context("Failed to parse client configuration")?;
        config
            .validate()
            .context("Configuration validation failed")?;
        Ok(config)
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> anyhow::Result<()> {
        url::Url::parse(&self.api.url)
            .with_context(|| format!("Invalid API url '{}'", self.api.url))?;

        if self.public.protocol != "http" && self.public.protocol != "https" {
            anyhow::bail!(
                "Unsupported public protocol '{}': expected http or https",
                self.public.protocol
            );
        }

        if self.retry_budget == 0 {
            anyhow::bail!("retry_budget cannot be 0");
        }

        Ok(())
    }

    /// 空闲看门狗超时
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    /// 优雅关闭宽限
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.public.protocol, "https");
        assert_eq!(config.retry_budget, 120);
        assert_eq!(config.close_grace_ms, 5000);
        assert_eq!(config.transport, TransportKind::Tls);
        assert!(config.idle_timeout().is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_minimal_toml() {
        let raw = r#"
            [api]
            url = "https://api.tunnel.test"
            path = "/v1"
        "#;
        let config: ClientConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.api.url, "https://api.tunnel.test");
        assert_eq!(config.api.path, "/v1");
        assert_eq!(config.public.protocol, "https");
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_full_toml() {
        let raw = r#"
            transport = "wss"
            idle_timeout_ms = 30000
            retry_budget = 5
            skip_verify = true

            [api]
            url = "http://127.0.0.1:4000"

            [public]
            protocol = "http"
            suffix = ":8000"
        "#;
        let config: ClientConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.transport, TransportKind::Wss);
        assert_eq!(config.idle_timeout(), Some(Duration::from_millis(30000)));
        assert_eq!(config.retry_budget, 5);
        assert!(config.skip_verify);
        assert_eq!(config.public.suffix, ":8000");
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_protocol() {
        let config = ClientConfig {
            public: PublicConfig {
                protocol: "gopher".to_string(),
                suffix: String::new(),
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_url() {
        let config = ClientConfig {
            api: ApiConfig {
                url: "not a url".to_string(),
                path: String::new(),
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_budget() {
        let config = ClientConfig {
            retry_budget: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
