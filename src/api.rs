/// 控制面 API 客户端
///
/// 与数据通道分离的 HTTP 控制面：创建/删除/更新连接、心跳校验、账号操作。
/// 认证密钥通过 HTTP Basic 头携带；POST/PUT 使用 JSON 请求体，GET/DELETE 使用查询串
use crate::config::ApiConfig;
use crate::descriptor::{ConnectionDescriptor, ForwardDescriptor};
use crate::error::{Result, TunnelError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// 删除连接时上报的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeleteReason {
    /// 用户主动断开
    Disconnect,
    /// 空闲超时断开
    Timeout,
    /// 连接级错误后的清理
    ConnectionError,
    /// 未知原因的清理
    UnknownError,
}

impl DeleteReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeleteReason::Disconnect => "disconnect",
            DeleteReason::Timeout => "timeout",
            DeleteReason::ConnectionError => "connection-error",
            DeleteReason::UnknownError => "unknown-error",
        }
    }
}

impl std::fmt::Display for DeleteReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 心跳校验应答类型
///
/// 封闭枚举：仅 ping 与 disconnect 两种已知语义，其余归入 Unknown 记录后忽略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PingReplyType {
    /// 普通保活
    Ping,
    /// 服务端已吊销本连接
    Disconnect,
    /// 未识别的类型
    #[serde(other)]
    Unknown,
}

/// 心跳校验应答
#[derive(Debug, Clone, Deserialize)]
pub struct PingReply {
    #[serde(rename = "type")]
    pub reply: PingReplyType,
}

/// 创建连接请求
#[derive(Debug, Clone, Serialize)]
pub struct CreateConnection {
    /// 客户端版本（API 握手的一部分）
    pub version: String,
    pub os_type: String,
    pub os_platform: String,
    pub os_arch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer_key: Option<String>,
    pub forwards: Vec<ForwardDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edgy: Option<bool>,
}

impl CreateConnection {
    /// 以本机指纹构造
    pub fn new(forwards: Vec<ForwardDescriptor>) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            os_type: std::env::consts::OS.to_string(),
            os_platform: std::env::consts::FAMILY.to_string(),
            os_arch: std::env::consts::ARCH.to_string(),
            consumer_key: None,
            forwards,
            edgy: None,
        }
    }
}

/// 创建连接应答
#[derive(Debug, Clone, Deserialize)]
pub struct CreateConnectionReply {
    pub connection: ConnectionDescriptor,
    #[serde(default)]
    pub warning: Option<String>,
}

/// 账号认证应答
#[derive(Debug, Clone, Deserialize)]
pub struct AuthReply {
    pub token: String,
}

/// 控制面客户端
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    base: String,
}

impl Client {
    /// 创建客户端（base = url + path 前缀）
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let base = format!(
            "{}{}",
            config.url.trim_end_matches('/'),
            config.path
        );
        debug!("API base path: {}", base);
        Ok(Self { http, base })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// POST /connections：创建隧道连接
    pub async fn create_connection(
        &self,
        request: &CreateConnection,
        key: &str,
    ) -> Result<CreateConnectionReply> {
        let resp = self
            .http
            .post(self.url("/connections"))
            .basic_auth(key, None::<&str>)
            .json(request)
            .send()
            .await?;
        expect_json(resp).await
    }

    /// DELETE /connections：拆除连接
    pub async fn delete_connection(
        &self,
        id: &str,
        reason: DeleteReason,
        key: &str,
    ) -> Result<()> {
        debug!("DELETE /connections id={} reason={}", id, reason);
        let resp = self
            .http
            .delete(self.url("/connections"))
            .basic_auth(key, None::<&str>)
            .query(&[("id", id), ("reason", reason.as_str())])
            .send()
            .await?;
        expect_success(resp).await
    }

    /// PUT /connections：更新连接参数
    pub async fn update_connection(
        &self,
        id: &str,
        params: &serde_json::Value,
        key: &str,
    ) -> Result<()> {
        let mut body = params.clone();
        if let Some(map) = body.as_object_mut() {
            map.insert("id".to_string(), serde_json::Value::String(id.to_string()));
        }
        let resp = self
            .http
            .put(self.url("/connections"))
            .basic_auth(key, None::<&str>)
            .json(&body)
            .send()
            .await?;
        expect_success(resp).await
    }

    /// GET /connections/ping：校验心跳令牌的真实语义
    pub async fn verify_ping(&self, ping_id: &str, key: &str) -> Result<PingReply> {
        let resp = self
            .http
            .get(self.url("/connections/ping"))
            .basic_auth(key, None::<&str>)
            .query(&[("pingId", ping_id)])
            .send()
            .await?;
        expect_json(resp).await
    }

    /// POST /auth：换取账号令牌
    pub async fn auth(&self, params: &serde_json::Value) -> Result<AuthReply> {
        let resp = self.http.post(self.url("/auth")).json(params).send().await?;
        expect_json(resp).await
    }

    /// POST /signup：注册账号
    pub async fn signup(&self, params: &serde_json::Value) -> Result<serde_json::Value> {
        let resp = self
            .http
            .post(self.url("/signup"))
            .json(params)
            .send()
            .await?;
        expect_json(resp).await
    }

    /// GET /details：以令牌换取账号概览
    pub async fn details(&self, key: &str) -> Result<serde_json::Value> {
        let resp = self
            .http
            .get(self.url("/details"))
            .basic_auth(key, None::<&str>)
            .send()
            .await?;
        expect_json(resp).await
    }
}

/// 校验状态码并解析 JSON 响应体
async fn expect_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let message = resp.text().await.unwrap_or_default();
        return Err(TunnelError::control_plane(
            Some(status.as_u16()),
            format!("unexpected status {status}: {message}"),
        ));
    }
    let body = resp.text().await?;
    serde_json::from_str(&body).map_err(|e| {
        TunnelError::control_plane(Some(status.as_u16()), format!("unparsable response: {e}"))
    })
}

/// 仅校验状态码，丢弃响应体
async fn expect_success(resp: reqwest::Response) -> Result<()> {
    let status = resp.status();
    if !status.is_success() {
        let message = resp.text().await.unwrap_or_default();
        return Err(TunnelError::control_plane(
            Some(status.as_u16()),
            format!("unexpected status {status}: {message}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_reason_wire_names() {
        assert_eq!(DeleteReason::Disconnect.as_str(), "disconnect");
        assert_eq!(DeleteReason::Timeout.as_str(), "timeout");
        assert_eq!(DeleteReason::ConnectionError.as_str(), "connection-error");
        assert_eq!(DeleteReason::UnknownError.as_str(), "unknown-error");

        let json = serde_json::to_string(&DeleteReason::ConnectionError).unwrap();
        assert_eq!(json, "\"connection-error\"");
    }

    #[test]
    fn test_ping_reply_parse() {
        let reply: PingReply = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(reply.reply, PingReplyType::Ping);

        let reply: PingReply = serde_json::from_str(r#"{"type":"disconnect"}"#).unwrap();
        assert_eq!(reply.reply, PingReplyType::Disconnect);

        let reply: PingReply = serde_json::from_str(r#"{"type":"resync"}"#).unwrap();
        assert_eq!(reply.reply, PingReplyType::Unknown);
    }

    #[test]
    fn test_create_connection_skips_empty_options() {
        let req = CreateConnection::new(vec![]);
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("consumer_key"));
        assert!(!json.contains("edgy"));
        assert!(json.contains("os_type"));
    }

    #[test]
    fn test_create_connection_reply_parse() {
        let raw = r#"{
            "connection": {
                "id": "c-42",
                "host": "broker.example.com",
                "port": 443,
                "domain": "example.com",
                "key": "secret",
                "forwards": [
                    {"subdomain": "app", "private_host": "127.0.0.1", "private_port": 3000}
                ]
            }
        }"#;
        let reply: CreateConnectionReply = serde_json::from_str(raw).unwrap();
        assert_eq!(reply.connection.id, "c-42");
        assert_eq!(reply.connection.forwards.len(), 1);
        assert!(reply.warning.is_none());
        assert!(!reply.connection.forwards[0].ssl);
    }
}
