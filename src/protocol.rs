/// 数据通道内联协议
///
/// 转发请求以原始 HTTP 前导开头（请求行 + 头部，CRLF 结尾，空行终止）。
/// 保留头：`x-subdomain` 为路由键，`x-ping-<连接ID>` 标记心跳帧。
/// 心跳帧内联应答，从不转发到本地服务
use std::collections::HashMap;

/// 路由键头名
pub const SUBDOMAIN_HEADER: &str = "x-subdomain";

/// 心跳头名前缀（后接连接 ID）
pub const PING_HEADER_PREFIX: &str = "x-ping-";

/// 心跳应答
pub const HEARTBEAT_ACK: &[u8] = b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n";

/// 指定连接的心跳头名
pub fn ping_header(connection_id: &str) -> String {
    format!("{PING_HEADER_PREFIX}{connection_id}")
}

/// 本地连接失败时的 500 应答（携带模板化 HTML 页面）
pub fn error_response(body: &str) -> String {
    format!(
        "HTTP/1.1 500 Internal Server Error\r\nConnection: close\r\nContent-Type: text/html; charset=utf8\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
}

/// 解析后的请求前导
///
/// 头名统一转为小写；格式损坏的行直接跳过而不报错
#[derive(Debug, Clone, Default)]
pub struct RequestPreamble {
    pub method: Option<String>,
    pub path: Option<String>,
    pub headers: HashMap<String, String>,
}

impl RequestPreamble {
    /// 从首块数据解析前导
    pub fn parse(raw: &str) -> Self {
        let mut preamble = Self::default();

        let mut lines = raw.split("\r\n");
        if let Some(head) = lines.next() {
            if let Some((method, path)) = parse_request_line(head) {
                preamble.method = Some(method.to_string());
                preamble.path = Some(path.to_string());
            }
        }

        for line in lines {
            // 空行之后是请求体
            if line.is_empty() {
                break;
            }
            let Some((name, value)) = line.split_once(": ") else {
                continue;
            };
            preamble.headers.insert(name.to_lowercase(), value.to_string());
        }

        preamble
    }

    /// 按小写头名取值
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// 路由子域名
    pub fn subdomain(&self) -> Option<&str> {
        self.header(SUBDOMAIN_HEADER)
    }

    /// 心跳令牌（仅当携带本连接的心跳头时）
    pub fn ping_token(&self, connection_id: &str) -> Option<&str> {
        self.header(&ping_header(connection_id))
    }
}

/// 解析请求行 `METHOD path HTTP/x.y`
fn parse_request_line(line: &str) -> Option<(&str, &str)> {
    let mut parts = line.splitn(3, ' ');
    let method = parts.next()?;
    let path = parts.next()?;
    let version = parts.next()?;

    if method.is_empty() || !method.chars().all(|c| c.is_ascii_uppercase()) {
        return None;
    }
    if !version.starts_with("HTTP/") {
        return None;
    }
    Some((method, path))
}
