/// 本地连接失败的错误页
///
/// 本地服务不可达时向公网访问者回一个模板化 HTML 页面，
/// 而不是让连接悬挂或无响应
use crate::error::LocalErrorKind;
use crate::protocol;

/// 渲染错误页 HTML
pub fn render(kind: LocalErrorKind) -> String {
    let title = kind.title();
    format!(
        "<!DOCTYPE html>\n<html>\n<head><title>{title}</title></head>\n<body>\n<h1>{title}</h1>\n<p>The tunnel is up, but the local service could not be reached.</p>\n</body>\n</html>\n"
    )
}

/// 完整的 500 应答（状态行 + 头 + 页面）
pub fn response_for(kind: LocalErrorKind) -> String {
    protocol::error_response(&render(kind))
}
