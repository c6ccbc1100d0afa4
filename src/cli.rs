use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "rev-tunnel")]
#[command(author, version, about = "Expose local services on public subdomains", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志级别 (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 注册转发并保持隧道在线
    Forward {
        /// 转发声明，形如 subdomain=host:port 或 subdomain=https://host:port/path；
        /// 缺省使用偏好文件里保存的转发
        forwards: Vec<String>,

        /// 认证密钥（缺省读取偏好文件）
        #[arg(short, long)]
        key: Option<String>,

        /// 配置文件路径
        #[arg(short, long)]
        config: Option<String>,

        /// 空闲看门狗超时（毫秒）
        #[arg(long, value_name = "MS")]
        timeout: Option<u64>,

        /// 传输变体 (tls, wss)
        #[arg(long)]
        transport: Option<String>,
    },
    /// 换取账号令牌并写入偏好
    Auth {
        #[arg(long)]
        email: String,

        #[arg(long)]
        password: String,

        /// 配置文件路径
        #[arg(short, long)]
        config: Option<String>,
    },
    /// 检查配置文件格式是否正确
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,
    },
    /// 生成自签名证书（本地 TLS 服务联调用）
    Cert {
        /// 证书输出路径（cert.pem）
        #[arg(long, default_value = "cert.pem", value_name = "PATH")]
        cert_out: String,

        /// 私钥输出路径（key.pem）
        #[arg(long, default_value = "key.pem", value_name = "PATH")]
        key_out: String,

        /// 证书的 Common Name
        #[arg(long, default_value = "localhost")]
        common_name: String,

        /// 证书的 SubjectAltName（用逗号分隔多个）
        #[arg(long, value_delimiter = ',', value_name = "DNS,...")]
        alt_names: Vec<String>,
    },
}
