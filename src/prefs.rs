/// 用户偏好
///
/// 认证密钥与常用转发的本地持久化。路径可用环境变量覆盖，
/// 缺省落在用户配置目录下
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 偏好文件路径的环境变量覆盖
pub const ENV_CONFIG_PATH: &str = "REV_TUNNEL_CONFIG";

const DEFAULT_PATH: &str = "~/.config/rev-tunnel/prefs.toml";

/// 一条保存的转发声明
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedForward {
    pub subdomain: String,
    /// 本地目标字符串（forward 命令的写法）
    pub target: String,
}

/// 用户偏好
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Preferences {
    /// 认证密钥（auth 命令写入）
    #[serde(default)]
    pub key: Option<String>,
    /// 常用转发
    #[serde(default)]
    pub forwards: Vec<SavedForward>,
}

/// 偏好文件路径：环境变量优先，否则按用户目录展开
pub fn default_path() -> PathBuf {
    if let Ok(path) = std::env::var(ENV_CONFIG_PATH) {
        return PathBuf::from(path);
    }
    PathBuf::from(shellexpand::tilde(DEFAULT_PATH).into_owned())
}

impl Preferences {
    /// 加载偏好；文件不存在时返回空偏好
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read preferences from {:?}", path))?;
        toml::from_str(&content).context("Failed to parse preferences")
    }

    /// 保存偏好，按需建目录
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory {:?}", dir))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to encode preferences")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write preferences to {:?}", path))?;
        Ok(())
    }
}
