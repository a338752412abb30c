use anyhow::Context;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 数据目录（本地路径或 `s3://bucket/prefix`）
pub const ENV_DATA_FOLDER: &str = "TRAINLOOP_DATA_FOLDER";
/// 逗号分隔的主机白名单
pub const ENV_HOST_ALLOWLIST: &str = "TRAINLOOP_HOST_ALLOWLIST";
pub const ENV_LOG_LEVEL: &str = "TRAINLOOP_LOG_LEVEL";
pub const ENV_FLUSH_IMMEDIATELY: &str = "TRAINLOOP_FLUSH_IMMEDIATELY";
/// 未显式传入配置路径时使用
pub const ENV_CONFIG_PATH: &str = "TRAINLOOP_CONFIG_PATH";

pub const CONFIG_FILE_NAME: &str = "trainloop.config.yaml";

/// 内置默认主机白名单
pub const DEFAULT_HOST_ALLOWLIST: &[&str] = &[
    "api.openai.com",
    "api.anthropic.com",
    "generativelanguage.googleapis.com",
    "api.mistral.ai",
    "api.groq.com",
];

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    #[default]
    Warn,
    Error,
}

impl LogLevel {
    /// 大小写不敏感解析，未知值返回 None
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Some(Self::Debug),
            "INFO" => Some(Self::Info),
            "WARN" | "WARNING" => Some(Self::Warn),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    /// tracing 过滤器使用的级别名
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// 配置文件中 `trainloop:` 段
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub data_folder: Option<String>,
    #[serde(default)]
    pub host_allowlist: Option<Vec<String>>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub flush_immediately: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    trainloop: Option<FileConfig>,
}

/// 进程级 Agent 配置
///
/// 优先级：环境变量 > 配置文件 > 内置默认值
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// 未解析出数据目录时 Agent 处于禁用状态
    pub data_folder: Option<String>,

    pub host_allowlist: Vec<String>,

    pub log_level: LogLevel,

    /// 默认 true：每次记录立即落盘，优先保证持久性
    pub flush_immediately: bool,

    /// 实际读取的配置文件路径（运行时元数据）
    config_path: Option<PathBuf>,

    /// 日志级别是否来自 `TRAINLOOP_LOG_LEVEL`
    log_level_from_env: bool,

    /// 解析过程中的告警，日志初始化后再输出
    warnings: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_folder: None,
            host_allowlist: default_host_allowlist(),
            log_level: LogLevel::default(),
            flush_immediately: true,
            config_path: None,
            log_level_from_env: false,
            warnings: Vec::new(),
        }
    }
}

fn default_host_allowlist() -> Vec<String> {
    DEFAULT_HOST_ALLOWLIST.iter().map(|h| h.to_string()).collect()
}

/// 进程内已发布的配置
static CURRENT: RwLock<Option<Config>> = RwLock::new(None);

/// 发布解析后的配置，供其它组件读取
pub fn publish(config: &Config) {
    *CURRENT.write() = Some(config.clone());
}

/// 获取当前已发布的配置
pub fn current() -> Option<Config> {
    CURRENT.read().clone()
}

impl Config {
    /// 基于进程环境与当前工作目录解析配置
    pub fn resolve(explicit_path: Option<&Path>) -> Self {
        let (cwd, cwd_warning) = match std::env::current_dir() {
            Ok(cwd) => (cwd, None),
            Err(e) => (PathBuf::from("."), Some(format!("获取当前工作目录失败: {}", e))),
        };
        let mut config = Self::resolve_with(explicit_path, |key| std::env::var(key).ok(), &cwd);
        config.warnings.extend(cwd_warning);
        config
    }

    /// 解析配置（环境变量来源可注入）
    ///
    /// 已设置的环境变量原样使用，不会被配置文件覆盖
    pub fn resolve_with<F>(explicit_path: Option<&Path>, env: F, cwd: &Path) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());
        let mut warnings = Vec::new();

        let env_data_folder = env(ENV_DATA_FOLDER);
        let env_allowlist = env(ENV_HOST_ALLOWLIST).map(|v| parse_host_list(&v)).filter(|h| !h.is_empty());
        let env_log_level = env(ENV_LOG_LEVEL).and_then(|v| {
            let level = LogLevel::parse(&v);
            if level.is_none() {
                warnings.push(format!("无效的 {} '{}'，忽略", ENV_LOG_LEVEL, v));
            }
            level
        });
        let env_flush = env(ENV_FLUSH_IMMEDIATELY).and_then(|v| {
            let flag = parse_bool(&v);
            if flag.is_none() {
                warnings.push(format!("无效的 {} '{}'，忽略", ENV_FLUSH_IMMEDIATELY, v));
            }
            flag
        });

        let all_from_env = env_data_folder.is_some()
            && env_allowlist.is_some()
            && env_log_level.is_some()
            && env_flush.is_some();

        let (file, config_path) = if all_from_env {
            tracing::debug!("所有配置均来自环境变量，跳过配置文件");
            (FileConfig::default(), None)
        } else {
            let source = explicit_path
                .map(Path::to_path_buf)
                .or_else(|| env(ENV_CONFIG_PATH).map(PathBuf::from));
            let path = locate_config_file(source.as_deref(), cwd);
            match FileConfig::load(&path) {
                Ok(Some(file)) => {
                    tracing::debug!(path = %path.display(), "已加载配置文件");
                    (file, Some(path))
                }
                Ok(None) => {
                    tracing::debug!(path = %path.display(), "配置文件不存在");
                    (FileConfig::default(), None)
                }
                Err(e) => {
                    warnings.push(format!("读取配置文件失败 {}: {:#}", path.display(), e));
                    (FileConfig::default(), None)
                }
            }
        };

        let data_folder = env_data_folder.or_else(|| {
            file.data_folder
                .as_deref()
                .filter(|d| !d.trim().is_empty())
                .map(|d| resolve_data_folder(d, config_path.as_deref(), cwd))
        });

        let host_allowlist = env_allowlist
            .or_else(|| {
                file.host_allowlist
                    .as_ref()
                    .map(|hosts| normalize_hosts(hosts.iter().map(String::as_str)))
                    .filter(|h| !h.is_empty())
            })
            .unwrap_or_else(default_host_allowlist);

        let log_level_from_env = env_log_level.is_some();
        let log_level = env_log_level
            .or_else(|| {
                let raw = file.log_level.as_deref()?;
                let level = LogLevel::parse(raw);
                if level.is_none() {
                    warnings.push(format!("配置文件中无效的 log_level '{}'，忽略", raw));
                }
                level
            })
            .unwrap_or_default();

        let flush_immediately = env_flush.or(file.flush_immediately).unwrap_or(true);

        Self {
            data_folder,
            host_allowlist,
            log_level,
            flush_immediately,
            config_path,
            log_level_from_env,
            warnings,
        }
    }

    /// 是否解析出了数据目录
    pub fn is_enabled(&self) -> bool {
        self.data_folder.is_some()
    }

    /// 获取配置文件路径（如果有）
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn log_level_from_env(&self) -> bool {
        self.log_level_from_env
    }

    /// 解析时被忽略的无效来源
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

impl FileConfig {
    /// 读取 YAML 配置文件，文件不存在时返回 None
    pub fn load(path: &Path) -> anyhow::Result<Option<Self>> {
        if !path.is_file() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        if content.trim().is_empty() {
            return Ok(Some(Self::default()));
        }
        let parsed: ConfigFile = serde_yaml::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
        Ok(Some(parsed.trainloop.unwrap_or_default()))
    }
}

/// 确定配置文件路径
///
/// 显式路径（可以是目录）优先；否则依次尝试 `<cwd>/trainloop/` 和 `<cwd>/`
fn locate_config_file(source: Option<&Path>, cwd: &Path) -> PathBuf {
    if let Some(source) = source {
        let path = if source.is_absolute() {
            source.to_path_buf()
        } else {
            cwd.join(source)
        };
        if path.is_dir() {
            return path.join(CONFIG_FILE_NAME);
        }
        return path;
    }

    let nested = cwd.join("trainloop").join(CONFIG_FILE_NAME);
    if nested.is_file() {
        return nested;
    }
    cwd.join(CONFIG_FILE_NAME)
}

/// 配置文件中的相对数据目录相对于配置文件所在目录解析
fn resolve_data_folder(data_folder: &str, config_path: Option<&Path>, cwd: &Path) -> String {
    if data_folder.contains("://") {
        return data_folder.to_string();
    }
    let path = Path::new(data_folder);
    if path.is_absolute() {
        return data_folder.to_string();
    }
    let base = config_path
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| cwd.to_path_buf());
    let base = if base.is_absolute() { base } else { cwd.join(base) };
    base.join(path).to_string_lossy().into_owned()
}

fn parse_host_list(raw: &str) -> Vec<String> {
    normalize_hosts(raw.split(','))
}

fn normalize_hosts<'a>(hosts: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for host in hosts {
        let host = host.trim().to_ascii_lowercase();
        if !host.is_empty() && !out.contains(&host) {
            out.push(host);
        }
    }
    out
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
