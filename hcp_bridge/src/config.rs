use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// WebSocket 服务的默认主机地址（只对本机开放）
pub const DEFAULT_WS_HOST: &str = "127.0.0.1";
/// WebSocket 服务的默认端口号
pub const DEFAULT_WS_PORT: u16 = 23518;
/// 控制命令等待设备打开的默认超时（毫秒）
pub const DEFAULT_OPEN_WAIT_TIMEOUT_MS: u64 = 7000;

/// 配置文件名
const CONFIG_FILE_NAME: &str = "app_settings.json";

/// WebSocket 服务端配置结构体
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct WebSocketConfig {
    /// WebSocket 服务绑定的主机地址
    pub host: String,
    /// WebSocket 服务监听的端口号
    pub port: u16,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_WS_HOST.to_string(),
            port: DEFAULT_WS_PORT,
        }
    }
}

impl WebSocketConfig {
    /// 监听地址，例如 `127.0.0.1:23518`
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// 串口设备相关配置
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    /// `hw,control` 在转发命令前等待设备进入 Opened 的最长时间（毫秒）
    pub open_wait_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            open_wait_timeout_ms: DEFAULT_OPEN_WAIT_TIMEOUT_MS,
        }
    }
}

impl DeviceConfig {
    pub fn open_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.open_wait_timeout_ms)
    }
}

/// 启动时默认选中的硬件与串口。
///
/// 两项都为空时，服务启动后不绑定任何硬件，所有 `hw,control` 都会以
/// `hardware connect fail(1)` 失败，直到通过宿主界面选择硬件。
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct HardwareConfig {
    /// 注册表中的硬件 ID，例如 `"sensor_board"`
    #[serde(default)]
    pub hw_id: Option<String>,
    /// 串口路径，例如 `"/dev/ttyUSB0"` 或 `"COM3"`
    #[serde(default)]
    pub port_path: Option<String>,
}

/// 应用的主配置结构体
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct AppConfig {
    /// WebSocket 服务的相关配置
    #[serde(default)]
    pub websocket: WebSocketConfig,
    /// 串口设备的相关配置
    #[serde(default)]
    pub device: DeviceConfig,
    /// 启动时的硬件选择
    #[serde(default)]
    pub hardware: HardwareConfig,
}

// 全局静态应用配置实例
static APP_CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// 加载或创建应用配置文件
fn load_or_create_config() -> AppConfig {
    let config_file_path = get_config_file_path();
    load_or_create_config_at(&config_file_path)
}

/// 从指定路径加载配置；文件不存在或内容损坏时写入并返回默认配置。
pub fn load_or_create_config_at(config_file_path: &Path) -> AppConfig {
    match fs::read_to_string(config_file_path) {
        Ok(content) => match serde_json::from_str::<AppConfig>(&content) {
            Ok(config) => {
                info!("[配置模块] 已成功从配置文件 {:?} 加载应用配置。", config_file_path);
                config
            }
            Err(e) => {
                warn!(
                    "[配置模块] 警告：从 {:?} 反序列化配置失败: {}. 文件可能已损坏。将使用默认配置并尝试覆盖。",
                    config_file_path, e
                );
                let default_config = AppConfig::default();
                save_config(&default_config, config_file_path);
                default_config
            }
        },
        Err(e) => {
            info!(
                "[配置模块] 未在 {:?} 找到配置文件或读取时发生错误 (错误: {}). 将使用默认配置并尝试创建新文件。",
                config_file_path, e
            );
            let default_config = AppConfig::default();
            save_config(&default_config, config_file_path);
            default_config
        }
    }
}

/// 获取配置文件路径
fn get_config_file_path() -> PathBuf {
    // 首先尝试当前目录
    let current_dir = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let config_file_path = current_dir.join(CONFIG_FILE_NAME);

    let current_dir_writable = fs::metadata(&current_dir)
        .map(|m| !m.permissions().readonly())
        .unwrap_or(false);
    if config_file_path.exists() || current_dir_writable {
        return config_file_path;
    }

    // 当前目录不可写时退回到用户目录
    if let Ok(home) = env::var("HOME") {
        return PathBuf::from(home).join(".config").join("hcp_bridge").join(CONFIG_FILE_NAME);
    } else if let Ok(userprofile) = env::var("USERPROFILE") {
        return PathBuf::from(userprofile)
            .join("AppData")
            .join("Local")
            .join("hcp_bridge")
            .join(CONFIG_FILE_NAME);
    }

    config_file_path
}

/// 保存配置到文件
fn save_config(config: &AppConfig, path: &Path) {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!("[配置模块] 错误：创建配置目录 {:?} 失败: {}", parent, e);
                return;
            }
        }
    }

    match serde_json::to_string_pretty(config) {
        Ok(content) => {
            if let Err(e) = fs::write(path, content) {
                warn!("[配置模块] 错误：将配置写入文件 {:?} 时失败: {}", path, e);
            } else {
                info!("[配置模块] 已成功将当前配置保存到 {:?}.", path);
            }
        }
        Err(e) => {
            warn!("[配置模块] 错误：序列化配置信息以便保存时失败: {}", e);
        }
    }
}

/// 初始化全局应用配置
pub fn init_config() {
    let loaded_config = load_or_create_config();
    if APP_CONFIG.set(loaded_config).is_err() {
        warn!("[配置模块] 全局应用配置 APP_CONFIG 已被初始化，本次 init_config 调用未覆盖已有配置。请检查初始化流程。");
    }
    info!("[配置模块] 应用配置已成功初始化完毕。");
}

/// 获取全局应用配置；尚未初始化时按需加载。
pub fn get_config() -> &'static AppConfig {
    APP_CONFIG.get_or_init(load_or_create_config)
}
