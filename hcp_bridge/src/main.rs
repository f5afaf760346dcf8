use std::sync::Arc;

use hcp_bridge::config::{self, AppConfig};
use hcp_bridge::device::list_ports;
use hcp_bridge::hardware::HardwareRegistry;
use hcp_bridge::ws_server::connection_manager::ConnectionManager;
use hcp_bridge::ws_server::device_session_manager::DeviceSessionManager;
use hcp_bridge::ws_server::service::WsService;
use log::{error, info, warn, LevelFilter};

#[tokio::main]
async fn main() {
    // 默认 Info 级别，可通过 RUST_LOG 覆盖
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_millis()
        .init();
    info!("[主程序] 日志系统已成功初始化 (env_logger)，默认级别: Info。");

    config::init_config();
    let app_config = config::get_config();
    info!(
        "[主程序] 应用配置已加载。WebSocket 服务地址: {}",
        app_config.websocket.listen_addr()
    );

    let registry = HardwareRegistry::with_builtin();
    for descriptor in registry.list() {
        info!(
            "[主程序] 已注册硬件: {} ({}), 波特率 {}",
            descriptor.hw_id, descriptor.name, descriptor.baud_rate
        );
    }
    let device_manager = Arc::new(DeviceSessionManager::new(registry));

    match list_ports() {
        Ok(ports) if ports.is_empty() => info!("[主程序] 未发现可用串口。"),
        Ok(ports) => {
            for port in ports {
                info!("[主程序] 发现串口: {} ({})", port.path, port.description);
            }
        }
        Err(e) => warn!("[主程序] 枚举串口失败: {}", e),
    }

    apply_hardware_selection(&device_manager, app_config).await;

    let connection_manager = Arc::new(ConnectionManager::new());
    let ws_service = WsService::new(
        app_config.websocket.clone(),
        app_config.device.open_wait_timeout(),
        connection_manager,
        device_manager.clone(),
    );

    info!("[主程序] 正在启动 WebSocket 服务...");
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("[主程序] 监听 Ctrl-C 信号失败: {}", e);
            std::future::pending::<()>().await;
        }
        info!("[主程序] 收到 Ctrl-C，准备退出。");
    };
    if let Err(e) = ws_service.start(shutdown).await {
        error!("[主程序] 致命错误：启动 WebSocket 服务时发生严重问题: {:#}", e);
    }

    device_manager.shutdown().await;
    info!("[主程序] 已退出。");
}

/// 按配置选择硬件并打开串口；失败只记录日志，服务照常启动。
async fn apply_hardware_selection(device_manager: &DeviceSessionManager, app_config: &AppConfig) {
    let Some(hw_id) = app_config.hardware.hw_id.as_deref() else {
        info!("[主程序] 配置中未指定硬件，等待手动选择。");
        return;
    };
    if let Err(e) = device_manager.select_hardware(hw_id).await {
        error!("[主程序] 选择硬件 {} 失败: {}", hw_id, e);
        return;
    }
    let Some(port_path) = app_config.hardware.port_path.as_deref() else {
        info!("[主程序] 已选择硬件 {}，配置中未指定串口。", hw_id);
        return;
    };
    match device_manager.open(port_path).await {
        Ok(device) => info!("[主程序] 已打开串口 {} (硬件 {})", device.path(), hw_id),
        Err(e) => error!("[主程序] 打开串口 {} 失败: {}", port_path, e),
    }
}
