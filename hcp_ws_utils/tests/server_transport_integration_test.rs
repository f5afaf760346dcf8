// hcp_ws_utils/tests/server_transport_integration_test.rs

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use hcp_ws_utils::client::transport::connect_client;
use hcp_ws_utils::error::WsError;
use hcp_ws_utils::io::{receive_packet, send_packet};
use hcp_ws_utils::packet::Packet;
use hcp_ws_utils::server::transport::{ServerTransport, WsStream};
use log::{LevelFilter, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message as TungsteniteMessage;

fn init_test_logger() {
    let _ = env_logger::builder().filter_level(LevelFilter::Info).is_test(true).try_init();
}

/// 测试用连接处理：把收到的每条报文原样回显；解析失败的帧记为一次错误并继续。
async fn echo_handler(ws_stream: WsStream, peer_addr: SocketAddr, parse_errors: mpsc::UnboundedSender<SocketAddr>) {
    info!("[Test Server] 新连接: {}", peer_addr);
    let (mut sender, mut receiver) = ws_stream.split();
    loop {
        match receive_packet(&mut receiver).await {
            Some(Ok(packet)) => {
                if send_packet(&mut sender, &packet).await.is_err() {
                    warn!("[Test Server] 向 {} 回显失败", peer_addr);
                    break;
                }
            }
            Some(Err(WsError::Parse(e))) => {
                info!("[Test Server] 丢弃无效报文: {}", e);
                let _ = parse_errors.send(peer_addr);
            }
            Some(Err(e)) => {
                warn!("[Test Server] 连接错误: {}", e);
                break;
            }
            None => break,
        }
    }
}

async fn start_echo_server() -> (SocketAddr, oneshot::Sender<()>, mpsc::UnboundedReceiver<SocketAddr>) {
    let transport = ServerTransport::bind("127.0.0.1:0").await.expect("无法绑定到随机端口");
    let addr = transport.local_addr();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let (err_tx, err_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let on_connect = move |ws_stream: WsStream, peer_addr: SocketAddr| {
            echo_handler(ws_stream, peer_addr, err_tx.clone())
        };
        transport
            .serve(on_connect, async move {
                let _ = stop_rx.await;
            })
            .await;
    });
    (addr, stop_tx, err_rx)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_server_echoes_packets_to_client() {
    init_test_logger();
    let (addr, stop_tx, _err_rx) = start_echo_server().await;

    let mut client = connect_client(&format!("ws://{}", addr)).await.expect("客户端连接失败");
    let packet = Packet::new("hw", "control")
        .with_header("requestId", "r1")
        .with_header("hwId", "sensor_board")
        .with_json_body(&serde_json::json!({"cmd": "stop", "args": []}))
        .unwrap();
    client.send_packet(&packet).await.expect("发送报文失败");

    let echoed = timeout(Duration::from_secs(5), client.receive_packet())
        .await
        .expect("等待回显超时")
        .expect("连接意外关闭")
        .expect("回显报文解析失败");
    assert_eq!(echoed.channel_id, "hw");
    assert_eq!(echoed.proc_name, "control");
    assert_eq!(echoed.request_id(), Some("r1"));
    assert_eq!(echoed.body, packet.body);

    client.close().await.expect("关闭连接失败");
    let _ = stop_tx.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
/// 无效帧只会被丢弃，同一连接上随后的合法报文照常处理。
async fn test_malformed_frame_does_not_break_connection() {
    init_test_logger();
    let (addr, stop_tx, mut err_rx) = start_echo_server().await;

    let mut client = connect_client(&format!("ws://{}", addr)).await.expect("客户端连接失败");
    client
        .ws_sender
        .send(TungsteniteMessage::Text("no separator here".to_string()))
        .await
        .unwrap();

    let peer = timeout(Duration::from_secs(5), err_rx.recv()).await.expect("服务端未报告解析错误");
    assert!(peer.is_some());

    let hello = Packet::new("meta", "hello");
    client.send_packet(&hello).await.unwrap();
    let echoed = timeout(Duration::from_secs(5), client.receive_packet())
        .await
        .expect("等待回显超时")
        .expect("连接意外关闭")
        .unwrap();
    assert_eq!(echoed.proc_name, "hello");

    let _ = stop_tx.send(());
}
