use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::notifier::Notifier;
use crate::routes::AppState;

/// 客户端经WS发送的指令
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ClientCommand {
    #[serde(rename_all = "camelCase")]
    Subscribe { task_id: Uuid },
    #[serde(rename_all = "camelCase")]
    Unsubscribe { task_id: Uuid },
}

pub async fn ws_upgrade(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.notifier))
}

async fn handle_socket(socket: WebSocket, notifier: Arc<Notifier>) {
    let (sender, receiver) = socket.split();
    run_socket(sender, receiver, notifier).await;
}

/// 单条WS连接的生命周期
///
/// 推送方向：任务更新序列化为JSON文本帧。接收方向：解析
/// subscribe/unsubscribe指令，无法解析的消息忽略。连接关闭时
/// 注销连接，其订阅全部消失。
async fn run_socket<S, R>(mut sender: S, mut receiver: R, notifier: Arc<Notifier>)
where
    S: Sink<Message> + Unpin + Send + 'static,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let (conn_id, mut updates) = notifier.register().await;

    let push_pump = tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            let text = match serde_json::to_string(&update) {
                Ok(t) => t,
                Err(e) => {
                    debug!("序列化任务更新失败: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                Ok(ClientCommand::Subscribe { task_id }) => {
                    notifier.subscribe(conn_id, task_id).await;
                }
                Ok(ClientCommand::Unsubscribe { task_id }) => {
                    notifier.unsubscribe(conn_id, task_id).await;
                }
                Err(e) => debug!("连接 {} 发来无法解析的指令: {}", conn_id, e),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    notifier.unregister(conn_id).await;
    push_pump.abort();
    info!("realtime连接 {} 关闭", conn_id);
}
