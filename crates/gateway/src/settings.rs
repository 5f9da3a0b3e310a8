use courier_broker::{BrokerChannel, FnHandler};
use courier_domain::Operation;
use courier_errors::{CourierError, CourierResult};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// 平台运行设置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformSettings {
    /// 账本操作员账号，形如 `0.0.1001`
    pub operator_id: String,
    /// 操作员私钥，响应中脱敏
    pub operator_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSettingsRequest {
    pub operator_id: String,
    pub operator_key: String,
}

/// 设置服务
///
/// 经broker对外提供`get-settings`/`update-settings`/
/// `get-environment`三个操作，网关HTTP层只做透传。
pub struct SettingsService {
    environment: String,
    settings: RwLock<Option<PlatformSettings>>,
}

impl SettingsService {
    pub fn new(environment: &str) -> Arc<Self> {
        Arc::new(Self {
            environment: environment.to_string(),
            settings: RwLock::new(None),
        })
    }

    /// 注册broker请求处理器
    pub async fn register(self: &Arc<Self>, channel: &Arc<BrokerChannel>) -> CourierResult<()> {
        let service = Arc::clone(self);
        channel
            .respond(
                Operation::GetSettings,
                Arc::new(FnHandler(move |_payload| {
                    let service = Arc::clone(&service);
                    async move {
                        let settings = service.settings.read().await;
                        match settings.as_ref() {
                            Some(s) => Ok(json!({
                                "operatorId": s.operator_id,
                                // 私钥不离开设置服务
                                "operatorKeySet": true,
                            })),
                            None => Ok(json!({"operatorId": null, "operatorKeySet": false})),
                        }
                    }
                })),
            )
            .await?;

        let service = Arc::clone(self);
        channel
            .respond(
                Operation::UpdateSettings,
                Arc::new(FnHandler(move |payload| {
                    let service = Arc::clone(&service);
                    async move {
                        let request: UpdateSettingsRequest = serde_json::from_value(payload)
                            .map_err(|e| {
                                CourierError::validation(format!("设置请求格式无效: {e}"))
                            })?;
                        validate_operator_id(&request.operator_id)?;
                        if request.operator_key.trim().is_empty() {
                            return Err(CourierError::validation("OPERATOR_KEY不能为空"));
                        }

                        *service.settings.write().await = Some(PlatformSettings {
                            operator_id: request.operator_id.clone(),
                            operator_key: request.operator_key,
                        });
                        info!("平台设置已更新，操作员 {}", request.operator_id);
                        Ok(json!({"updated": true}))
                    }
                })),
            )
            .await?;

        let service = Arc::clone(self);
        channel
            .respond(
                Operation::GetEnvironment,
                Arc::new(FnHandler(move |_payload| {
                    let service = Arc::clone(&service);
                    async move { Ok(json!(service.environment)) }
                })),
            )
            .await?;

        Ok(())
    }
}

/// 操作员账号格式：`shard.realm.num`
fn validate_operator_id(id: &str) -> CourierResult<()> {
    let ok = {
        let parts: Vec<&str> = id.split('.').collect();
        parts.len() == 3 && parts.iter().all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
    };
    if ok {
        Ok(())
    } else {
        Err(CourierError::validation(format!(
            "OPERATOR_ID格式无效: {id}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_broker::{InMemoryBus, MessageBus};
    use std::time::Duration;

    async fn setup() -> (Arc<BrokerChannel>, Arc<BrokerChannel>) {
        let bus = Arc::new(InMemoryBus::new());
        let service_channel = BrokerChannel::new(
            bus.clone() as Arc<dyn MessageBus>,
            "courier",
            "settings-1",
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let client = BrokerChannel::new(
            bus as Arc<dyn MessageBus>,
            "courier",
            "client-1",
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        (service_channel, client)
    }

    #[tokio::test]
    async fn test_settings_round_trip_masks_key() {
        let (service_channel, client) = setup().await;
        let service = SettingsService::new("testnet");
        service.register(&service_channel).await.unwrap();

        let empty = client
            .request(Operation::GetSettings, json!({}), None)
            .await
            .unwrap();
        assert_eq!(empty["operatorKeySet"], false);

        client
            .request(
                Operation::UpdateSettings,
                json!({"operatorId": "0.0.1001", "operatorKey": "302e0201..."}),
                None,
            )
            .await
            .unwrap();

        let loaded = client
            .request(Operation::GetSettings, json!({}), None)
            .await
            .unwrap();
        assert_eq!(loaded["operatorId"], "0.0.1001");
        assert_eq!(loaded["operatorKeySet"], true);
        // 私钥绝不回传
        assert!(loaded.get("operatorKey").is_none());
    }

    #[tokio::test]
    async fn test_invalid_operator_id_is_rejected() {
        let (service_channel, client) = setup().await;
        let service = SettingsService::new("testnet");
        service.register(&service_channel).await.unwrap();

        let err = client
            .request(
                Operation::UpdateSettings,
                json!({"operatorId": "not-an-id", "operatorKey": "k"}),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CourierError::Validation(_)));
    }

    #[tokio::test]
    async fn test_environment_query() {
        let (service_channel, client) = setup().await;
        let service = SettingsService::new("mainnet");
        service.register(&service_channel).await.unwrap();

        let env = client
            .request(Operation::GetEnvironment, json!({}), None)
            .await
            .unwrap();
        assert_eq!(env, json!("mainnet"));
    }

    #[test]
    fn test_operator_id_validation() {
        assert!(validate_operator_id("0.0.1001").is_ok());
        assert!(validate_operator_id("10.2.33").is_ok());
        assert!(validate_operator_id("0.0").is_err());
        assert!(validate_operator_id("a.b.c").is_err());
        assert!(validate_operator_id("0..1").is_err());
    }
}
