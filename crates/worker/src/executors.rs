use async_trait::async_trait;
use chrono::Utc;
use courier_domain::Operation;
use courier_errors::{CourierError, CourierResult};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

/// 任务执行上下文
///
/// 携带任务id与进度上报通道。进度上报是fire-and-forget：
/// 发送失败静默忽略，不影响执行结果。
pub struct ExecutionContext {
    pub task_id: Uuid,
    progress_tx: mpsc::UnboundedSender<Value>,
}

impl ExecutionContext {
    pub fn new(task_id: Uuid, progress_tx: mpsc::UnboundedSender<Value>) -> Self {
        Self {
            task_id,
            progress_tx,
        }
    }

    /// 上报一次进度，载荷格式由操作自定义
    pub fn report_progress(&self, payload: Value) {
        let _ = self.progress_tx.send(payload);
    }
}

/// 操作执行器
///
/// 每个执行器处理一个[`Operation`]。错误用[`CourierError`]分类：
/// `Validation`不会被重试，`Transient`类错误按退避策略重试。
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    /// 本执行器处理的操作
    fn operation(&self) -> Operation;

    /// 执行一次操作，返回结果载荷
    async fn execute(&self, ctx: &ExecutionContext, payload: Value) -> CourierResult<Value>;
}

/// 账本客户端抽象
///
/// 封装对外部账本网络的提交。实现负责自身的网络I/O，
/// 瞬时故障用`Transient`报告以参与Worker的重试。
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn submit(&self, transaction: &Value) -> CourierResult<Value>;
}

/// 凭证签发执行器
///
/// 长耗时操作：校验输入、构造凭证文档、上报阶段性进度。
pub struct CredentialExecutor;

impl CredentialExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CredentialExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OperationExecutor for CredentialExecutor {
    fn operation(&self) -> Operation {
        Operation::IssueCredential
    }

    async fn execute(&self, ctx: &ExecutionContext, payload: Value) -> CourierResult<Value> {
        let subject = payload
            .get("subject")
            .and_then(|v| v.as_object())
            .ok_or_else(|| CourierError::validation("凭证请求缺少subject对象"))?
            .clone();
        let issuer = payload
            .get("issuer")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CourierError::validation("凭证请求缺少issuer"))?
            .to_string();

        ctx.report_progress(json!({"stage": "validated"}));

        // 文档组装是本地计算，让出一次调度点即可
        tokio::task::yield_now().await;
        let credential_id = Uuid::new_v4();
        let document = json!({
            "id": credential_id,
            "issuer": issuer,
            "credentialSubject": subject,
            "issuanceDate": Utc::now(),
        });

        ctx.report_progress(json!({"stage": "assembled"}));
        info!("任务 {} 签发凭证 {}", ctx.task_id, credential_id);
        Ok(document)
    }
}

/// 交易提交执行器
///
/// 通过[`LedgerClient`]把交易提交到外部账本。
pub struct TransactionExecutor {
    ledger: Arc<dyn LedgerClient>,
}

impl TransactionExecutor {
    pub fn new(ledger: Arc<dyn LedgerClient>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl OperationExecutor for TransactionExecutor {
    fn operation(&self) -> Operation {
        Operation::SendTransaction
    }

    async fn execute(&self, ctx: &ExecutionContext, payload: Value) -> CourierResult<Value> {
        let transaction = payload
            .get("transaction")
            .ok_or_else(|| CourierError::validation("交易请求缺少transaction字段"))?;

        ctx.report_progress(json!({"stage": "submitting"}));
        let receipt = self.ledger.submit(transaction).await?;

        info!("任务 {} 交易已提交", ctx.task_id);
        Ok(json!({"receipt": receipt, "submittedAt": Utc::now()}))
    }
}

/// 进程内模拟账本，用于嵌入式部署与测试
pub struct InMemoryLedger {
    /// 模拟的网络往返延迟
    latency: Duration,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            latency: Duration::from_millis(10),
        }
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    async fn submit(&self, transaction: &Value) -> CourierResult<Value> {
        tokio::time::sleep(self.latency).await;
        Ok(json!({
            "transactionId": Uuid::new_v4(),
            "echo": transaction,
            "consensusTimestamp": Utc::now(),
        }))
    }
}
