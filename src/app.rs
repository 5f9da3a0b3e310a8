use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use courier_broker::{
    AmqpBus, BrokerChannel, InMemoryBus, MessageBus, StateReporter, WorkerRegistry,
};
use courier_config::{AppConfig, BrokerKind};
use courier_domain::ApplicationStatus;
use courier_gateway::{create_app, AppState, Notifier, SettingsService, TaskManager};
use courier_worker::{
    resolve_instance_id, CredentialExecutor, InMemoryLedger, TransactionExecutor, WorkerService,
};
use tokio::{net::TcpListener, sync::broadcast};
use tracing::info;
use uuid::Uuid;

/// 应用运行模式
#[derive(Debug, Clone)]
pub enum AppMode {
    /// 仅运行网关（HTTP + realtime + 任务编排）
    Gateway,
    /// 仅运行Worker
    Worker,
    /// 单进程运行所有组件（嵌入式部署）
    All,
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    bus: Arc<dyn MessageBus>,
}

impl Application {
    /// 创建应用实例并建立broker连接
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);

        let bus: Arc<dyn MessageBus> = match config.broker.kind {
            BrokerKind::Amqp => AmqpBus::connect(config.broker.clone())
                .await
                .context("连接AMQP broker失败")?,
            BrokerKind::InMemory => {
                info!("使用内存消息总线（嵌入式部署）");
                Arc::new(InMemoryBus::new())
            }
        };

        Ok(Self { config, mode, bus })
    }

    /// 运行应用程序直到收到关闭信号
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动应用程序，模式: {:?}", self.mode);

        match self.mode {
            AppMode::Gateway => self.run_gateway(shutdown_rx).await?,
            AppMode::Worker => self.run_worker(shutdown_rx).await?,
            AppMode::All => {
                let gateway_rx = shutdown_rx.resubscribe();
                tokio::try_join!(self.run_gateway(gateway_rx), self.run_worker(shutdown_rx))?;
            }
        }

        Ok(())
    }

    /// 网关：状态监听、任务编排、HTTP与realtime入口
    async fn run_gateway(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let instance = format!("gateway.{}", Uuid::new_v4().simple());
        let channel = self.create_channel(&instance).await?;

        let reporter = StateReporter::new(Arc::clone(&channel), &instance).await?;
        reporter.update_state(ApplicationStatus::Initializing).await?;

        let registry = WorkerRegistry::new(Duration::from_secs(
            self.config.worker.heartbeat_stale_seconds,
        ));
        registry.spawn_listener(&channel).await?;

        let notifier = Notifier::new();
        let task_manager = TaskManager::new(
            Arc::clone(&channel),
            Arc::clone(&registry),
            Arc::clone(&notifier),
            self.config.gateway.clone(),
        );
        task_manager.start().await?;

        let settings = SettingsService::new(&self.config.gateway.environment);
        settings.register(&channel).await?;

        let state = AppState {
            task_manager,
            registry,
            notifier,
            channel: Arc::clone(&channel),
        };
        let app = create_app(state, &self.config.gateway);

        let listener = TcpListener::bind(&self.config.gateway.bind_address)
            .await
            .with_context(|| format!("绑定地址失败: {}", self.config.gateway.bind_address))?;
        info!("网关监听于 {}", self.config.gateway.bind_address);

        reporter.update_state(ApplicationStatus::Ready).await?;

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("网关收到关闭信号");
            })
            .await
            .context("网关HTTP服务异常退出")?;

        reporter.update_state(ApplicationStatus::Stopped).await?;
        info!("网关服务已停止");
        Ok(())
    }

    /// Worker：注册内置执行器并进入服务循环
    async fn run_worker(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let instance = resolve_instance_id(&self.config.worker);
        info!("启动Worker服务: {}", instance);
        let channel = self.create_channel(&instance).await?;

        let service = WorkerService::builder(channel, self.config.worker.clone())
            .register_executor(Arc::new(CredentialExecutor::new()))
            .register_executor(Arc::new(TransactionExecutor::new(Arc::new(
                InMemoryLedger::new(),
            ))))
            .build();
        service.start().await?;

        let _ = shutdown_rx.recv().await;
        info!("Worker收到关闭信号");

        service.stop().await?;
        info!("Worker服务已停止");
        Ok(())
    }

    async fn create_channel(&self, instance: &str) -> Result<Arc<BrokerChannel>> {
        let channel = BrokerChannel::new(
            Arc::clone(&self.bus),
            &self.config.broker.channel_name,
            instance,
            Duration::from_millis(self.config.broker.default_timeout_ms),
        )
        .await?;
        Ok(channel)
    }
}
