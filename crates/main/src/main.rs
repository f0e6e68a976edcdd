//! 主应用程序入口
//!
//! 装配存储、中枢与网关，启动 WebSocket 服务。

use std::sync::Arc;

use application::{ChannelAuditSink, Hub};
use config::AppConfig;
use gateway::{router, AppState, JwtService};
use infrastructure::{create_pg_pool, PgMessageStore, MIGRATOR};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 加载并校验配置
    let config = AppConfig::from_env_with_defaults();
    config.validate()?;

    tracing::info!(
        "连接数据库: {}",
        config.database.url.split('@').next_back().unwrap_or("unknown")
    );

    // 创建 PostgreSQL 连接池并运行迁移
    let pg_pool = create_pg_pool(&config.database.url, config.database.max_connections).await?;
    MIGRATOR.run(&pg_pool).await?;

    let store = Arc::new(PgMessageStore::new(pg_pool));

    // 审计事件消费端：目前只落日志，后续可换成通知服务
    let (audit, mut audit_rx) = ChannelAuditSink::new();
    tokio::spawn(async move {
        while let Some(event) = audit_rx.recv().await {
            tracing::info!(event = ?event, "审计事件");
        }
    });

    // 创建中枢并启动心跳回收任务
    let hub = Arc::new(Hub::new(store, Arc::new(audit), config.hub.clone()));
    let _reaper = hub.spawn_reaper();

    // 创建 JWT 服务与应用状态
    let jwt_service = Arc::new(JwtService::new(config.jwt.clone()));
    let state = AppState::new(hub, jwt_service);

    // 启动服务器
    let app = router(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("消息中枢启动在 http://{}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
