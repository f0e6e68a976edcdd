//! 基础设施层
//!
//! PostgreSQL 版的消息存储实现与连接池/迁移工具。

pub mod pg_store;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub use pg_store::PgMessageStore;

/// 数据库迁移集合，嵌入二进制，启动时执行
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

/// 创建 PostgreSQL 连接池
pub async fn create_pg_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}
