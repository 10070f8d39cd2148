use diesel::{Connection, PgConnection};
use diesel_async::{
    pooled_connection::{deadpool::Pool, AsyncDieselConnectionManager},
    AsyncPgConnection,
};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::env;
use tracing::info;

use crate::error::DbError;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");

const DEFAULT_POOL_SIZE: usize = 8;

#[derive(Clone)]
pub struct DatabaseConnections {
    pub postgres: Pool<AsyncPgConnection>,
}

impl DatabaseConnections {
    fn run_migrations(db_url: &str) -> Result<(), DbError> {
        let mut conn = PgConnection::establish(db_url)
            .map_err(|e| DbError::Migration(format!("can't connect to database: {e}")))?;
        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| DbError::Migration(e.to_string()))?;
        info!(applied = applied.len(), "database migrations up to date");
        Ok(())
    }

    pub fn postgres_pool(db_url: String) -> Result<Pool<AsyncPgConnection>, DbError> {
        let config = AsyncDieselConnectionManager::new(db_url);
        let max_pool_size = match env::var("MAX_POOL_SIZE") {
            Ok(size) => size
                .parse()
                .map_err(|_| DbError::Config(format!("invalid MAX_POOL_SIZE {size:?}")))?,
            Err(_) => DEFAULT_POOL_SIZE,
        };
        Pool::builder(config)
            .max_size(max_pool_size)
            .build()
            .map_err(|e| DbError::Pool(e.to_string()))
    }

    /// Reads `DATABASE_URL`, substituting `$(POSTGRES_USER)` and
    /// `$(POSTGRES_PASSWORD)` from the environment when present.
    pub fn database_url() -> Result<String, DbError> {
        let mut db_url = env::var("DATABASE_URL")
            .map_err(|_| DbError::Config("DATABASE_URL must be set".to_string()))?;
        if let Ok(postgres_user) = env::var("POSTGRES_USER") {
            db_url = db_url.replace("$(POSTGRES_USER)", &postgres_user);
        }
        if let Ok(postgres_password) = env::var("POSTGRES_PASSWORD") {
            db_url = db_url.replace("$(POSTGRES_PASSWORD)", &postgres_password);
        }
        Ok(db_url)
    }

    async fn init_postgres() -> Result<Pool<AsyncPgConnection>, DbError> {
        let db_url = Self::database_url()?;
        let db_url_pool = db_url.clone();
        tokio::task::spawn_blocking(move || Self::run_migrations(&db_url))
            .await
            .map_err(|e| DbError::Migration(e.to_string()))??;
        Self::postgres_pool(db_url_pool)
    }

    pub async fn init() -> Result<Self, DbError> {
        Ok(Self {
            postgres: Self::init_postgres().await?,
        })
    }
}
