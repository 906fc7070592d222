//! PostgreSQL connection pool.
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::Postgres;

pub const DEFAULT_CREDENTIALS: &str = "postgres";
pub const DEFAULT_DATABASE_NAME: &str = "hearth";
pub const DEFAULT_POOL_SIZE: u32 = 10;

/// Connection URL built from the `postgres` configuration section.
pub fn url_from_config(config: &Postgres) -> String {
    let username = config.username.as_deref().unwrap_or(DEFAULT_CREDENTIALS);
    let password = config.password.as_deref().unwrap_or(DEFAULT_CREDENTIALS);
    let db = config.database.as_deref().unwrap_or(DEFAULT_DATABASE_NAME);

    format!("postgres://{username}:{password}@{}/{db}", config.address)
}

/// Open the pool and run pending migrations.
pub async fn connect(url: &str, pool: Option<u32>) -> Result<PgPool, sqlx::Error> {
    let postgres = PgPoolOptions::new()
        .max_connections(pool.unwrap_or(DEFAULT_POOL_SIZE))
        .connect(url)
        .await?;

    sqlx::migrate!().run(&postgres).await?;

    tracing::info!("postgres connected");

    Ok(postgres)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_from_config() {
        let url = url_from_config(&Postgres {
            address: "db:5432".into(),
            ..Default::default()
        });
        assert_eq!(url, "postgres://postgres:postgres@db:5432/hearth");

        let url = url_from_config(&Postgres {
            address: "localhost".into(),
            database: Some("auth".into()),
            username: Some("app".into()),
            password: Some("pw".into()),
            pool_size: None,
        });
        assert_eq!(url, "postgres://app:pw@localhost/auth");
    }
}
