use async_trait::async_trait;
use sqlx::PgPool;

use super::StoreError;
use crate::linking::CustomerStore;

/// A salon customer record. Linking state is inferred from the shape of
/// `line_user_id` and `link_token`, never stored as a separate column.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct Customer {
    pub id: String,
    pub shop_id: String,
    pub name: String,
    /// LINE user id, set once the chat identity is linked. Empty/NULL = not linked.
    pub line_user_id: Option<String>,
    /// Single-use linking secret. Cleared to '' on consumption.
    pub link_token: Option<String>,
    /// Short public code for the member-card page. Generated lazily.
    pub member_code: Option<String>,
    pub notes: Option<String>,
    pub last_visit_at: Option<i64>,
    pub created_at: i64,
}

pub async fn find_by_line_id(
    pool: &PgPool,
    shop_id: &str,
    line_user_id: &str,
) -> Result<Option<Customer>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM customers WHERE shop_id = $1 AND line_user_id = $2")
        .bind(shop_id)
        .bind(line_user_id)
        .fetch_optional(pool)
        .await
}

/// Insert a customer created from a follow event: the chat identity is
/// already known, so the row is born linked.
pub async fn insert_self_registered(
    pool: &PgPool,
    id: &str,
    shop_id: &str,
    line_user_id: &str,
    name: &str,
    now: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO customers (id, shop_id, name, line_user_id, created_at)
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(id)
    .bind(shop_id)
    .bind(name)
    .bind(line_user_id)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Consume a link token in one conditional UPDATE: the token must still be
/// present and the row must not be linked yet. rows_affected tells us whether
/// we won. This closes the read-then-write race under duplicate deliveries.
pub async fn consume_link_token(
    pool: &PgPool,
    shop_id: &str,
    token: &str,
    line_user_id: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE customers SET line_user_id = $1, link_token = ''
         WHERE shop_id = $2 AND link_token = $3 AND link_token <> ''
           AND (line_user_id IS NULL OR line_user_id = '')",
    )
    .bind(line_user_id)
    .bind(shop_id)
    .bind(token)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn set_member_code(
    pool: &PgPool,
    customer_id: &str,
    code: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE customers SET member_code = $1 WHERE id = $2")
        .bind(code)
        .bind(customer_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Postgres-backed store handed to the linking engine.
#[derive(Clone)]
pub struct PgCustomerStore {
    pool: PgPool,
}

impl PgCustomerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CustomerStore for PgCustomerStore {
    async fn find_by_line_id(
        &self,
        shop_id: &str,
        line_user_id: &str,
    ) -> Result<Option<Customer>, StoreError> {
        Ok(find_by_line_id(&self.pool, shop_id, line_user_id).await?)
    }

    async fn insert_self_registered(
        &self,
        shop_id: &str,
        line_user_id: &str,
        name: &str,
        now: i64,
    ) -> Result<(), StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        Ok(insert_self_registered(&self.pool, &id, shop_id, line_user_id, name, now).await?)
    }

    async fn consume_link_token(
        &self,
        shop_id: &str,
        token: &str,
        line_user_id: &str,
    ) -> Result<bool, StoreError> {
        Ok(consume_link_token(&self.pool, shop_id, token, line_user_id).await?)
    }

    async fn set_member_code(&self, customer_id: &str, code: &str) -> Result<(), StoreError> {
        Ok(set_member_code(&self.pool, customer_id, code).await?)
    }
}
