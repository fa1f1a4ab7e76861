pub mod db;
pub mod models;
pub mod repositories;

pub use sqlx;
use anyhow::{Context, Result};

pub async fn connect(url: &str) -> Result<sqlx::PgPool> {
    db::init_db(url).await.context("Failed to initialise database")
}
