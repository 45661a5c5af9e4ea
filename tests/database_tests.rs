//! PostgreSQL store tests. Need a Docker daemon; run with `cargo test -- --ignored`.

use std::time::Duration;

use anyhow::Result;
use testcontainers::{
    ContainerAsync, GenericImage, ImageExt,
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
};
use tokio_postgres::NoTls;
use webhook_pipeline::{clients::database::PostgresOrderStore, services::sinks::OrderStore};

use crate::common::{sample_order, wait_until};

async fn start_postgres() -> Result<(ContainerAsync<GenericImage>, String)> {
    let container = GenericImage::new("postgres", "16-alpine")
        .with_exposed_port(5432.tcp())
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_USER", "orders")
        .with_env_var("POSTGRES_PASSWORD", "secret")
        .with_env_var("POSTGRES_DB", "orders")
        .with_startup_timeout(Duration::from_secs(90))
        .start()
        .await?;

    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432.tcp()).await?;

    Ok((
        container,
        format!("postgres://orders:secret@{}:{}/orders", host, port),
    ))
}

async fn ready_store(url: &str) -> Result<PostgresOrderStore> {
    let store = PostgresOrderStore::new(url);
    let reachable = &store;
    let ready = wait_until(Duration::from_secs(30), move || async move {
        reachable.health_check().await.is_ok()
    })
    .await;
    anyhow::ensure!(ready, "postgres never became reachable");
    Ok(store)
}

async fn row_count(url: &str, order_sn: &str) -> Result<i64> {
    let (client, connection) = tokio_postgres::connect(url, NoTls).await?;
    tokio::spawn(connection);
    let row = client
        .query_one(
            "SELECT COUNT(*) FROM order_items WHERE order_id = $1",
            &[&order_sn],
        )
        .await?;
    Ok(row.get(0))
}

/// Test: Upserting the same order twice keeps one row per SKU
#[tokio::test]
#[ignore = "requires docker"]
async fn test_upsert_is_idempotent_per_sku() -> Result<()> {
    let (_container, url) = start_postgres().await?;
    let store = ready_store(&url).await?;

    store
        .upsert_order(&sample_order("2601033YS140TT", "READY_TO_SHIP"))
        .await?;
    store
        .upsert_order(&sample_order("2601033YS140TT", "SHIPPED"))
        .await?;

    assert_eq!(row_count(&url, "2601033YS140TT").await?, 2);

    Ok(())
}

/// Test: The store reconnects after the server kills its session
#[tokio::test]
#[ignore = "requires docker"]
async fn test_store_reconnects_after_session_is_terminated() -> Result<()> {
    let (_container, url) = start_postgres().await?;
    let store = ready_store(&url).await?;
    store.upsert_order(&sample_order("BEFORE", "SHIPPED")).await?;

    let (admin, connection) = tokio_postgres::connect(&url, NoTls).await?;
    tokio::spawn(connection);
    admin
        .execute(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE pid <> pg_backend_pid() AND datname = current_database()",
            &[],
        )
        .await?;

    let store = &store;
    let recovered = wait_until(Duration::from_secs(10), move || async move {
        store
            .upsert_order(&sample_order("AFTER", "SHIPPED"))
            .await
            .is_ok()
    })
    .await;

    assert!(recovered, "store never reconnected");
    assert_eq!(row_count(&url, "AFTER").await?, 2);

    Ok(())
}
