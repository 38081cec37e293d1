//! Bring the stores up, apply the schema, seed the super role and optionally
//! install the first administrator.
//!
//! `BOOTSTRAP_ADMIN_USERNAME` and `BOOTSTRAP_ADMIN_PASSWORD` together create
//! (or reuse) that account and hand it the super role, provided nobody holds
//! it yet.

use anyhow::Context;

use tierguard_auth::UserRepository;
use tierguard_core::RequestContext;
use tierguard_infra::{AppConfig, build_access_service, claim_super_role};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    tierguard_observability::tracing::init(&config.log);

    let runtime = build_access_service(&config).await?;

    let username = std::env::var("BOOTSTRAP_ADMIN_USERNAME").ok();
    let password = std::env::var("BOOTSTRAP_ADMIN_PASSWORD").ok();
    let (Some(username), Some(password)) = (username, password) else {
        tracing::info!("no bootstrap administrator requested");
        return Ok(());
    };

    let ctx = RequestContext::new();
    let user = match runtime.directory.user_by_username(&username).await? {
        Some(existing) => existing,
        None => runtime
            .service
            .register(&ctx, &username, &password)
            .await
            .context("failed to register bootstrap administrator")?,
    };
    let admin = claim_super_role(runtime.directory.as_ref(), user.id).await?;

    tracing::info!(user_id = %admin.id, username = %admin.username, "bootstrap administrator ready");
    Ok(())
}
