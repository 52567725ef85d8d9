use crate::api::{self, handlers::auth::AuthConfig, outbox::OutboxWorkerConfig};
use crate::cli::actions::Action;
use anyhow::Result;

/// Handle the server action
pub async fn handle(action: Action) -> Result<()> {
    match action {
        Action::Server {
            port,
            dsn,
            signing_key,
            frontend_url,
            totp_issuer,
            token_ttl_seconds,
        } => {
            let config = AuthConfig::new(frontend_url)
                .with_totp_issuer(totp_issuer)
                .with_token_ttl_seconds(token_ttl_seconds);

            api::new(port, dsn, &signing_key, config, OutboxWorkerConfig::new()).await?;
        }
    }

    Ok(())
}
