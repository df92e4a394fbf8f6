pub mod server;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::keystore::KeyStore;

/// What the CLI resolved to; executed by the binary.
pub enum Action {
    Server(server::Args),
    RotateKeys { dsn: String, key_size: usize },
}

impl Action {
    /// Run the action.
    ///
    /// # Errors
    /// Returns error if the server or the key rotation fails.
    pub async fn execute(self) -> Result<()> {
        match self {
            Self::Server(args) => server::run(args).await,
            Self::RotateKeys { dsn, key_size } => {
                let pool = PgPoolOptions::new()
                    .max_connections(1)
                    .connect(&dsn)
                    .await
                    .context("Failed to connect to database")?;
                let kid = KeyStore::new().rotate(&pool, key_size).await?;
                info!("Rotated RSA keypair, new active kid: {kid}");
                Ok(())
            }
        }
    }
}
