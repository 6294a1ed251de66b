use anyhow::{Context, Result};

use slotrush::config::Config;
use slotrush::engine::Engine;
use slotrush::session::SessionCheck;

/// Load the credential file and validate it against the account endpoint
pub async fn check_session(config: Config, refresh: bool) -> Result<()> {
    println!("Checking session");
    println!("================");
    println!("  Credential file: {}", config.session.credential_file.display());

    let engine = Engine::from_config(config).context("Failed to build engine")?;
    engine
        .session
        .load_from(engine.monitor.store())
        .await
        .context("Failed to read credential file")?;

    let mut result = engine.monitor.check_once().await;
    if refresh && result.needs_refresh() {
        println!("  Session not valid ({result:?}), running refresh");
        match engine.monitor.refresh_once().await {
            Ok(changed) => {
                println!("  Refresh {}", if changed { "installed a new token" } else { "kept the same token" });
                result = engine.monitor.check_once().await;
            }
            Err(e) => println!("  Refresh failed: {e}"),
        }
    }

    let view = engine.session.view();
    println!();
    println!("Result: {result:?}");
    println!("Freshness: {:?}", view.freshness);
    if let Some(preview) = &view.token_preview {
        println!("Token: {preview}");
    }
    if let Some(expiry) = view.estimated_expiry {
        println!("Estimated expiry: {expiry}");
    }
    if let Some(reason) = &view.invalidated_reason {
        println!("Invalidated: {reason}");
    }

    if result != SessionCheck::Valid {
        anyhow::bail!("Session is not valid");
    }
    Ok(())
}
