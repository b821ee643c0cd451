mod cli;
mod observability;
mod orchestrator;
mod stdio_rpc;

use std::io::Read;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use cli::{Cli, Commands};
use orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();
    let cli = Cli::parse();
    let orchestrator = Arc::new(Orchestrator::new());

    match cli.command {
        Commands::Ensure { provider, model } => {
            match orchestrator
                .ensure_provider_environment(&provider, model.as_deref())
                .await
            {
                Some(path) => println!("{}", path.display()),
                None => anyhow::bail!("environment for {} could not be provisioned", provider),
            }
        }

        Commands::Status { provider, json } => {
            let statuses = orchestrator.provider_package_status(&provider).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
            } else {
                for status in &statuses {
                    let installed = status.installed_version.as_deref().unwrap_or("-");
                    println!(
                        "{:<24} {:<12} {:?}",
                        format!("{}{}", status.name, status.version_constraint),
                        installed,
                        status.status
                    );
                }
            }
        }

        Commands::Detect => {
            let backend = envlite_provision::gpu::detect_backend().await;
            println!("{}", backend.suffix());
        }

        Commands::List => {
            for (name, path) in orchestrator.list_environments() {
                println!("{:<24} {}", name, path.display());
            }
        }

        Commands::Exec {
            provider,
            code,
            model,
            user,
        } => {
            let code = if code == "-" {
                let mut s = String::new();
                std::io::stdin().read_to_string(&mut s)?;
                s
            } else {
                code
            };

            let session = orchestrator
                .create_session(&user, Some(&provider), model.as_deref())
                .await?;
            let outcome = orchestrator.execute_code(&code, Some(&session.id)).await;
            if let Err(e) = orchestrator.terminate_session(&session.id).await {
                tracing::warn!(error = %e, "Session teardown failed");
            }

            if outcome.success {
                println!("{}", outcome.output);
            } else {
                anyhow::bail!(
                    "execution failed: {}",
                    outcome.error.unwrap_or_else(|| "unknown error".to_string())
                );
            }
        }

        Commands::Serve { stdio } => {
            if stdio {
                stdio_rpc::serve_stdio(orchestrator).await?;
            } else {
                anyhow::bail!("only --stdio serving is supported");
            }
        }
    }

    Ok(())
}
