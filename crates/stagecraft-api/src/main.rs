//! Stagecraft CLI and REST API entry point.
//!
//! Binary name: `stagecraft`
//!
//! Parses CLI arguments, initializes tracing, the database and the engine,
//! then dispatches to the command handler or starts the REST API server.

mod cli;
mod http;
mod state;
mod tasks;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use stagecraft_infra::config::{load_engine_config, resolve_data_dir};
use stagecraft_observe::tracing_setup::{init_tracing, shutdown_tracing};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.log_filter(), cli.json, cli.otel) {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let json = cli.json;
    let quiet = cli.quiet;

    // Commands that need no database.
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(*shell, &mut cmd, "stagecraft", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Validate { file } => {
            return cli::run::handle_validate(&resolve_data_dir(), file, json).await;
        }
        Commands::Signal {
            run_id,
            name,
            payload,
            server,
        } => {
            let server = match server {
                Some(s) => s.clone(),
                None => {
                    let config = load_engine_config(&resolve_data_dir()).await;
                    cli::runs::server_url(&config.server)
                }
            };
            let run_id = cli::parse_run_id(run_id)?;
            let payload = cli::parse_json_arg(payload.as_deref())?;
            return cli::runs::handle_signal(&server, run_id, name, payload, json).await;
        }
        _ => {}
    }

    let state = AppState::init().await?;

    match cli.command {
        Commands::Run {
            file,
            input,
            durable,
            max_concurrency,
        } => {
            let input = cli::parse_json_arg(input.as_deref())?;
            cli::run::handle_run(state, &file, input, durable, max_concurrency, json, quiet)
                .await?;
        }

        Commands::Resume { run_id, all } => {
            if all {
                cli::run::handle_resume_all(state, json, quiet).await?;
            } else if let Some(run_id) = run_id {
                let run_id = cli::parse_run_id(&run_id)?;
                cli::run::handle_resume(state, run_id, json, quiet).await?;
            }
        }

        Commands::List { limit } => {
            cli::runs::handle_list(&state, limit, json).await?;
        }

        Commands::Show { run_id } => {
            let run_id = cli::parse_run_id(&run_id)?;
            cli::runs::handle_show(&state, run_id, json).await?;
        }

        Commands::Serve { port, host } => {
            let host = host.unwrap_or_else(|| state.config.server.host.clone());
            let port = port.unwrap_or(state.config.server.port);
            let addr = format!("{host}:{port}");
            let listener = tokio::net::TcpListener::bind(&addr).await?;

            println!(
                "  {} Stagecraft API listening on {}",
                console::style(">").bold(),
                console::style(format!("http://{addr}")).cyan()
            );
            println!("  {}", console::style("Press Ctrl+C to stop").dim());

            let router = http::router::build_router(state);

            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await?;

            // Runs still in flight are dropped with the runtime; their
            // journals keep them resumable with `stagecraft resume --all`.
            println!("\n  Server stopped.");
        }

        Commands::Completions { .. } | Commands::Validate { .. } | Commands::Signal { .. } => {
            unreachable!("handled above")
        }
    }

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
