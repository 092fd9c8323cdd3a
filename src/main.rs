//! Warden agent entry point.
//!
//! Bootstraps the supervision agent with:
//! - Configuration loading and validation
//! - A startup update check against the configured release channel
//! - The idle-slot policy loop
//! - Signal handling for graceful worker shutdown
//!
//! ## CLI Subcommands
//!
//! - `warden-cli` or `warden-cli serve` - Run the agent (default)
//! - `warden-cli check-update` - One-shot update check (exit 0/1)
//! - `warden-cli config show|validate` - Inspect configuration
//! - `warden-cli version` - Show version information

use std::process::ExitCode;
use std::sync::Arc;

use warden::config::{current_version, AgentConfig};
use warden::supervisor::policy;
use warden::Agent;

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("serve");

    match command {
        "serve" | "" => {
            init_tracing();
            let config = match AgentConfig::load() {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Configuration error: {}", e);
                    return ExitCode::from(2u8);
                }
            };
            match serve(config).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("Agent error: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
        "check-update" => {
            init_tracing();
            let config = match AgentConfig::load() {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Configuration error: {}", e);
                    return ExitCode::from(2u8);
                }
            };
            let agent = Agent::new(config);
            if agent.check_for_update().await {
                println!("update available");
                ExitCode::SUCCESS
            } else {
                println!("up to date");
                ExitCode::FAILURE
            }
        }
        "config" => {
            let subcommand = args.get(2).map(|s| s.as_str()).unwrap_or("show");
            match subcommand {
                "show" => match AgentConfig::load() {
                    Ok(config) => {
                        let json = args.get(3).map(|s| s.as_str()) == Some("--json");
                        let rendered = if json {
                            serde_json::to_string_pretty(&config).map_err(|e| e.to_string())
                        } else {
                            toml::to_string_pretty(&config).map_err(|e| e.to_string())
                        };
                        match rendered {
                            Ok(rendered) => {
                                println!("{}", rendered);
                                ExitCode::SUCCESS
                            }
                            Err(e) => {
                                eprintln!("Failed to render configuration: {}", e);
                                ExitCode::FAILURE
                            }
                        }
                    }
                    Err(e) => {
                        eprintln!("Configuration error: {}", e);
                        ExitCode::from(2u8)
                    }
                },
                "validate" => match AgentConfig::load() {
                    Ok(_) => {
                        println!("configuration OK");
                        ExitCode::SUCCESS
                    }
                    Err(e) => {
                        eprintln!("Configuration error: {}", e);
                        ExitCode::from(2u8)
                    }
                },
                _ => {
                    eprintln!("Unknown config subcommand: {}", subcommand);
                    print_usage();
                    ExitCode::FAILURE
                }
            }
        }
        "version" | "--version" | "-V" => {
            println!("warden {}", current_version());
            ExitCode::SUCCESS
        }
        "help" | "--help" | "-h" => {
            print_usage();
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

/// Run the agent until interrupted: startup update check, then the
/// policy loop, then a graceful worker stop on Ctrl+C.
async fn serve(config: AgentConfig) -> Result<(), Box<dyn std::error::Error>> {
    let agent = Arc::new(Agent::new(config));
    tracing::info!(version = %current_version(), "warden agent starting");

    // Startup update check is advisory; the worker loop runs regardless.
    {
        let agent = agent.clone();
        tokio::spawn(async move {
            if agent.check_for_update().await {
                match agent.request_install().await {
                    Ok(outcome) => tracing::info!(?outcome, "startup update check finished"),
                    Err(e) => tracing::warn!(error = %e, "startup update attempt failed"),
                }
            }
        });
    }

    let policy_handle = tokio::spawn(policy::policy_loop(
        agent.supervisor.clone(),
        agent.config.policy.prefer.clone(),
        agent.config.policy.interval(),
    ));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received; stopping worker");

    policy_handle.abort();
    agent.stop_workload().await;
    tracing::info!("shutdown complete");
    Ok(())
}

fn print_usage() {
    let version = current_version();
    eprintln!(
        "warden - hardened supervision agent for verified miner workloads v{}

USAGE:
    warden-cli [COMMAND] [OPTIONS]

COMMANDS:
    serve         Run the agent (default when no command given)
    check-update  One-shot release check (exit 0 if an update exists)
    config        Inspect configuration (show, validate)
    version       Show version information
    help          Show this help message

ENVIRONMENT:
    WARDEN_CONFIG               Config file path (default: warden.toml)
    WARDEN_USE_SANDBOX          Launch workers in the hardened sandbox
    WARDEN_AUTO_REPLACE         Install verified updates without confirmation
    WARDEN_REQUIRE_CONFIRMATION Stage installs behind a confirmation token
    WARDEN_POLICY_INTERVAL      Policy re-evaluation interval (secs)
    WARDEN_UPDATE_OWNER         GitHub owner for the update channel
    WARDEN_UPDATE_REPO          GitHub repo for the update channel
    WARDEN_PUBKEY               Trusted signing public key path
    RUST_LOG                    Log level (debug, info, warn, error)

EXIT CODES:
    0  Success
    1  Failure / no update
    2  Configuration error
",
        version
    );
}
