//! Command definitions and handlers.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use inquire::{Password, PasswordDisplayMode};
use secrecy::SecretString;
use serde::Serialize;
use std::path::PathBuf;
use tether_core::VaultPaths;
use tether_runtime::{ChatMessage, Host};

const HOME_ENV: &str = "TETHER_HOME";
const REFRESH_TOKEN_ENV: &str = "TETHER_REFRESH_TOKEN";
const PASSWORD_ENV: &str = "TETHER_PASSWORD";

/// Tether: local/cloud model access with retries, failover and approvals
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(version)]
pub struct Cli {
    /// Data directory (defaults to $TETHER_HOME, then the platform config dir)
    #[arg(long, global = true)]
    pub home: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Elect a backend and report connectivity and login state
    Status,
    /// Show or change settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Log in to the cloud backend (password from $TETHER_PASSWORD or a prompt)
    Login { email: String },
    /// Forget cloud credentials
    Logout,
    /// Send one prompt to the selected backend
    Chat {
        prompt: String,
        #[arg(long)]
        model: Option<String>,
    },
    /// Run an election and list the errors it captured
    Errors,
}

#[derive(Subcommand, Debug)]
pub enum SettingsAction {
    Show,
    Set { key: String, value: String },
}

pub async fn run(cli: Cli) -> Result<()> {
    let host = build_host(cli.home.clone())?;
    let json = cli.json;

    let result = match cli.command {
        Commands::Status => status(&host, json).await,
        Commands::Settings { action } => match action {
            SettingsAction::Show => print(&host.settings(), json, |s| {
                serde_json::to_string_pretty(s).unwrap_or_default()
            }),
            SettingsAction::Set { key, value } => {
                let updated = host.set_setting(&key, &value).await?;
                print(&updated, json, |_| format!("{} updated", key))
            }
        },
        Commands::Login { email } => {
            let password = read_password()?;
            let status = host.login(&email, &password).await?;
            print(&status, json, |_| format!("Logged in as {}", email))
        }
        Commands::Logout => {
            host.logout().await?;
            print(&serde_json::json!({"status": "logged_out"}), json, |_| {
                "Logged out".to_string()
            })
        }
        Commands::Chat { prompt, model } => {
            host.start().await;
            let reply = host
                .send_chat(&[ChatMessage::user(prompt)], model.as_deref())
                .await?;
            print(&reply, json, |r| {
                let mut out = r.content.clone();
                for call in &r.tool_calls {
                    out.push_str(&format!("\n[tool] {} {}", call.name, call.arguments));
                }
                out
            })
        }
        Commands::Errors => {
            host.start().await;
            let errors = host.retry_engine().unresolved_errors();
            print(&errors, json, |errors| {
                if errors.is_empty() {
                    return "No unresolved errors".to_string();
                }
                errors
                    .iter()
                    .map(|e| {
                        format!(
                            "#{} {} [{}] {}.{}: {}",
                            e.id,
                            e.timestamp.to_rfc3339(),
                            e.severity,
                            e.source,
                            e.operation,
                            e.message
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
    };

    host.shutdown();
    result
}

async fn status(host: &Host, json: bool) -> Result<()> {
    #[derive(Serialize)]
    struct Report {
        connectivity: tether_runtime::Connectivity,
        session: tether_runtime::SessionStatus,
        encryption_available: bool,
    }

    let report = Report {
        connectivity: host.start().await,
        session: host.session_status(),
        encryption_available: host.vault().encryption_available(),
    };
    print(&report, json, |r| {
        format!(
            "backend: {} ({})\nendpoint: {}\nsession: {:?}\nencryption: {}",
            r.connectivity.mode,
            if r.connectivity.healthy { "healthy" } else { "unreachable" },
            r.connectivity.endpoint,
            r.session,
            if r.encryption_available { "available" } else { "unavailable" },
        )
    })
}

/// Never taken as an argument, so it stays out of `ps` and shell history.
fn read_password() -> Result<SecretString> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        if !password.is_empty() {
            return Ok(SecretString::from(password));
        }
    }
    let password = Password::new("Password:")
        .with_display_mode(PasswordDisplayMode::Masked)
        .without_confirmation()
        .prompt()
        .context("Failed to read password")?;
    Ok(SecretString::from(password))
}

fn build_host(home: Option<PathBuf>) -> Result<Host> {
    let dir = resolve_home(home)?;
    tracing::debug!(home = %dir.display(), "Using data directory");
    let mut builder = Host::builder().paths(VaultPaths::new(dir));
    if let Ok(token) = std::env::var(REFRESH_TOKEN_ENV) {
        if !token.trim().is_empty() {
            builder = builder.seed_refresh_token(SecretString::from(token));
        }
    }
    builder.build().context("Failed to start Tether host")
}

fn resolve_home(home: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(dir) = home {
        return Ok(dir);
    }
    if let Some(dir) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    match ProjectDirs::from("dev", "tether", "tether") {
        Some(dirs) => Ok(dirs.config_dir().to_path_buf()),
        None => bail!("Could not determine a config directory; pass --home or set {}", HOME_ENV),
    }
}

fn print<T: Serialize>(value: &T, json: bool, text: impl FnOnce(&T) -> String) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", text(value));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_settings_set() {
        let cli = Cli::parse_from(["tether", "--json", "settings", "set", "backend", "cloud"]);
        assert!(cli.json);
        match cli.command {
            Commands::Settings {
                action: SettingsAction::Set { key, value },
            } => {
                assert_eq!(key, "backend");
                assert_eq!(value, "cloud");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_login_takes_no_password_argument() {
        let cli = Cli::parse_from(["tether", "login", "ada@example.com"]);
        assert!(matches!(cli.command, Commands::Login { ref email } if email == "ada@example.com"));
        assert!(Cli::try_parse_from(["tether", "login", "ada@example.com", "--password", "pw"]).is_err());
    }

    #[test]
    fn test_home_flag_wins() {
        let dir = resolve_home(Some(PathBuf::from("/tmp/tether-home"))).unwrap();
        assert_eq!(dir, PathBuf::from("/tmp/tether-home"));
    }

    #[test]
    fn test_chat_model_flag() {
        let cli = Cli::parse_from(["tether", "chat", "hello", "--model", "m"]);
        assert!(matches!(
            cli.command,
            Commands::Chat { ref prompt, model: Some(ref m) } if prompt == "hello" && m == "m"
        ));
    }
}
