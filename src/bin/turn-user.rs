//! CLI tool for managing relay user accounts
//!
//! # Usage
//!
//! ```bash
//! # Add a user with a quota
//! turn-user add alice <password-hash> --max-sessions 5 --max-bandwidth 1048576 --max-duration 3600
//!
//! # Add an untracked user (no quota)
//! turn-user add bob <password-hash>
//!
//! # Inspect, list, enable/disable, change quota, delete
//! turn-user show alice
//! turn-user list
//! turn-user disable alice
//! turn-user set-password alice <new-password-hash>
//! turn-user set-quota alice --max-sessions 10 --max-bandwidth 5242880 --max-duration 7200
//! turn-user delete alice
//! ```
//!
//! The password argument is stored verbatim; hash it before calling
//! (credential handling belongs to the auth layer, not this core).

use clap::{Parser, Subcommand};
use std::sync::Arc;
use turn_rs::users::{QuotaPolicy, UserRegistry};

#[derive(Parser)]
#[command(name = "turn-user")]
#[command(about = "Manage relay user accounts and quotas", long_about = None)]
struct Cli {
    /// Database URL (e.g., sqlite://turn.db)
    #[arg(short, long, default_value = "sqlite://turn.db?mode=rwc")]
    db: String,

    /// Bandwidth-usage reset period in seconds
    #[arg(long, default_value_t = 86400)]
    reset_period_secs: i64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a new user
    Add {
        username: String,
        /// Pre-hashed credential
        password: String,
        #[arg(long)]
        max_sessions: Option<i64>,
        #[arg(long, default_value_t = 0)]
        max_bandwidth: i64,
        #[arg(long, default_value_t = 0)]
        max_duration: i64,
    },
    /// Delete a user
    Delete { username: String },
    /// List all users
    List,
    /// Show one user in detail
    Show { username: String },
    /// Replace a user's credential
    SetPassword {
        username: String,
        /// Pre-hashed credential
        password: String,
    },
    /// Enable a user
    Enable { username: String },
    /// Disable a user
    Disable { username: String },
    /// Replace a user's quota policy
    SetQuota {
        username: String,
        #[arg(long)]
        max_sessions: Option<i64>,
        #[arg(long, default_value_t = 0)]
        max_bandwidth: i64,
        #[arg(long, default_value_t = 0)]
        max_duration: i64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let pool = Arc::new(sqlx::SqlitePool::connect(&cli.db).await?);
    let registry = UserRegistry::new(pool, chrono::Duration::seconds(cli.reset_period_secs));
    registry.init_db().await?;

    match cli.command {
        Commands::Add {
            username,
            password,
            max_sessions,
            max_bandwidth,
            max_duration,
        } => {
            let policy = max_sessions.map(|max_sessions| QuotaPolicy {
                max_sessions,
                max_bandwidth,
                max_duration,
            });

            registry.create(&username, &password, policy, None).await?;
            println!("✓ User {} added", username);
            if let Some(p) = policy {
                println!(
                    "  Quota: {} session(s), {} bytes/period, {}s max duration",
                    p.max_sessions, p.max_bandwidth, p.max_duration
                );
            } else {
                println!("  No quota (untracked)");
            }
        }
        Commands::Delete { username } => {
            registry.delete(&username).await?;
            println!("✓ User {} deleted", username);
        }
        Commands::List => {
            let users = registry.list(0, 1000).await?;

            if users.is_empty() {
                println!("No users found.");
            } else {
                println!(
                    "{:<20} {:<8} {:<10} {:<12} {:<20}",
                    "Username", "Enabled", "Sessions", "Bandwidth", "Last Login"
                );
                println!("{:-<70}", "");

                for user in &users {
                    let (sessions, bandwidth) = match &user.quota {
                        Some(q) => (
                            format!("{}/{}", q.current_sessions, q.max_sessions),
                            format!("{}", q.used_bandwidth),
                        ),
                        None => ("-".to_string(), "-".to_string()),
                    };
                    let last_login = user
                        .last_login
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "Never".to_string());

                    println!(
                        "{:<20} {:<8} {:<10} {:<12} {:<20}",
                        user.username, user.enabled, sessions, bandwidth, last_login
                    );
                }

                println!("\nTotal: {} user(s)", users.len());
            }
        }
        Commands::Show { username } => {
            let user = registry.get(&username).await?;

            println!("Username:   {}", user.username);
            println!("Enabled:    {}", user.enabled);
            println!("Created:    {}", user.created_at.to_rfc3339());
            println!("Updated:    {}", user.updated_at.to_rfc3339());
            match user.last_login {
                Some(t) => println!("Last login: {}", t.to_rfc3339()),
                None => println!("Last login: Never"),
            }
            match &user.quota {
                Some(q) => {
                    println!("Quota:");
                    println!("  Sessions:  {}/{}", q.current_sessions, q.max_sessions);
                    println!(
                        "  Bandwidth: {}/{} bytes (resets {})",
                        q.used_bandwidth,
                        q.max_bandwidth,
                        q.reset_at.to_rfc3339()
                    );
                    println!("  Max session duration: {}s", q.max_duration);
                }
                None => println!("Quota:      none (untracked)"),
            }
            if let Some(metadata) = &user.metadata {
                println!("Metadata:   {}", serde_json::to_string_pretty(metadata)?);
            }
        }
        Commands::SetPassword { username, password } => {
            registry.set_password(&username, &password).await?;
            println!("✓ Password updated for {}", username);
        }
        Commands::Enable { username } => {
            registry.set_enabled(&username, true).await?;
            println!("✓ User {} enabled", username);
        }
        Commands::Disable { username } => {
            registry.set_enabled(&username, false).await?;
            println!("✓ User {} disabled", username);
        }
        Commands::SetQuota {
            username,
            max_sessions,
            max_bandwidth,
            max_duration,
        } => {
            let policy = max_sessions.map(|max_sessions| QuotaPolicy {
                max_sessions,
                max_bandwidth,
                max_duration,
            });

            registry.set_quota(&username, policy).await?;
            match policy {
                Some(p) => println!(
                    "✓ Quota for {} set to {} session(s), {} bytes/period, {}s max duration",
                    username, p.max_sessions, p.max_bandwidth, p.max_duration
                ),
                None => println!("✓ Quota for {} cleared (untracked)", username),
            }
        }
    }

    Ok(())
}
