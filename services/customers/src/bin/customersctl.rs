//! Customer Lifecycle CLI
//!
//! Runs the customer workflows against a local environment persisted in a
//! JSON state file, for exercising reconciliation, invites and deletion
//! without cloud access.
//!
//! ## Usage
//!
//! ```bash
//! # Seed an inviter, then invite a user on their behalf
//! customersctl --state dev.json add-user --email admin@example.com
//! customersctl --state dev.json invite --email user@example.com \
//!     --inviter-user-id admin@example.com --inviter-sub <admin-sub>
//!
//! # Reconcile a signed-in user's customer record
//! customersctl --state dev.json ensure --identity-id <id> --user-id <sub> --api-key-id <key>
//!
//! # Tear the account down
//! customersctl --state dev.json delete --user-sub <sub> --output json
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use devportal_customers::clients::IdentityProviderClient;
use devportal_customers::memory::LocalEnvironment;
use devportal_customers::types::UserAttribute;
use devportal_customers::{telemetry, CustomerLifecycle, CustomersConfig, InviteRequest};
use serde::Serialize;
use tracing::{info, warn};

/// Developer portal customer lifecycle against a local state file
#[derive(Parser, Debug)]
#[command(name = "customersctl", version, about)]
struct Cli {
    /// Path of the JSON state file (created when absent)
    #[arg(long, default_value = "customers-state.json")]
    state: PathBuf,

    /// Identity-provider user pool
    #[arg(long, env = "UserPoolId", default_value = "local-user-pool")]
    user_pool_id: String,

    /// Staging (pre-login accounts) table
    #[arg(long, env = "PreLoginAccountsTableName", default_value = "PreLoginAccounts")]
    pre_login_accounts_table_name: String,

    /// Canonical customers table
    #[arg(long, env = "CustomersTableName", default_value = "DevPortalCustomers")]
    customers_table_name: String,

    /// Output format
    #[arg(long, value_enum, default_value = "text")]
    output: OutputFormat,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an identity-provider user directly (e.g. an admin who sends invites)
    AddUser {
        #[arg(long)]
        email: String,
    },

    /// Make sure a canonical customer record exists and is up to date
    Ensure {
        #[arg(long)]
        identity_id: String,
        #[arg(long)]
        user_id: String,
        #[arg(long, default_value = "")]
        api_key_id: String,
    },

    /// Invite a new account on behalf of an existing user
    Invite {
        /// Email address of the invitee
        #[arg(long)]
        email: String,
        #[arg(long)]
        inviter_user_id: String,
        /// Identity-provider subject of the inviter
        #[arg(long)]
        inviter_sub: String,
    },

    /// Delete an account and everything that hangs off it
    Delete {
        #[arg(long)]
        user_sub: String,
    },

    /// Show the canonical customer record
    Show {
        #[arg(long)]
        identity_id: String,
    },

    /// List invites that have not been accepted
    Pending,
}

fn emit<T: Serialize + std::fmt::Debug>(format: &OutputFormat, value: &T) -> Result<()> {
    match format {
        OutputFormat::Text => println!("{:#?}", value),
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(value).context("Failed to serialize result")?
        ),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.verbose, cli.log_json)?;

    let config = CustomersConfig::new(
        &cli.user_pool_id,
        &cli.pre_login_accounts_table_name,
        &cli.customers_table_name,
    );
    let env = LocalEnvironment::load(&cli.state, config.clone()).await?;
    let lifecycle = CustomerLifecycle::new(
        config,
        env.store.clone(),
        env.identity.clone(),
        env.keys.clone(),
    );

    info!(state = ?cli.state, "Loaded local environment");

    let outcome = match &cli.command {
        Commands::AddUser { email } => env
            .identity
            .admin_create_user(
                &cli.user_pool_id,
                email,
                vec![UserAttribute::new("email", email)],
            )
            .await
            .and_then(|user| emit(&cli.output, &user)),
        Commands::Ensure {
            identity_id,
            user_id,
            api_key_id,
        } => match lifecycle
            .ensure_customer_item(identity_id, user_id, api_key_id)
            .await
        {
            Ok(record) => emit(&cli.output, &record),
            Err(e) => Err(e.into()),
        },
        Commands::Invite {
            email,
            inviter_user_id,
            inviter_sub,
        } => {
            let request = InviteRequest {
                target_email_address: email.clone(),
                inviter_user_id: inviter_user_id.clone(),
                inviter_user_sub: inviter_sub.clone(),
            };
            match lifecycle.create_account_invite(&request).await {
                Ok(record) => emit(&cli.output, &record),
                Err(e) => Err(e.into()),
            }
        }
        Commands::Delete { user_sub } => match lifecycle.delete_account_by_user_id(user_sub).await {
            Ok(report) => emit(&cli.output, &report),
            Err(e) => Err(e.into()),
        },
        Commands::Show { identity_id } => match lifecycle.get_customer(identity_id).await {
            Ok(record) => emit(&cli.output, &record),
            Err(e) => Err(e.into()),
        },
        Commands::Pending => match lifecycle.list_pending_invites().await {
            Ok(records) => emit(&cli.output, &records),
            Err(e) => Err(e.into()),
        },
    };

    // Partial work (e.g. an invite user created before a failed write) is kept.
    env.save(&cli.state).await?;

    if let Err(e) = &outcome {
        warn!(error = %e, "Command failed");
    }
    outcome
}
