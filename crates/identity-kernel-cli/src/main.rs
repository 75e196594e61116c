use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use identity_kernel_api::IdentityKernelApi;
use identity_kernel_core::{ContactId, IdentifyRequest, MergePolicy, ResolverConfig};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ik")]
#[command(about = "Identity Kernel CLI")]
struct Cli {
    #[arg(long, env = "IDENTITY_KERNEL_DB", default_value = "./identity_kernel.sqlite3")]
    db: PathBuf,

    #[arg(
        long,
        env = "IDENTITY_KERNEL_MERGE_POLICY",
        default_value = "report-oldest",
        value_parser = parse_merge_policy
    )]
    merge_policy: MergePolicy,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Resolve an email and/or phone number, recording new information.
    Identify(IdentifyArgs),
    Contact {
        #[command(subcommand)]
        command: ContactCommand,
    },
    Identity {
        #[command(subcommand)]
        command: IdentityCommand,
    },
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Args)]
struct IdentifyArgs {
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    phone_number: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ContactCommand {
    Show(ContactShowArgs),
    List,
}

#[derive(Debug, Args)]
struct ContactShowArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Subcommand)]
enum IdentityCommand {
    Show(IdentityShowArgs),
}

#[derive(Debug, Args)]
struct IdentityShowArgs {
    #[arg(long)]
    contact_id: i64,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
    Backup(DbOutArgs),
    Export(DbOutArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbOutArgs {
    #[arg(long)]
    out: PathBuf,
}

fn parse_merge_policy(value: &str) -> Result<MergePolicy, String> {
    MergePolicy::parse(value)
        .ok_or_else(|| format!("unknown merge policy `{value}`; expected report-oldest or merge"))
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<Value> {
    serde_json::to_value(value).with_context(|| format!("failed to serialize {what}"))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    tracing::debug!(
        db = %cli.db.display(),
        merge_policy = cli.merge_policy.as_str(),
        "identity kernel cli starting"
    );
    let api =
        IdentityKernelApi::with_config(cli.db, ResolverConfig { merge_policy: cli.merge_policy });
    match cli.command {
        Command::Identify(args) => run_identify(&api, &args),
        Command::Contact { command } => run_contact(&api, &command),
        Command::Identity { command } => run_identity(&api, &command),
        Command::Db { command } => run_db(&api, &command),
    }
}

fn run_identify(api: &IdentityKernelApi, args: &IdentifyArgs) -> Result<()> {
    let request = IdentifyRequest::new(args.email.as_deref(), args.phone_number.as_deref());
    let resolution = api.identify(&request)?;
    let mut value = to_json(&resolution.view, "identity view")?;
    if let Value::Object(object) = &mut value {
        object.insert(
            "outcome".to_string(),
            Value::String(resolution.outcome.as_str().to_string()),
        );
        object.insert(
            "createdContactId".to_string(),
            to_json(&resolution.created_contact_id, "created contact id")?,
        );
        object.insert(
            "mergedPrimaryIds".to_string(),
            to_json(&resolution.merged_primary_ids, "merged primary ids")?,
        );
    }
    emit_json(value)
}

fn run_contact(api: &IdentityKernelApi, command: &ContactCommand) -> Result<()> {
    match command {
        ContactCommand::Show(args) => {
            let contact = api.contact_show(ContactId(args.id))?;
            emit_json(to_json(&contact, "contact")?)
        }
        ContactCommand::List => {
            let contacts = api.contact_list()?;
            emit_json(serde_json::json!({
                "count": contacts.len(),
                "contacts": to_json(&contacts, "contacts")?
            }))
        }
    }
}

fn run_identity(api: &IdentityKernelApi, command: &IdentityCommand) -> Result<()> {
    match command {
        IdentityCommand::Show(args) => {
            let view = api.identity_show(ContactId(args.contact_id))?;
            emit_json(to_json(&view, "identity view")?)
        }
    }
}

fn run_db(api: &IdentityKernelApi, command: &DbCommand) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(to_json(&result, "migration result")?)
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            let clean = report.is_clean();
            let mut value = to_json(&report, "integrity report")?;
            if let Value::Object(object) = &mut value {
                object.insert("clean".to_string(), Value::Bool(clean));
            }
            emit_json(value)
        }
        DbCommand::Backup(args) => {
            api.backup(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::Export(args) => {
            let manifest = api.export(&args.out)?;
            let mut value = to_json(&manifest, "export manifest")?;
            if let Value::Object(object) = &mut value {
                object.insert("out_dir".to_string(), to_json(&args.out, "export directory")?);
            }
            emit_json(value)
        }
    }
}
