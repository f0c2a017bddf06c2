use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use cluster_directory_api::ClusterDirectoryApi;
use cluster_directory_core::{
    ClusterRecordId, DirectoryConfig, NewOrganization, OrgId, PageRequest, SearchRequest,
    StalenessRequest, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE,
};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_ENV_VAR: &str = "CLUSTER_DIRECTORY_LOG";

#[derive(Debug, Parser)]
#[command(name = "cdir")]
#[command(about = "Cluster Directory CLI")]
struct Cli {
    #[arg(long, env = "CLUSTER_DIRECTORY_DB", default_value = "./cluster_directory.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "CLUSTER_DIRECTORY_DEFAULT_PAGE_SIZE", default_value_t = DEFAULT_PAGE_SIZE)]
    default_page_size: u32,
    #[arg(long, env = "CLUSTER_DIRECTORY_MAX_PAGE_SIZE", default_value_t = MAX_PAGE_SIZE)]
    max_page_size: u32,
    #[arg(long, env = "CLUSTER_DIRECTORY_ZOMBIE_THRESHOLD_SECONDS", default_value_t = 86_400)]
    zombie_threshold_seconds: i64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Org {
        #[command(subcommand)]
        command: Box<OrgCommand>,
    },
    Cluster {
        #[command(subcommand)]
        command: Box<ClusterCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum OrgCommand {
    /// Find the organization by name, creating it on first use.
    Create(OrgCreateArgs),
    Show(OrgArgs),
}

#[derive(Debug, Args)]
struct OrgCreateArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    creator: String,
    #[arg(long)]
    id: Option<String>,
}

#[derive(Debug, Args)]
struct OrgArgs {
    #[arg(long)]
    org: String,
}

#[derive(Debug, Subcommand)]
enum ClusterCommand {
    Get(ClusterGetArgs),
    List(ClusterListArgs),
    Search(ClusterSearchArgs),
    KubeVersions(OrgArgs),
    Zombies(ClusterZombiesArgs),
}

#[derive(Debug, Args)]
struct ClusterGetArgs {
    #[arg(long)]
    org: String,
    #[arg(long)]
    cluster_id: String,
}

#[derive(Debug, Args)]
struct ClusterListArgs {
    #[arg(long)]
    org: String,
    #[arg(long)]
    limit: Option<u32>,
    #[arg(long)]
    starting_after: Option<i64>,
}

#[derive(Debug, Args)]
struct ClusterSearchArgs {
    #[arg(long)]
    org: String,
    #[arg(long)]
    filter: Option<String>,
    #[arg(long)]
    limit: Option<u32>,
}

#[derive(Debug, Args)]
struct ClusterZombiesArgs {
    #[arg(long)]
    org: String,
    #[arg(long)]
    threshold_seconds: Option<i64>,
    #[arg(long, value_parser = parse_rfc3339)]
    as_of: Option<OffsetDateTime>,
}

fn parse_rfc3339(raw: &str) -> Result<OffsetDateTime, String> {
    OffsetDateTime::parse(raw, &Rfc3339).map_err(|err| format!("expected RFC3339 timestamp: {err}"))
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

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = DirectoryConfig {
        default_page_size: cli.default_page_size,
        max_page_size: cli.max_page_size,
        zombie_threshold: Duration::seconds(cli.zombie_threshold_seconds),
    };
    let api = ClusterDirectoryApi::with_config(cli.db, config)?;
    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Org { command } => run_org(*command, &api),
        Command::Cluster { command } => run_cluster(*command, &api),
    }
}

fn run_db(command: DbCommand, api: &ClusterDirectoryApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit_json(serde_json::to_value(api.migrate(args.dry_run)?)?),
        DbCommand::IntegrityCheck => emit_json(serde_json::to_value(api.integrity_check()?)?),
    }
}

fn run_org(command: OrgCommand, api: &ClusterDirectoryApi) -> Result<()> {
    match command {
        OrgCommand::Create(args) => {
            let id = args.id.as_deref().map(OrgId::parse).transpose()?;
            let org = api.create_local_org(&NewOrganization {
                name: args.name,
                creator_user_id: args.creator,
                id,
            })?;
            emit_json(serde_json::json!({ "organization": org }))
        }
        OrgCommand::Show(args) => {
            let org = api.organization(&OrgId::parse(&args.org)?)?;
            emit_json(serde_json::json!({
                "found": org.is_some(),
                "organization": org
            }))
        }
    }
}

fn run_cluster(command: ClusterCommand, api: &ClusterDirectoryApi) -> Result<()> {
    match command {
        ClusterCommand::Get(args) => {
            let org_id = OrgId::parse(&args.org)?;
            let cluster = api.cluster_by_cluster_id(&org_id, &args.cluster_id)?;
            emit_json(serde_json::json!({
                "org_id": org_id,
                "found": cluster.is_some(),
                "cluster": cluster
            }))
        }
        ClusterCommand::List(args) => {
            let org_id = OrgId::parse(&args.org)?;
            let clusters = api.clusters_by_org_id(
                &org_id,
                &PageRequest {
                    limit: args.limit,
                    starting_after: args.starting_after.map(ClusterRecordId),
                },
            )?;
            let next_starting_after = clusters.last().map(|cluster| cluster.id);
            emit_json(serde_json::json!({
                "org_id": org_id,
                "clusters": clusters,
                "next_starting_after": next_starting_after
            }))
        }
        ClusterCommand::Search(args) => {
            let org_id = OrgId::parse(&args.org)?;
            let clusters = api.cluster_search(
                &org_id,
                &SearchRequest { filter: args.filter, limit: args.limit },
            )?;
            emit_json(serde_json::json!({ "org_id": org_id, "clusters": clusters }))
        }
        ClusterCommand::KubeVersions(args) => {
            let org_id = OrgId::parse(&args.org)?;
            let counts = api.cluster_count_by_kube_version(&org_id)?;
            emit_json(serde_json::json!({ "org_id": org_id, "kube_versions": counts }))
        }
        ClusterCommand::Zombies(args) => {
            let org_id = OrgId::parse(&args.org)?;
            let clusters = api.cluster_zombies(
                &org_id,
                &StalenessRequest { threshold_seconds: args.threshold_seconds, as_of: args.as_of },
            )?;
            emit_json(serde_json::json!({ "org_id": org_id, "clusters": clusters }))
        }
    }
}
