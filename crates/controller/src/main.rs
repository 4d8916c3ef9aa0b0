use anyhow::{anyhow, Context, Result};
use base64::prelude::*;
use clap::{Parser, Subcommand};
use controller::{
    ControllerConfig, CreateFunctionRequest, FunctionService, InvocationService, InvokeRequest,
    UpdateFunctionRequest,
};
use metadata::{
    ExecutionStatus, FunctionFilter, InvocationFilter, RuntimeKind, SeaOrmMetadataStore,
    EXECUTION_QUEUE,
};
use queue::{Queue, RedisQueue};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use storage::LocalCodeStore;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "controller", about = "FaaS control plane", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new function version.
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        version: String,
        /// One of: go, python, nodejs.
        #[arg(long)]
        runtime: String,
        #[arg(long)]
        handler: String,
        /// Path to the source file.
        #[arg(long, conflicts_with = "code_base64")]
        code_file: Option<PathBuf>,
        /// Base64-encoded source.
        #[arg(long)]
        code_base64: Option<String>,
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
        #[arg(long, default_value_t = 128)]
        memory_mb: u32,
        #[arg(long, default_value_t = 1)]
        concurrency: u32,
        /// KEY=VALUE environment entries; repeatable.
        #[arg(long = "env")]
        environment: Vec<String>,
    },
    /// Show a function by id, or by --name and --version.
    Get {
        id: Option<String>,
        #[arg(long, requires = "version")]
        name: Option<String>,
        #[arg(long)]
        version: Option<String>,
    },
    /// List registered functions.
    List {
        #[arg(long)]
        runtime: Option<String>,
        #[arg(long)]
        limit: Option<u64>,
        #[arg(long)]
        offset: Option<u64>,
    },
    /// Update a function; omitted fields keep their values.
    Update {
        id: String,
        #[arg(long)]
        handler: Option<String>,
        #[arg(long)]
        code_file: Option<PathBuf>,
        #[arg(long)]
        timeout_secs: Option<u64>,
        #[arg(long)]
        memory_mb: Option<u32>,
        #[arg(long)]
        concurrency: Option<u32>,
    },
    /// Delete a function and its stored code.
    Delete { id: String },
    /// Invoke a function asynchronously; prints the invocation handle.
    Invoke {
        #[arg(long)]
        function_id: String,
        /// JSON payload.
        #[arg(long, default_value = "null")]
        payload: String,
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Fetch an invocation and its result.
    Result { invocation_id: String },
    /// List invocations.
    Invocations {
        #[arg(long)]
        function_id: Option<String>,
        /// One of: pending, running, completed, failed, timeout.
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        limit: Option<u64>,
        #[arg(long)]
        offset: Option<u64>,
    },
    /// Execution queue bucket sizes.
    Stats,
    /// Show dead-lettered execution requests, newest first.
    DeadLetters,
    /// Move orphaned in-flight messages back to ready.
    Reclaim,
    /// Re-enqueue PENDING invocations older than the threshold.
    Sweep {
        #[arg(long, default_value_t = 300)]
        older_than_secs: u64,
    },
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn parse_env_pairs(pairs: &[String]) -> Result<HashMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| anyhow!("invalid KEY=VALUE pair: {pair}"))
        })
        .collect()
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

struct Services {
    functions: FunctionService,
    invocations: InvocationService,
    queue: Arc<dyn Queue>,
}

async fn services(config: &ControllerConfig) -> Result<Services> {
    let store = Arc::new(SeaOrmMetadataStore::connect(&config.database_url).await?);
    let queue: Arc<dyn Queue> =
        Arc::new(RedisQueue::new(&config.redis_url, &config.queue_prefix)?);
    let code_store = Arc::new(LocalCodeStore::new(&config.code_store_path).await?);

    Ok(Services {
        functions: FunctionService::new(store.clone(), code_store),
        invocations: InvocationService::new(store, queue.clone()),
        queue,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging();

    let cli = Cli::parse();
    let config = ControllerConfig::from_env()?;
    let services = services(&config).await?;

    match cli.command {
        Commands::Register {
            name,
            version,
            runtime,
            handler,
            code_file,
            code_base64,
            timeout_secs,
            memory_mb,
            concurrency,
            environment,
        } => {
            let code = match (code_file, code_base64) {
                (Some(path), None) => std::fs::read(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                (None, Some(encoded)) => BASE64_STANDARD
                    .decode(encoded)
                    .context("invalid base64 code")?,
                _ => return Err(anyhow!("provide exactly one of --code-file, --code-base64")),
            };

            let function = services
                .functions
                .create(CreateFunctionRequest {
                    name,
                    version,
                    runtime: runtime
                        .parse::<RuntimeKind>()
                        .map_err(|e| anyhow!(e))?,
                    handler,
                    code,
                    timeout: Duration::from_secs(timeout_secs),
                    memory_mb,
                    concurrency,
                    environment: parse_env_pairs(&environment)?,
                    metadata: HashMap::new(),
                })
                .await?;
            print_json(&function)
        }

        Commands::Get { id, name, version } => {
            let function = match (id, name, version) {
                (Some(id), None, _) => services.functions.get(&id).await?,
                (None, Some(name), Some(version)) => {
                    services.functions.get_by_name(&name, &version).await?
                }
                _ => return Err(anyhow!("provide an id, or --name with --version")),
            };
            print_json(&function)
        }

        Commands::List {
            runtime,
            limit,
            offset,
        } => {
            let filter = FunctionFilter {
                runtime: runtime
                    .map(|r| r.parse::<RuntimeKind>().map_err(|e| anyhow!(e)))
                    .transpose()?,
                limit,
                offset,
            };
            print_json(&services.functions.list(&filter).await?)
        }

        Commands::Update {
            id,
            handler,
            code_file,
            timeout_secs,
            memory_mb,
            concurrency,
        } => {
            let code = code_file
                .map(|path| {
                    std::fs::read(&path)
                        .with_context(|| format!("failed to read {}", path.display()))
                })
                .transpose()?;

            let function = services
                .functions
                .update(
                    &id,
                    UpdateFunctionRequest {
                        handler,
                        code,
                        timeout: timeout_secs.map(Duration::from_secs),
                        memory_mb,
                        concurrency,
                        environment: None,
                    },
                )
                .await?;
            print_json(&function)
        }

        Commands::Delete { id } => {
            services.functions.delete(&id).await?;
            println!("deleted {id}");
            Ok(())
        }

        Commands::Invoke {
            function_id,
            payload,
            timeout_secs,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("payload must be valid JSON")?;
            let handle = services
                .invocations
                .invoke_async(InvokeRequest {
                    function_id,
                    payload,
                    headers: HashMap::new(),
                    timeout: timeout_secs.map(Duration::from_secs),
                })
                .await?;
            print_json(&handle)
        }

        Commands::Result { invocation_id } => {
            print_json(&services.invocations.get_result(&invocation_id).await?)
        }

        Commands::Invocations {
            function_id,
            status,
            limit,
            offset,
        } => {
            let filter = InvocationFilter {
                function_id,
                status: status
                    .map(|s| s.parse::<ExecutionStatus>().map_err(|e| anyhow!(e)))
                    .transpose()?,
                limit,
                offset,
            };
            print_json(&services.invocations.list(&filter).await?)
        }

        Commands::Stats => print_json(&services.queue.stats(EXECUTION_QUEUE).await?),

        Commands::DeadLetters => {
            print_json(&services.queue.dead_letters(EXECUTION_QUEUE).await?)
        }

        Commands::Reclaim => {
            let moved = services.queue.reclaim(EXECUTION_QUEUE).await?;
            println!("reclaimed {moved} messages");
            Ok(())
        }

        Commands::Sweep { older_than_secs } => {
            let requeued = services
                .invocations
                .sweep_pending(Duration::from_secs(older_than_secs))
                .await?;
            println!("requeued {requeued} pending invocations");
            Ok(())
        }
    }
}
