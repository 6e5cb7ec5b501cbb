use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use rudder_core::{ApplyOptions, FixedImage, InclusionFilter};
use rudder_engine::{run_deployment, CommandResult, TracingReporter};
use rudder_kube::KubeClient;
use rudder_store::{NullResultStore, ResultStore, SecretResultStore};

#[derive(Parser, Debug)]
#[command(name = "rudderctl", version, about = "Rudder deployment CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Deploy a project to the current cluster context
    Deploy(DeployArgs),
}

#[derive(clap::Args, Debug)]
struct DeployArgs {
    /// Project directory containing deployment.yaml
    #[arg(default_value = ".")]
    dir: PathBuf,

    /// Send every mutation with the server-side dry-run directive
    #[arg(long, action = ArgAction::SetTrue)]
    dry_run: bool,

    /// Overwrite fields owned by other managers instead of resolving
    #[arg(long, action = ArgAction::SetTrue)]
    force_apply: bool,

    /// Retry failed patches with a full-object update
    #[arg(long, action = ArgAction::SetTrue)]
    replace_on_error: bool,

    /// Retry failed updates by deleting and re-creating the object
    #[arg(long, action = ArgAction::SetTrue)]
    force_replace_on_error: bool,

    /// Stop scheduling further items after the first error
    #[arg(long, action = ArgAction::SetTrue)]
    abort_on_error: bool,

    /// Per-hook readiness deadline in seconds (0 = unbounded)
    #[arg(long, default_value_t = 0)]
    hook_timeout: u64,

    /// Project-wide deadline in seconds
    #[arg(long, default_value_t = 600)]
    timeout: u64,

    /// Only deploy items carrying this tag (repeatable)
    #[arg(short = 'I', long = "include-tag")]
    include_tags: Vec<String>,

    /// Skip items carrying this tag (repeatable)
    #[arg(short = 'E', long = "exclude-tag")]
    exclude_tags: Vec<String>,

    /// Only deploy items under this bundle dir (repeatable)
    #[arg(long = "include-dir")]
    include_dirs: Vec<String>,

    /// Skip items under this bundle dir (repeatable)
    #[arg(long = "exclude-dir")]
    exclude_dirs: Vec<String>,

    /// Image pin as repo=image:tag (repeatable)
    #[arg(long = "fixed-image")]
    fixed_images: Vec<String>,

    /// YAML file with a list of {image, resultImage} pins
    #[arg(long)]
    fixed_images_file: Option<PathBuf>,

    /// Persist the command result as a cluster Secret
    #[arg(long, action = ArgAction::SetTrue)]
    write_result: bool,

    /// Namespace for persisted command results
    #[arg(long, default_value = "rudder-results")]
    result_namespace: String,
}

fn init_tracing() {
    let directives = std::env::var("RUDDER_LOG").unwrap_or_default();
    let filter = match directives.as_str() {
        "" => tracing_subscriber::EnvFilter::new("info"),
        spec => tracing_subscriber::EnvFilter::try_new(spec).unwrap_or_else(|e| {
            eprintln!("ignoring RUDDER_LOG {spec:?}: {e}");
            tracing_subscriber::EnvFilter::new("info")
        }),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn init_metrics() {
    let Ok(addr) = std::env::var("RUDDER_METRICS_ADDR") else {
        return;
    };
    let listen: std::net::SocketAddr = match addr.parse() {
        Ok(a) => a,
        Err(e) => {
            warn!(addr = %addr, error = %e, "RUDDER_METRICS_ADDR is not a socket address, exporter disabled");
            return;
        }
    };
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(listen)
        .install()
    {
        Ok(()) => info!(listen = %listen, "serving Prometheus metrics"),
        Err(e) => warn!(listen = %listen, error = %e, "metrics exporter failed to start"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();

    let cli = Cli::parse();
    match cli.command {
        Commands::Deploy(args) => {
            let result = deploy(&args).await?;
            match cli.output {
                Output::Human => print_summary(&result),
                Output::Json => println!("{}", serde_json::to_string_pretty(&result)?),
            }
            if !result.exit_ok() {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

async fn deploy(args: &DeployArgs) -> Result<CommandResult> {
    let images = collect_fixed_images(args)?;

    let client = Arc::new(KubeClient::try_default().await?);
    let collection = rudder_project::load_project(&args.dir, Some(client.as_ref()), images)
        .await
        .with_context(|| format!("loading project {}", args.dir.display()))?;

    let opts = ApplyOptions {
        force_apply: args.force_apply,
        replace_on_error: args.replace_on_error,
        force_replace_on_error: args.force_replace_on_error,
        dry_run: args.dry_run,
        abort_on_error: args.abort_on_error,
        hook_timeout: Duration::from_secs(args.hook_timeout),
        ..Default::default()
    };
    let inclusion = InclusionFilter {
        include_tags: args.include_tags.iter().cloned().collect(),
        exclude_tags: args.exclude_tags.iter().cloned().collect(),
        include_dirs: args.include_dirs.iter().cloned().collect(),
        exclude_dirs: args.exclude_dirs.iter().cloned().collect(),
    };

    let project = args.dir.display().to_string();
    let run = run_deployment(
        client.clone(),
        &collection,
        opts,
        &inclusion,
        Arc::new(TracingReporter),
        &project,
    );

    let result = tokio::select! {
        res = tokio::time::timeout(Duration::from_secs(args.timeout), run) => {
            res.map_err(|_| anyhow!("deployment timed out after {}s", args.timeout))?
        }
        _ = tokio::signal::ctrl_c() => {
            bail!("interrupted");
        }
    };

    let store: Box<dyn ResultStore> = if args.write_result {
        Box::new(SecretResultStore::new(client.clone(), args.result_namespace.clone()))
    } else {
        Box::new(NullResultStore)
    };
    store.write_command_result(&result).await?;

    Ok(result)
}

fn collect_fixed_images(args: &DeployArgs) -> Result<Vec<FixedImage>> {
    let mut images = Vec::new();
    if let Some(file) = &args.fixed_images_file {
        let text = std::fs::read_to_string(file)
            .with_context(|| format!("reading {}", file.display()))?;
        let mut from_file: Vec<FixedImage> = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", file.display()))?;
        images.append(&mut from_file);
    }
    for spec in &args.fixed_images {
        images.push(parse_fixed_image(spec)?);
    }
    Ok(images)
}

fn parse_fixed_image(spec: &str) -> Result<FixedImage> {
    let (image, result_image) = spec
        .split_once('=')
        .ok_or_else(|| anyhow!("invalid --fixed-image {spec:?} (expect repo=image:tag)"))?;
    if image.is_empty() || result_image.is_empty() {
        bail!("invalid --fixed-image {spec:?} (expect repo=image:tag)");
    }
    Ok(FixedImage { image: image.to_string(), result_image: result_image.to_string() })
}

fn print_summary(result: &CommandResult) {
    let mode = if result.dry_run { " (dry run)" } else { "" };
    println!(
        "Deployment finished{}: {} new, {} changed, {} deleted, {} hooks",
        mode,
        result.new_objects.len(),
        result.changed_objects.len(),
        result.deleted_objects.len(),
        result.hook_objects.len(),
    );
    for w in &result.warnings {
        println!("  warning {}: {}", w.reference, w.message);
    }
    for e in &result.errors {
        println!("  error {}: {}", e.reference, e.message);
    }
}
