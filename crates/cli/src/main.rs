mod input;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use rekon_api::{Reconciler, RunFailure, RunReport};
use rekon_core::capabilities::CapabilityTable;
use rekon_core::{object, ConditionStatus, DesiredState, MergeStrategy, ReconcileOptions, ValidateOptions, Validator, WaitCondition};
use rekon_kubehub::KubeCluster;
use rekon_schema::SchemaValidator;
use serde_json::{json, Value as Json};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "rekonctl", version, about = "Reconcile cluster objects to a declared state")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, env = "REKON_OUTPUT", default_value_t = Output::Human)]
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
    /// Create, patch or delete objects until the cluster matches the definitions
    Reconcile(ReconcileArgs),
    /// Validate definitions against their CRD schema without touching the cluster objects
    Validate {
        /// YAML files with one or more definitions ("-" for stdin)
        #[arg(short = 'f', long = "src", required = true)]
        src: Vec<PathBuf>,
        /// Schema version to validate against
        #[arg(long = "version")]
        version: Option<String>,
        /// Do not report fields the schema does not declare
        #[arg(long = "no-strict", action = ArgAction::SetTrue)]
        no_strict: bool,
    },
    /// Print the content-hashed name of each definition
    Hash {
        #[arg(short = 'f', long = "src", required = true)]
        src: Vec<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct ReconcileArgs {
    /// YAML files with one or more definitions ("-" for stdin)
    #[arg(short = 'f', long = "src")]
    src: Vec<PathBuf>,
    /// Params file with reconcile options; flags override it
    #[arg(long = "params")]
    params: Option<PathBuf>,
    /// present | absent
    #[arg(long = "state")]
    state: Option<DesiredState>,
    #[arg(long = "name")]
    name: Option<String>,
    #[arg(short = 'n', long = "namespace", env = "REKON_NAMESPACE")]
    namespace: Option<String>,
    #[arg(long = "api-version")]
    api_version: Option<String>,
    #[arg(long = "kind")]
    kind: Option<String>,
    /// Patch strategy to try, in order (json | merge | strategic-merge); repeatable
    #[arg(long = "merge-type")]
    merge_type: Vec<MergeStrategy>,
    /// Three-way apply using the last-applied annotation
    #[arg(long = "apply", action = ArgAction::SetTrue)]
    apply: bool,
    /// Suffix ConfigMap/Secret names with a hash of their content
    #[arg(long = "append-hash", action = ArgAction::SetTrue)]
    append_hash: bool,
    #[arg(long = "wait", action = ArgAction::SetTrue)]
    wait: bool,
    /// Seconds between wait polls
    #[arg(long = "wait-sleep")]
    wait_sleep: Option<u64>,
    /// Seconds before a wait gives up
    #[arg(long = "wait-timeout")]
    wait_timeout: Option<u64>,
    /// Condition type to wait for (e.g. Available, Complete)
    #[arg(long = "wait-condition")]
    wait_condition: Option<String>,
    #[arg(long = "wait-condition-status", default_value = "True")]
    wait_condition_status: ConditionStatus,
    #[arg(long = "wait-condition-reason")]
    wait_condition_reason: Option<String>,
    /// Validate definitions against their schema before writing
    #[arg(long = "validate", action = ArgAction::SetTrue)]
    validate: bool,
    /// Fail on validation findings instead of warning
    #[arg(long = "validate-fail", action = ArgAction::SetTrue)]
    validate_fail: bool,
    #[arg(long = "validate-version")]
    validate_version: Option<String>,
    #[arg(long = "validate-no-strict", action = ArgAction::SetTrue)]
    validate_no_strict: bool,
    /// Report what would change without writing
    #[arg(long = "check", action = ArgAction::SetTrue)]
    check: bool,
}

impl ReconcileArgs {
    /// Options from the params file (or defaults) with flags applied on top.
    fn options(&self) -> Result<ReconcileOptions> {
        let mut opts = match &self.params {
            Some(p) => input::load_params(p)?,
            None => ReconcileOptions::default(),
        };
        if !self.src.is_empty() {
            let docs = input::load_definitions(&self.src)?;
            if docs.is_empty() {
                return Err(anyhow!("no definitions found in {:?}", self.src));
            }
            opts.definition = Some(Json::Array(docs));
        }
        if let Some(s) = self.state {
            opts.state = s;
        }
        set(&mut opts.name, &self.name);
        set(&mut opts.namespace, &self.namespace);
        set(&mut opts.api_version, &self.api_version);
        set(&mut opts.kind, &self.kind);
        if !self.merge_type.is_empty() {
            opts.merge_type = self.merge_type.clone();
        }
        opts.apply |= self.apply;
        opts.append_hash |= self.append_hash;
        opts.wait |= self.wait;
        opts.check_mode |= self.check;
        if let Some(s) = self.wait_sleep {
            opts.wait_sleep = s;
        }
        if let Some(t) = self.wait_timeout {
            opts.wait_timeout = t;
        }
        if let Some(type_) = &self.wait_condition {
            opts.wait_condition = Some(WaitCondition {
                type_: type_.clone(),
                status: self.wait_condition_status,
                reason: self.wait_condition_reason.clone(),
            });
        }
        if self.validate || self.validate_fail || self.validate_version.is_some() {
            let v = opts.validate.get_or_insert_with(ValidateOptions::default);
            v.fail_on_error |= self.validate_fail;
            set(&mut v.version, &self.validate_version);
            if self.validate_no_strict {
                v.strict = false;
            }
        }
        Ok(opts)
    }
}

fn set(slot: &mut Option<String>, flag: &Option<String>) {
    if flag.is_some() {
        slot.clone_from(flag);
    }
}

fn init_tracing() {
    let env = std::env::var("REKON_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("REKON_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid REKON_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Reconcile(args) => {
            let opts = args.options()?;
            let cluster = KubeCluster::connect().await?;
            let mut reconciler = Reconciler::new(cluster);
            if opts.validate.is_some() {
                let validator = SchemaValidator::new(reconciler.client().client().clone());
                reconciler = reconciler.with_validator(Arc::new(validator));
            }
            let outcome = tokio::select! {
                r = reconciler.run(&opts) => r,
                _ = signal::ctrl_c() => {
                    warn!("interrupted; objects may be partially reconciled");
                    std::process::exit(130);
                }
            };
            match outcome {
                Ok(report) => print_report(cli.output, &report)?,
                Err(failure) => {
                    print_failure(cli.output, &failure)?;
                    std::process::exit(1);
                }
            }
        }
        Commands::Validate { src, version, no_strict } => {
            let docs = input::load_definitions(&src)?;
            let validator = SchemaValidator::connect().await?;
            let mut failed = false;
            let mut rows = Vec::new();
            for doc in &docs {
                let issues = validator
                    .validate(doc, version.as_deref(), !no_strict)
                    .await
                    .with_context(|| format!("validating {}", label(doc)))?;
                failed |= !issues.is_empty();
                match cli.output {
                    Output::Human if issues.is_empty() => println!("{}: valid", label(doc)),
                    Output::Human => {
                        for i in &issues {
                            println!("{}: {}", label(doc), i.render());
                        }
                    }
                    Output::Json => rows.push(json!({ "object": label(doc), "issues": issues })),
                }
            }
            if cli.output == Output::Json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            }
            if failed {
                std::process::exit(1);
            }
        }
        Commands::Hash { src } => {
            let caps = CapabilityTable::default();
            for mut doc in input::load_definitions(&src)? {
                let kind = object::kind(&doc).unwrap_or_default().to_string();
                let Some(fields) = caps.lookup(&kind).hash_fields else {
                    warn!(kind = %kind, "kind is not hashable; skipped");
                    continue;
                };
                let name = rekon_apply::append_hash(&mut doc, fields)?;
                match cli.output {
                    Output::Human => println!("{}/{}", kind, name),
                    Output::Json => println!("{}", json!({ "kind": kind, "name": name })),
                }
            }
        }
    }

    Ok(())
}

fn label(v: &Json) -> String {
    let kind = object::kind(v).unwrap_or("?");
    let name = object::name(v).unwrap_or("?");
    match object::namespace(v) {
        Some(ns) => format!("{} {}/{}", kind, ns, name),
        None => format!("{} {}", kind, name),
    }
}

fn print_report(output: Output, report: &RunReport) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(report)?),
        Output::Human => {
            for r in &report.results {
                let mut line = format!("{:<9} {}", r.method, label(&r.result));
                if let Some(d) = &r.diff {
                    line.push_str(&format!("  (+{} ~{} -{})", d.adds, d.updates, d.removes));
                }
                if let Some(secs) = r.duration {
                    line.push_str(&format!("  waited {}s", secs));
                }
                println!("{}", line);
                for w in &r.warnings {
                    println!("  warning: {}", w);
                }
            }
            println!("changed: {}", report.changed);
        }
    }
    Ok(())
}

fn print_failure(output: Output, failure: &RunFailure) -> Result<()> {
    match output {
        Output::Json => {
            let out = json!({
                "changed": failure.changed(),
                "completed": failure.completed,
                "failed": failure.failure.to_json(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Output::Human => {
            for r in &failure.completed {
                println!("{:<9} {}", r.method, label(&r.result));
            }
            eprintln!("error: {}", failure.failure);
            if let rekon_api::ReconcileError::Validation { issues, .. } = &failure.failure.error {
                for i in issues {
                    eprintln!("  {}", i.render());
                }
            }
            println!("changed: {}", failure.changed());
        }
    }
    Ok(())
}
