//! tessera CLI - placement admin tool
//!
//! Drives the placement service against a redb store file. Every command
//! prints the resulting placement as JSON on stdout; logs go to stderr.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tessera_common::Config;
use tessera_kv::RedbStore;
use tessera_placement::{
    Instance, KvPlacementStorage, NamespaceOptions, Options, Placement, PlacementService, ServiceId,
    now_nanos, placement_key,
};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type Service = PlacementService<KvPlacementStorage<RedbStore>>;

#[derive(Parser, Debug)]
#[command(name = "tessera-cli")]
#[command(about = "tessera placement admin CLI")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// redb store file (overrides store.path)
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// Service name (overrides service.name)
    #[arg(long)]
    service: Option<String>,

    /// Service environment (overrides service.environment)
    #[arg(long)]
    environment: Option<String>,

    /// Compute placements without writing them
    #[arg(long)]
    dryrun: bool,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build the initial placement
    Init {
        /// Number of shards
        #[arg(long)]
        num_shards: u32,
        /// Replica factor
        #[arg(long)]
        rf: usize,
        /// Candidate instance (repeatable)
        #[arg(short, long = "instance", value_parser = parse_instance, required = true)]
        instances: Vec<Instance>,
    },
    /// Add instances chosen from the candidates
    Add {
        /// Candidate instance (repeatable)
        #[arg(short, long = "instance", value_parser = parse_instance, required = true)]
        instances: Vec<Instance>,
    },
    /// Increase the replica factor by one
    AddReplica,
    /// Remove instances
    Remove {
        /// Instance IDs
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Replace leaving instances with candidates
    Replace {
        /// Leaving instance ID (repeatable)
        #[arg(short, long = "leaving", required = true)]
        leaving: Vec<String>,
        /// Candidate instance (repeatable)
        #[arg(short, long = "instance", value_parser = parse_instance, required = true)]
        instances: Vec<Instance>,
    },
    /// Mark initializing shards available
    MarkAvailable {
        /// Instance ID
        #[arg(required_unless_present = "all")]
        instance: Option<String>,
        /// Shard IDs (all initializing shards of the instance when omitted)
        shards: Vec<u32>,
        /// Mark every initializing shard of every instance available
        #[arg(long, conflicts_with = "instance")]
        all: bool,
    },
    /// Show the current placement
    Show,
    /// Show the placement stored at a version
    History {
        /// Store version
        version: u64,
    },
}

/// Parse `id=..,group=..,zone=..,weight=..,endpoint=..[,host=..,port=..,shardset=..]`
fn parse_instance(s: &str) -> std::result::Result<Instance, String> {
    let mut instance = Instance::default();
    for field in s.split(',').map(str::trim).filter(|f| !f.is_empty()) {
        let (key, value) = field
            .split_once('=')
            .ok_or_else(|| format!("invalid field '{field}', expecting key=value"))?;
        match key {
            "id" => instance.id = value.to_string(),
            "group" => instance.isolation_group = value.to_string(),
            "zone" => instance.zone = value.to_string(),
            "endpoint" => instance.endpoint = value.to_string(),
            "host" => instance.hostname = value.to_string(),
            "weight" => {
                instance.weight = value
                    .parse()
                    .map_err(|_| format!("invalid weight '{value}'"))?;
            }
            "port" => {
                instance.port = value.parse().map_err(|_| format!("invalid port '{value}'"))?;
            }
            "shardset" => {
                instance.shard_set_id = value
                    .parse()
                    .map_err(|_| format!("invalid shard set id '{value}'"))?;
            }
            _ => return Err(format!("unknown field '{key}'")),
        }
    }
    if instance.id.is_empty() {
        return Err("instance id is required".to_string());
    }
    Ok(instance)
}

/// Layer the optional file and `TESSERA__*` environment variables over the
/// defaults
fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path));
    }
    builder
        .add_source(
            config::Environment::with_prefix("TESSERA")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Failed to load configuration")?
        .try_deserialize()
        .context("Invalid configuration")
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(store) = &args.store {
        config.store.path.clone_from(store);
    }
    if let Some(service) = &args.service {
        config.service.name.clone_from(service);
    }
    if let Some(environment) = &args.environment {
        config.service.environment.clone_from(environment);
    }
    if args.dryrun {
        config.placement.dryrun = true;
    }
}

fn options(config: &Config) -> Options {
    let opts = Options::from_config(&config.placement);
    // Staged snapshots need strictly increasing cutovers
    if config.placement.is_staged {
        opts.with_placement_cutover_nanos_fn(now_nanos)
    } else {
        opts
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Serialize)]
struct WithAdded<'a> {
    placement: &'a Placement,
    added: &'a [Instance],
}

fn run(svc: &Service, command: Commands) -> Result<()> {
    match command {
        Commands::Init {
            num_shards,
            rf,
            instances,
        } => {
            let p = svc
                .build_initial_placement(&instances, num_shards, rf)
                .context("Failed to build initial placement")?;
            print_json(&p)
        }
        Commands::Add { instances } => {
            let (p, added) = svc
                .add_instances(&instances)
                .context("Failed to add instances")?;
            print_json(&WithAdded {
                placement: &p,
                added: &added,
            })
        }
        Commands::AddReplica => {
            let p = svc.add_replica().context("Failed to add replica")?;
            print_json(&p)
        }
        Commands::Remove { ids } => {
            let p = svc
                .remove_instances(&ids)
                .context("Failed to remove instances")?;
            print_json(&p)
        }
        Commands::Replace { leaving, instances } => {
            let (p, added) = svc
                .replace_instances(&leaving, &instances)
                .context("Failed to replace instances")?;
            print_json(&WithAdded {
                placement: &p,
                added: &added,
            })
        }
        Commands::MarkAvailable {
            instance,
            shards,
            all,
        } => {
            let p = match (instance, all) {
                (_, true) => svc.mark_all_shards_available(),
                (Some(id), false) if shards.is_empty() => svc.mark_instance_available(&id),
                (Some(id), false) => svc.mark_shards_available(&id, &shards),
                (None, false) => bail!("an instance or --all is required"),
            }
            .context("Failed to mark shards available")?;
            print_json(&p)
        }
        Commands::Show => {
            let p = svc.placement().context("Failed to read placement")?;
            print_json(&p)
        }
        Commands::History { version } => {
            let p = svc
                .store()
                .placement_for_version(version)
                .with_context(|| format!("Failed to read placement at version {version}"))?;
            print_json(&p)
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = load_config(args.config.as_deref())?;
    apply_overrides(&mut config, &args);
    debug!("Loaded configuration: {:?}", config);

    let sid = ServiceId::from(&config.service);
    let key = placement_key(&NamespaceOptions::from(&config.namespaces), &sid);
    let store = RedbStore::open(&config.store.path)
        .with_context(|| format!("Failed to open store {}", config.store.path.display()))?;
    info!("Using placement {} for service {}", key, sid);

    let opts = options(&config);
    let svc = PlacementService::new(KvPlacementStorage::new(store, key, opts.clone()), opts);
    run(&svc, args.command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_instance() {
        let i = parse_instance("id=i1,group=r1,zone=z1,weight=3,endpoint=h1:9000").unwrap();
        assert_eq!(i.id, "i1");
        assert_eq!(i.isolation_group, "r1");
        assert_eq!(i.zone, "z1");
        assert_eq!(i.weight, 3);
        assert_eq!(i.endpoint, "h1:9000");

        let i = parse_instance("id=i2, host=h2, port=9001, shardset=4").unwrap();
        assert_eq!(i.hostname, "h2");
        assert_eq!(i.port, 9001);
        assert_eq!(i.shard_set_id, 4);
    }

    #[test]
    fn test_parse_instance_errors() {
        assert!(parse_instance("group=r1").is_err());
        assert!(parse_instance("id=i1,weight=heavy").is_err());
        assert!(parse_instance("id=i1,rack=r1").is_err());
        assert!(parse_instance("id=i1,group").is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[service]\nname = \"metrics\"\nenvironment = \"prod\"\n\n[placement]\nis_mirrored = true"
        )
        .unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.service.name, "metrics");
        assert!(config.placement.is_mirrored);
        assert!(config.placement.allow_partial_replace);

        let key = placement_key(
            &NamespaceOptions::from(&config.namespaces),
            &ServiceId::from(&config.service),
        );
        assert_eq!(key, "_sd.placement/prod/metrics");
    }

    #[test]
    fn test_cli_parses_commands() {
        let args = Args::parse_from([
            "tessera-cli",
            "--store",
            "/tmp/p.redb",
            "replace",
            "--leaving",
            "i1",
            "--instance",
            "id=i9,group=r1,zone=z1,weight=1,endpoint=h9:1",
        ]);
        let Commands::Replace { leaving, instances } = args.command else {
            panic!("expected replace");
        };
        assert_eq!(leaving, vec!["i1".to_string()]);
        assert_eq!(instances[0].id, "i9");

        let args = Args::parse_from(["tessera-cli", "mark-available", "--all"]);
        assert!(matches!(args.command, Commands::MarkAvailable { all: true, .. }));
        assert!(Args::try_parse_from(["tessera-cli", "mark-available"]).is_err());
    }

    #[test]
    fn test_commands_against_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        let opts = options(&config);
        let store = RedbStore::open(dir.path().join("p.redb")).unwrap();
        let svc = PlacementService::new(KvPlacementStorage::new(store, "_sd.placement/t", opts.clone()), opts);

        let instances = vec![
            parse_instance("id=a,group=g1,zone=z1,weight=1,endpoint=a:1").unwrap(),
            parse_instance("id=b,group=g2,zone=z1,weight=1,endpoint=b:1").unwrap(),
        ];
        run(
            &svc,
            Commands::Init {
                num_shards: 4,
                rf: 2,
                instances,
            },
        )
        .unwrap();
        run(
            &svc,
            Commands::MarkAvailable {
                instance: None,
                shards: vec![],
                all: true,
            },
        )
        .unwrap();
        run(&svc, Commands::History { version: 1 }).unwrap();
        assert_eq!(svc.placement().unwrap().version, 2);
        assert!(run(&svc, Commands::Remove { ids: vec!["zz".to_string()] }).is_err());
    }
}
