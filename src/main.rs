use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::info;

use lineage::config::{load_config, AppConfig};
use lineage::engine::Engine;
use lineage::error::OperationResult;
use lineage::model::version::{AiParameters, NewVersion, UsageKind, VersionType};
use lineage::query::comparison::generate_comparison_report;
use lineage::query::history::StatisticsScope;
use lineage::store::integrity::check_integrity;
use lineage::store::snapshot::{
    ExportFormat, ExportOptions, ImportMode, ImportOptions, JsonFileSnapshotStore, SnapshotStore,
};
use lineage::store::{BranchManager, VersionStore};

/// Lineage: version graphs for AI-generated images
#[derive(Parser)]
#[command(name = "lineage")]
#[command(
    about = "Track AI image generations as version trees with branches, comparisons and usage statistics."
)]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "LINEAGE_CONFIG")]
    config: Option<PathBuf>,
    /// Snapshot file to operate on (defaults to storage.snapshot_path)
    #[arg(short, long, global = true)]
    snapshot: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a sample lineage and walk through the main operations
    Demo {
        /// Write the demo state to the snapshot file
        #[arg(long)]
        save: bool,
    },
    /// Print aggregate statistics as JSON
    Stats {
        /// Restrict to one image's lineage
        #[arg(short, long)]
        root: Option<String>,
    },
    /// Render version trees
    Tree {
        /// Root version id; every lineage when omitted
        root: Option<String>,
        /// Maximum depth to render
        #[arg(short, long)]
        depth: Option<usize>,
    },
    /// Compare two versions and print the report
    Compare { a: String, b: String },
    /// Print the history bundle of one image as JSON
    History { root: String },
    /// Export versions to a file
    Export {
        #[arg(short, long)]
        output: PathBuf,
        #[arg(short, long, value_enum, default_value_t = FormatArg::Json)]
        format: FormatArg,
        /// Export one lineage only
        #[arg(short, long)]
        root: Option<String>,
        #[arg(long)]
        no_branches: bool,
        #[arg(long)]
        pretty: bool,
    },
    /// Import versions from a file into the snapshot
    Import {
        input: PathBuf,
        #[arg(short, long, value_enum, default_value_t = FormatArg::Json)]
        format: FormatArg,
        /// Add to the current state instead of replacing it
        #[arg(long)]
        merge: bool,
    },
    /// Verify structural invariants of the snapshot
    Check,
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Json,
    Binary,
}

impl From<FormatArg> for ExportFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Json => ExportFormat::Json,
            FormatArg::Binary => ExportFormat::Binary,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    lineage::logging::init(&config.logging)?;

    let path = cli
        .snapshot
        .clone()
        .unwrap_or_else(|| config.storage.snapshot_path.clone());
    let store = JsonFileSnapshotStore::new(path);

    match cli.command {
        Commands::Demo { save } => {
            let engine = run_demo(&config)?;
            if save {
                store.save(&engine.snapshot()?).await?;
                println!("\nDemo state saved to {}", store.path().display());
            }
        }
        Commands::Stats { root } => {
            let engine = load_engine(&config, &store).await?;
            let scope = root.map_or(StatisticsScope::All, StatisticsScope::Lineage);
            let stats = engine.get_statistics(&scope)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Tree { root, depth } => {
            let engine = load_engine(&config, &store).await?;
            let roots: Vec<String> = match root {
                Some(root) => vec![root],
                None => engine.versions().roots().iter().map(|v| v.id.clone()).collect(),
            };
            if roots.is_empty() {
                println!("No versions yet.");
            }
            for root in roots {
                let tree = engine.build_version_tree(&root, depth)?;
                println!(
                    "{} version(s), max depth {}",
                    tree.total_versions, tree.max_depth
                );
                print!("{}", tree.render());
            }
        }
        Commands::Compare { a, b } => {
            let engine = load_engine(&config, &store).await?;
            let comparison = engine.compare_versions(&a, &b)?;
            println!("{}", generate_comparison_report(&comparison));
        }
        Commands::History { root } => {
            let engine = load_engine(&config, &store).await?;
            let history = engine.get_version_history(&root)?;
            println!("{}", serde_json::to_string_pretty(&history)?);
        }
        Commands::Export {
            output,
            format,
            root,
            no_branches,
            pretty,
        } => {
            let engine = load_engine(&config, &store).await?;
            let options = ExportOptions {
                format: format.into(),
                root_version_id: root,
                include_branches: !no_branches,
                pretty,
            };
            let bytes = engine.export_versions(&options)?;
            tokio::fs::write(&output, &bytes)
                .await
                .with_context(|| format!("writing {}", output.display()))?;
            println!("Exported {} bytes to {}", bytes.len(), output.display());
        }
        Commands::Import {
            input,
            format,
            merge,
        } => {
            let mut engine = load_engine(&config, &store).await?;
            let bytes = tokio::fs::read(&input)
                .await
                .with_context(|| format!("reading {}", input.display()))?;
            let options = ImportOptions {
                format: format.into(),
                mode: if merge {
                    ImportMode::Merge
                } else {
                    ImportMode::Replace
                },
            };
            let result = succeeded(engine.import_versions(&bytes, options))?;
            store.save(&engine.snapshot()?).await?;
            println!("{}", result.message);
        }
        Commands::Check => {
            // Inspect the raw records; loading an engine would reject them.
            let Some(snapshot) = store.load().await? else {
                println!("No snapshot at {}", store.path().display());
                return Ok(());
            };
            let versions = VersionStore::from_records(snapshot.versions.into_values());
            let branches = BranchManager::from_records(
                snapshot.branches.into_values(),
                snapshot.active_branch_id,
                config.engine.protected_branches.clone(),
            );
            let issues = check_integrity(&versions, &branches);
            if issues.is_empty() {
                println!(
                    "OK: {} version(s), {} branch(es)",
                    versions.len(),
                    branches.len()
                );
            } else {
                for issue in &issues {
                    println!("  {}", issue);
                }
                bail!("{} integrity issue(s) found", issues.len());
            }
        }
    }

    Ok(())
}

async fn load_engine(config: &AppConfig, store: &JsonFileSnapshotStore) -> anyhow::Result<Engine> {
    match store.load().await? {
        Some(snapshot) => Engine::from_snapshot(config, snapshot)
            .with_context(|| format!("loading {}", store.path().display())),
        None => {
            info!(path = %store.path().display(), "no snapshot found, starting empty");
            Ok(Engine::new(config))
        }
    }
}

fn succeeded(result: OperationResult) -> anyhow::Result<OperationResult> {
    if !result.success {
        bail!("{}", result.message);
    }
    Ok(result)
}

fn created(result: OperationResult) -> anyhow::Result<String> {
    let result = succeeded(result)?;
    result
        .version_id
        .context("operation did not report a version id")
}

fn run_demo(config: &AppConfig) -> anyhow::Result<Engine> {
    println!("=== Lineage Demo: Image Version Graphs ===\n");
    let mut engine = Engine::new(config);

    let params = AiParameters {
        model: Some("sdxl-1.0".into()),
        provider: Some("stability".into()),
        seed: Some(42),
        guidance: Some(7.5),
        steps: Some(30),
        enhance: Some(false),
        style: Some("photographic".into()),
    };

    // --- Phase 1: a lineage on main ---
    println!("Phase 1: Creating a lineage on the default branch...");
    let v1 = created(
        engine.create_version(
            NewVersion::root("a cat sitting on a windowsill")
                .with_title("Windowsill cat")
                .with_tag("cat")
                .with_parameters(params.clone())
                .with_dimensions(1024, 1024)
                .with_file_size(1_250_000)
                .with_generation_time(5_400),
        ),
    )?;
    let v2 = created(
        engine.create_version(
            NewVersion::child_of(&v1, "a cat sitting on a windowsill, golden hour")
                .with_title("Golden hour")
                .with_type(VersionType::Revision)
                .with_tag("cat")
                .with_tag("sunset")
                .with_parameters(AiParameters {
                    steps: Some(40),
                    ..params.clone()
                })
                .with_dimensions(1024, 1024)
                .with_file_size(1_410_000)
                .with_generation_time(6_900),
        ),
    )?;
    println!("  v1 {} / v2 {}", v1, v2);

    // --- Phase 2: a side branch ---
    println!("\nPhase 2: Branching 'watercolor' off v1...");
    let watercolor = succeeded(engine.create_branch("watercolor", &v1))?
        .branch_id
        .context("branch id missing")?;
    let v3 = created(
        engine.create_version(
            NewVersion::child_of(&v1, "a cat sitting on a windowsill, watercolor")
                .with_title("Watercolor cat")
                .with_tag("cat")
                .with_parameters(AiParameters {
                    style: Some("watercolor".into()),
                    ..params
                })
                .with_dimensions(768, 1024)
                .with_file_size(980_000)
                .with_generation_time(4_800),
        ),
    )?;
    for (id, views) in [(&v2, 5), (&v3, 2), (&v1, 1)] {
        for _ in 0..views {
            succeeded(engine.record_usage(id, UsageKind::View))?;
        }
    }
    succeeded(engine.record_usage(&v3, UsageKind::Like))?;

    let main_id = engine
        .branches()
        .find_by_name(&config.engine.default_branch)
        .map(|b| b.id.clone())
        .context("default branch missing")?;
    succeeded(engine.switch_branch(&main_id))?;

    let tree = engine.build_version_tree(&v1, None)?;
    println!("\nVersion tree ({} versions):", tree.total_versions);
    print!("{}", tree.render());

    // --- Phase 3: comparison ---
    println!("\n=== Comparing v1 and v2 ===\n");
    let comparison = engine.compare_versions(&v1, &v2)?;
    println!("{}", generate_comparison_report(&comparison));

    println!("\n=== Conflicts between main and watercolor ===\n");
    let conflicts = engine.detect_conflicts(&main_id, &watercolor)?;
    if conflicts.is_empty() {
        println!("  (none)");
    }
    for conflict in &conflicts {
        println!(
            "  {}: {} -> {}",
            conflict.field, conflict.old_value, conflict.new_value
        );
    }
    let merge = engine.merge_branch(&watercolor, &main_id);
    println!("\nMerge attempt: {}", merge.message);

    // --- Phase 4: statistics ---
    println!("\n=== Statistics ===\n");
    let stats = engine.get_statistics(&StatisticsScope::All)?;
    println!("  Total versions:       {}", stats.total_versions);
    println!("  Average gen time:     {:.0} ms", stats.average_generation_time);
    println!("  Total storage:        {} bytes", stats.total_storage_used);
    for ranked in &stats.most_viewed {
        println!("  Viewed {:>3}x  {}", ranked.count, ranked.title);
    }

    let issues = engine.check_integrity();
    println!("\nIntegrity: {} issue(s)", issues.len());
    Ok(engine)
}
