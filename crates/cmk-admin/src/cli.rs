use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cmk_checkengine::scan_migration::load_scan_functions;
use cmk_checkengine::ScanFunctionMigrator;
use cmk_wato::{FolderTree, RegexCache, RulesetCollection, RulespecRegistry, WatoConfig};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "cmk-admin")]
#[command(about = "Checkmk setup command line", long_about = None)]
pub struct Cli {
    /// Configuration file (.toml or .json).
    #[arg(short, long, env = "CMK_ADMIN_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// List all folders with their host counts.
    Folders,
    /// List the hosts of a folder.
    Hosts { folder: String },
    /// List the rules of a ruleset in evaluation order.
    Rules { ruleset: String },
    /// Evaluate a ruleset for a host.
    Analyse {
        ruleset: String,
        host: String,
        #[arg(short, long)]
        service: Option<String>,
    },
    /// Translate legacy scan functions from a JSON file.
    MigrateScan { file: PathBuf },
}

impl Cli {
    pub fn run(self) -> Result<()> {
        match self.command {
            Command::Folders => folders(&open_tree(self.config.as_deref())?),
            Command::Hosts { ref folder } => hosts(&open_tree(self.config.as_deref())?, folder),
            Command::Rules { ref ruleset } => rules(&open_tree(self.config.as_deref())?, ruleset),
            Command::Analyse {
                ref ruleset,
                ref host,
                ref service,
            } => analyse(
                &open_tree(self.config.as_deref())?,
                ruleset,
                host,
                service.as_deref(),
            ),
            Command::MigrateScan { ref file } => migrate_scan(file),
        }
    }
}

fn open_tree(config: Option<&Path>) -> Result<FolderTree> {
    let config = match config {
        Some(path) => WatoConfig::from_file(path)?,
        None => {
            tracing::warn!("no config file given, using defaults");
            WatoConfig::default()
        }
    };
    tracing::info!(root = %config.wato_root.display(), "opening folder tree");
    FolderTree::open(&config).context("failed to open folder tree")
}

fn folders(tree: &FolderTree) -> Result<()> {
    for folder in tree.all_folders() {
        let path = if folder.is_root() { "/" } else { folder.path() };
        println!(
            "{:<40} {:<30} {:>6}",
            path,
            tree.title_path(folder.path())?.join(" / "),
            tree.num_hosts_recursively(folder.path())?
        );
    }
    Ok(())
}

fn hosts(tree: &FolderTree, folder: &str) -> Result<()> {
    let path = folder.trim_matches('/');
    for host in tree.hosts(path)?.values() {
        let kind = if host.is_cluster() { "cluster" } else { "host" };
        println!(
            "{:<30} {:<8} {}",
            host.name(),
            kind,
            serde_json::to_string(host.attributes())?
        );
    }
    Ok(())
}

fn load_ruleset(tree: &FolderTree, ruleset: &str) -> Result<RulesetCollection> {
    let rulespecs = Arc::new(RulespecRegistry::builtin());
    Ok(RulesetCollection::load_single_recursively(tree, rulespecs, ruleset)?)
}

fn rules(tree: &FolderTree, name: &str) -> Result<()> {
    let collection = load_ruleset(tree, name)?;
    let ruleset = collection.get(name)?;
    for (folder, index, rule) in ruleset.get_rules() {
        let folder = if folder.is_empty() { "/" } else { folder };
        let disabled = if rule.is_disabled() { " (disabled)" } else { "" };
        println!(
            "{:<30} #{:<3} {} {}{}",
            folder,
            index,
            rule.id,
            serde_json::to_string(&rule.value)?,
            disabled
        );
    }
    Ok(())
}

fn analyse(tree: &FolderTree, name: &str, host: &str, service: Option<&str>) -> Result<()> {
    let collection = load_ruleset(tree, name)?;
    let cache = RegexCache::new();
    let (value, locations) = collection
        .get(name)?
        .analyse_ruleset(tree, host, service, &cache)?;
    let matched: Vec<_> = locations
        .iter()
        .map(|l| json!({"folder": l.folder_path, "index": l.index, "rule_id": l.rule_id}))
        .collect();
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({"value": value, "matched_rules": matched}))?
    );
    Ok(())
}

fn migrate_scan(file: &Path) -> Result<()> {
    let functions = load_scan_functions(file)?;
    let migrator = ScanFunctionMigrator::new();
    let mut failed = 0;
    let report: serde_json::Map<String, serde_json::Value> = migrator
        .migrate_all(&functions)
        .into_iter()
        .map(|(name, outcome)| {
            let entry = match outcome {
                Ok(spec) => json!({"detect": spec}),
                Err(e) => {
                    failed += 1;
                    json!({"error": e.to_string()})
                }
            };
            (name, entry)
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&report)?);
    tracing::info!(
        total = functions.len(),
        failed,
        distinct = migrator.memo_len(),
        "scan functions migrated"
    );
    Ok(())
}
