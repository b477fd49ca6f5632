use clap::{Parser, Subcommand};
use softdep_core::SoftdepConfig;
use softdep_tracker::{run_scenario, Scenario, ScenarioReport};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "softdep")]
#[command(about = "Soft updates write-ordering scenarios on an in-memory disk", long_about = None)]
struct Cli {
    /// Mount configuration as JSON
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print reports as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a reference scenario (extend, mkdir, rename, truncate, or all)
    Run {
        /// Scenario name
        #[arg(default_value = "all")]
        scenario: String,
    },
    /// Random operations and write order, checked after every write
    Fuzz {
        /// First seed
        #[arg(short, long, default_value_t = 1)]
        seed: u64,
        /// Number of seeds to run
        #[arg(short = 'n', long, default_value_t = 1)]
        runs: u64,
        /// Operations per run
        #[arg(short, long, default_value_t = 500)]
        ops: usize,
    },
    /// Print the default configuration
    Config,
}

fn parse_scenarios(name: &str) -> anyhow::Result<Vec<Scenario>> {
    Ok(match name {
        "extend" => vec![Scenario::Extend],
        "mkdir" => vec![Scenario::Mkdir],
        "rename" => vec![Scenario::Rename],
        "truncate" => vec![Scenario::Truncate],
        "all" => vec![Scenario::Extend, Scenario::Mkdir, Scenario::Rename, Scenario::Truncate],
        other => anyhow::bail!("Unknown scenario '{}'. Use extend, mkdir, rename, truncate or all.", other),
    })
}

fn print_report(report: &ScenarioReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("Scenario: {}", report.scenario);
    println!("  Result: {}", if report.passed() { "PASS" } else { "FAIL" });
    println!("  Writes: {}", report.writes);
    println!(
        "  Rollbacks: {} pointer, {} indirect, {} entry, {} inode",
        report.stats.direct_rollbacks,
        report.stats.indirect_rollbacks,
        report.stats.dirent_rollbacks,
        report.stats.inode_image_rollbacks
    );
    println!("  Work items: {}", report.stats.work_items_processed);
    println!(
        "  Released: {} fragments, {} inodes",
        report.stats.frags_released, report.stats.inodes_released
    );
    if !report.idle {
        println!("  Dependencies left after drain");
    }
    if report.needs_fsck {
        println!("  Filesystem needs fsck");
    }
    for violation in &report.violations {
        println!("  Violation: {}", violation);
    }
    println!();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => SoftdepConfig::load(path)?,
        None => SoftdepConfig::default(),
    };

    let scenarios = match cli.command {
        Commands::Config => {
            println!("{}", config.to_json()?);
            return Ok(());
        }
        Commands::Run { scenario } => parse_scenarios(&scenario)?,
        Commands::Fuzz { seed, runs, ops } => (seed..seed + runs).map(|seed| Scenario::Fuzz { seed, ops }).collect(),
    };

    let mut failed = 0;
    for scenario in scenarios {
        let config = config.clone();
        let report = tokio::task::spawn_blocking(move || run_scenario(config, &scenario)).await??;
        if !report.passed() {
            failed += 1;
        }
        print_report(&report, cli.json)?;
    }
    if failed > 0 {
        anyhow::bail!("{} scenario(s) failed", failed);
    }
    Ok(())
}
