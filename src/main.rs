use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::LevelFilter;
use toml::Table;
use tilebuf::sim::config::{Config, ExtMemConfig, SimConfig};
use tilebuf::sim::top::Sim;
use tilebuf::tilebuf::config::TileBufferConfig;
use tilebuf::tilebuf::dma::DmaConfig;
use tilebuf::traffic::config::TrafficConfig;

#[derive(Parser)]
#[command(version, about)]
struct TileBufArgs {
    #[arg(help="Path to config.toml")]
    config_path: PathBuf,
    #[arg(long, help="Enable log at level (0:warn, 1:info, 2:debug)")]
    log: Option<u64>,
    #[arg(long, help="Give up after this many cycles")]
    timeout: Option<u64>,
    #[arg(long, help="Override number of consumer requesters")]
    num_requesters: Option<usize>,
    #[arg(long, help="Override number of banks")]
    num_banks: Option<usize>,
    #[arg(long, help="Write the run summary as JSON to this path")]
    results_json: Option<PathBuf>,
}

fn level_filter(log_level: u64) -> LevelFilter {
    match log_level {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    }
}

pub fn main() -> anyhow::Result<()> {
    let argv = TileBufArgs::parse();
    let config = fs::read_to_string(&argv.config_path)
        .with_context(|| format!("failed to read config file {}", argv.config_path.display()))?;

    let config_table: Table = toml::from_str(&config).context("cannot parse config toml")?;
    let mut sim_config = SimConfig::from_section(config_table.get("sim"))?;
    let mut tilebuf_config = TileBufferConfig::from_section(config_table.get("tilebuf"))?;
    let dma_config = DmaConfig::from_section(config_table.get("dma"))?;
    let ext_config = ExtMemConfig::from_section(config_table.get("ext_mem"))?;
    let traffic_config = TrafficConfig::from_section(config_table.get("traffic"))?;

    // override toml configs with argv
    sim_config.log_level = argv.log.unwrap_or(sim_config.log_level);
    sim_config.timeout = argv.timeout.unwrap_or(sim_config.timeout);
    sim_config.results_json = argv.results_json.or(sim_config.results_json);
    tilebuf_config.num_requesters = argv.num_requesters.unwrap_or(tilebuf_config.num_requesters);
    tilebuf_config.num_banks = argv.num_banks.unwrap_or(tilebuf_config.num_banks);

    // RUST_LOG, when set, wins over the configured level
    env_logger::Builder::new()
        .filter_level(level_filter(sim_config.log_level))
        .parse_default_env()
        .init();

    let mut sim = Sim::new(sim_config, tilebuf_config, dma_config, ext_config, traffic_config)?;
    let summary = sim.simulate()?;
    println!(
        "finished in {} cycles: {} grants, {} conflicts, {} violations, {} words verified",
        summary.cycles,
        summary.tilebuf.total_grants(),
        summary.tilebuf.total_conflicts(),
        summary.tilebuf.total_violations(),
        summary.verified_words
    );
    Ok(())
}
