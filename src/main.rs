use campaignd::campaign::CampaignStore;
use campaignd::comm_log::CommLogStore;
use campaignd::config::Config;
use campaignd::server::{self, AppState};
use campaignd::store::Database;
use clap::{Arg, Command};
use log::LevelFilter;
use std::process;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let matches = Command::new("campaignd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Campaign delivery and receipt-reconciliation service")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/campaignd.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate configuration and stored campaign rules")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("stats")
                .long("stats")
                .help("Show per-campaign delivery statistics")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("audit")
                .long("audit")
                .help("Detect and repair campaign stat drift, report stuck deliveries")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        let config = Config::default();
        match config.to_file(generate_path) {
            Ok(()) => println!("Default configuration written to {generate_path}"),
            Err(e) => {
                eprintln!("Error writing configuration: {e}");
                process::exit(1);
            }
        }
        return;
    }

    let config_path = matches.get_one::<String>("config").unwrap();
    let config = match Config::from_file(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        test_config(&config);
        return;
    }

    let db = match Database::open(&config.database_path) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Error opening database: {e}");
            process::exit(1);
        }
    };

    if matches.get_flag("stats") {
        show_stats(&db);
        return;
    }

    if matches.get_flag("audit") {
        run_audit(&db);
        return;
    }

    let state = Arc::new(AppState::new(&config, db));
    if let Err(e) = server::serve(&config, state).await {
        log::error!("server error: {e}");
        process::exit(1);
    }
}

fn test_config(config: &Config) {
    println!("Configuration is valid");
    println!("  listen_addr: {}", config.listen_addr);
    println!("  database_path: {}", config.database_path);
    println!(
        "  vendor: mode={:?} success_probability={} latency={}..{}ms",
        config.vendor.mode,
        config.vendor.success_probability,
        config.vendor.latency_ms_min,
        config.vendor.latency_ms_max
    );

    // Stored campaigns are validated too: a tree that predates a grammar
    // change should surface here, not during a dispatch.
    match Database::open(&config.database_path) {
        Ok(db) => {
            let campaigns = CampaignStore::new(db);
            match campaigns.list() {
                Ok(list) => {
                    let mut bad = 0;
                    for campaign in &list {
                        if let Err(e) = campaign.rules.validate() {
                            println!("  campaign {} has invalid rules: {e}", campaign.id);
                            bad += 1;
                        }
                    }
                    println!("  campaigns checked: {} ({} invalid)", list.len(), bad);
                    if bad > 0 {
                        process::exit(1);
                    }
                }
                Err(e) => {
                    eprintln!("Error listing campaigns: {e}");
                    process::exit(1);
                }
            }
        }
        Err(e) => {
            println!("  database not checked ({e})");
        }
    }
}

fn show_stats(db: &Database) {
    let campaigns = CampaignStore::new(db.clone());
    match campaigns.list() {
        Ok(list) => {
            if list.is_empty() {
                println!("No campaigns");
                return;
            }
            println!(
                "{:>6}  {:<24} {:>10} {:>8} {:>8} {:>8}  {}",
                "id", "name", "recipients", "sent", "failed", "pending", "state"
            );
            for c in list {
                println!(
                    "{:>6}  {:<24} {:>10} {:>8} {:>8} {:>8}  {}",
                    c.id,
                    c.name,
                    c.total_recipients,
                    c.stats.sent,
                    c.stats.failed,
                    c.stats.pending,
                    if c.is_settled() { "settled" } else { "dispatching" }
                );
            }
        }
        Err(e) => {
            eprintln!("Error reading campaigns: {e}");
            process::exit(1);
        }
    }
}

fn run_audit(db: &Database) {
    let campaigns = CampaignStore::new(db.clone());
    let logs = CommLogStore::new(db.clone());
    match campaigns.audit_stats(&logs, true) {
        Ok(drifted) => {
            if drifted.is_empty() {
                println!("All campaign stats match their communication logs");
            } else {
                for d in &drifted {
                    println!(
                        "campaign {}: sent {} -> {}, failed {} -> {} (repaired)",
                        d.campaign_id,
                        d.recorded_sent,
                        d.actual_sent,
                        d.recorded_failed,
                        d.actual_failed
                    );
                }
                println!("{} campaign(s) repaired", drifted.len());
            }
            // Stuck pending rows are not an inconsistency, but an operator
            // should know about them.
            match campaigns.list() {
                Ok(list) => {
                    for c in list {
                        if !c.is_settled() {
                            println!(
                                "campaign {} still has {} pending communication(s)",
                                c.id, c.stats.pending
                            );
                        }
                    }
                }
                Err(e) => eprintln!("Error listing campaigns: {e}"),
            }
        }
        Err(e) => {
            eprintln!("Audit failed: {e}");
            process::exit(1);
        }
    }
}
