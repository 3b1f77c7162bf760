use crate::{config::Config, database, logger, server, updater};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::info;
use tokio::sync::oneshot;

pub const SERVE: &str = "serve";
pub const RUN_UPDATER: &str = "run-updater";
pub const MIGRATE: &str = "migrate";
pub const CLASSIFY_SLOT: &str = "classify-slot";
pub const CONFIG: &str = "config";
pub const SLOT: &str = "slot";

fn run_updater() -> Command {
    Command::new(RUN_UPDATER).about("Index the chain into the database until stopped")
}

fn serve() -> Command {
    Command::new(SERVE).about("Serve reward queries over HTTP")
}

fn migrate() -> Command {
    Command::new(MIGRATE).about("Create the database if it does not exist and run migrations")
}

fn classify_slot() -> Command {
    Command::new(CLASSIFY_SLOT)
        .about("Classify the block reward of one slot and print it without storing it")
        .arg(
            Arg::new(SLOT)
                .value_name("SLOT")
                .required(true)
                .value_parser(value_parser!(u64)),
        )
}

pub fn app() -> Command {
    Command::new("rewards_watch")
        .about("Attributes consensus and execution layer rewards to validators")
        .arg(
            Arg::new(CONFIG)
                .long(CONFIG)
                .value_name("PATH_TO_CONFIG")
                .help("Path to configuration file")
                .action(ArgAction::Set)
                .global(true),
        )
        .subcommand(run_updater())
        .subcommand(serve())
        .subcommand(migrate())
        .subcommand(classify_slot())
}

fn load_config(matches: &ArgMatches) -> Result<Config, String> {
    match matches.get_one::<String>(CONFIG) {
        Some(path) => Config::load_from_file(path.clone()),
        None => Ok(Config::default()),
    }
}

pub async fn run() -> Result<(), String> {
    let matches = app().get_matches();
    let config = load_config(&matches)?;

    logger::init_logger(&config.log_level)?;

    match matches.subcommand() {
        Some((RUN_UPDATER, _)) => updater::run_updater(config)
            .await
            .map_err(|e| format!("Failure: {:?}", e)),
        Some((SERVE, _)) => {
            let (shutdown_tx, shutdown_rx) = oneshot::channel();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutting down the server");
                    let _ = shutdown_tx.send(());
                }
            });
            server::serve(config, shutdown_rx)
                .await
                .map_err(|e| format!("Failure: {:?}", e))
        }
        Some((MIGRATE, _)) => {
            database::utils::create_database_if_missing(&config.database)
                .and_then(|()| database::utils::run_migrations(&config.database))
                .map_err(|e| format!("Failure: {:?}", e))
        }
        Some((CLASSIFY_SLOT, submatches)) => {
            let slot = submatches
                .get_one::<u64>(SLOT)
                .copied()
                .ok_or("Missing slot")?;
            let record = updater::classify_slot(&config.updater, slot)
                .await
                .map_err(|e| format!("Failure: {:?}", e))?;
            let json = serde_json::to_string_pretty(&record)
                .map_err(|e| format!("Failure: {:?}", e))?;
            println!("{}", json);
            Ok(())
        }
        _ => Err("Unsupported subcommand. See --help".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_slot_requires_a_number() {
        let matches = app()
            .try_get_matches_from(["rewards_watch", CLASSIFY_SLOT, "5000000"])
            .unwrap();
        let (name, submatches) = matches.subcommand().unwrap();
        assert_eq!(name, CLASSIFY_SLOT);
        assert_eq!(submatches.get_one::<u64>(SLOT), Some(&5_000_000));

        assert!(app()
            .try_get_matches_from(["rewards_watch", CLASSIFY_SLOT, "latest"])
            .is_err());
    }

    #[test]
    fn config_is_global() {
        let matches = app()
            .try_get_matches_from(["rewards_watch", SERVE, "--config", "watch.yaml"])
            .unwrap();
        assert_eq!(
            matches.get_one::<String>(CONFIG).map(String::as_str),
            Some("watch.yaml")
        );
    }
}
