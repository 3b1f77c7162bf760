use log::error;
use std::process::exit;

#[tokio::main]
async fn main() {
    match rewards_watch::cli::run().await {
        Ok(()) => exit(0),
        Err(e) => {
            error!("Command failed: {}", e);
            eprintln!("{}", e);
            drop(e);
            exit(1)
        }
    }
}
