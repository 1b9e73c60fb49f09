use rspray::cli;
use rspray::cores::spray_en::RunOutcome;

#[tokio::main]
async fn main() {
    match cli::run().await {
        Ok(RunOutcome::Finished) => {}
        Ok(RunOutcome::Aborted) => std::process::exit(2),
        Err(e) => {
            eprintln!("rspray: {}", e);
            std::process::exit(1);
        }
    }
}
