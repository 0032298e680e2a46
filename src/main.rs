use log::{error, info, warn};
use pollstream_votes::commands::poll::{Console, Flow};
use pollstream_votes::config::VoteConfig;
use pollstream_votes::db::open_backend;
use pollstream_votes::identity::{EnvIdentityResolver, IdentityResolver};
use pollstream_votes::VoteSession;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = VoteConfig::from_env();

    let backend = match open_backend(&config).await {
        Ok(backend) => backend,
        Err(e) => {
            error!("Failed to open vote store: {}", e);
            return Err(e.into());
        }
    };

    let identity = EnvIdentityResolver.resolve();
    match identity.voter_id() {
        Some(id) => info!("Voting as {}", id),
        None => warn!("No voter id set, voting anonymously from this device"),
    }

    let session = VoteSession::from_config(&config, backend, identity).await;
    let mut console = Console::new(session);

    println!("Type `help` for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let (flow, output) = console.handle_line(&line).await;
        if !output.is_empty() {
            println!("{}", output);
        }
        if flow == Flow::Quit {
            break;
        }
    }

    info!("Session ended");
    Ok(())
}
