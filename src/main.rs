use std::process::ExitCode;
use std::sync::Arc;

use parley::config::ServerConfig;
use parley::identity::{HmacTokenVerifier, InMemoryDirectory, Profile};
use parley::logging::{LogConfig, LogQueue};
use parley::{plog_error, plog_warn, server};

#[tokio::main]
async fn main() -> ExitCode {
    let config = ServerConfig::from_env();
    LogQueue::init(LogConfig {
        level: config.log_level,
        ..LogConfig::default()
    });

    if config.auth_secret.is_empty() {
        plog_warn!("PARLEY_AUTH_SECRET is unset; credentials are signed with an empty secret");
    }

    let verifier = Arc::new(HmacTokenVerifier::new(&config.auth_secret));
    let directory = Arc::new(load_directory());

    let result = server::run(config, directory, verifier).await;
    if let Err(ref err) = result {
        plog_error!("fatal: {err}");
    }
    LogQueue::shutdown();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}

/// The deployed directory proxies the platform's account services. For
/// single-box setups, `PARLEY_DIRECTORY_FILE` points at a JSON array of
/// profiles to serve from memory instead.
fn load_directory() -> InMemoryDirectory {
    let directory = InMemoryDirectory::new();
    let Ok(path) = std::env::var("PARLEY_DIRECTORY_FILE") else {
        return directory;
    };
    match std::fs::read_to_string(&path) {
        Ok(raw) => match serde_json::from_str::<Vec<Profile>>(&raw) {
            Ok(profiles) => {
                for profile in profiles {
                    directory.insert(profile);
                }
            }
            Err(err) => plog_warn!("directory file {path} is not valid JSON: {err}"),
        },
        Err(err) => plog_warn!("directory file {path} is unreadable: {err}"),
    }
    directory
}
