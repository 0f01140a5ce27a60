use clap::Subcommand;
use calbridge_core::integrations::oauth::{self, OAuthConfig};
use calbridge_core::integrations::ClientCredentials;
use calbridge_core::storage::LinkStore;
use calbridge_core::SqliteStore;

use super::{runtime, CliResult, Context};

#[derive(Subcommand)]
pub enum AuthAction {
    /// Store the Google OAuth client id and secret in the OS keyring
    Credentials {
        #[arg(long)]
        client_id: String,
        #[arg(long)]
        client_secret: String,
    },
    /// Connect a Google Calendar (opens the browser for consent)
    Connect {
        /// Calendar to write events to
        #[arg(long, default_value = "primary")]
        calendar: String,
        /// IANA timezone used to place task times on the calendar
        #[arg(long, default_value = "UTC")]
        timezone: String,
    },
    /// Remove the calendar link. Events already on the calendar stay.
    Disconnect,
    /// Show the connection state
    Status,
}

pub fn run(user: &str, action: AuthAction) -> CliResult {
    match action {
        AuthAction::Credentials {
            client_id,
            client_secret,
        } => {
            ClientCredentials {
                client_id,
                client_secret,
            }
            .store()?;
            println!("Google client credentials stored");
        }
        AuthAction::Connect { calendar, timezone } => {
            let ctx = Context::open()?;
            let credentials = ClientCredentials::load()?;
            let oauth_config = OAuthConfig::new(&ctx.config.google, &credentials);
            let tokens = runtime()?.block_on(oauth::authorize(&oauth_config))?;
            let link = ctx.engine.connect(user, &tokens, &calendar, &timezone)?;
            println!(
                "Connected calendar '{}' for {} ({})",
                link.calendar_id, link.user_id, link.timezone
            );
        }
        AuthAction::Disconnect => {
            let ctx = Context::open()?;
            ctx.engine.disconnect(user)?;
            println!("Calendar disconnected");
        }
        AuthAction::Status => {
            // Reads the link only, so it works without client credentials.
            let store = SqliteStore::open()?;
            match store.get_link(user)? {
                None => println!("not connected"),
                Some(link) => {
                    println!("calendar:   {}", link.calendar_id);
                    println!("timezone:   {}", link.timezone);
                    println!("auth:       {}", link.auth_state.as_str());
                    println!("direction:  {}", link.direction.as_str());
                    println!("enabled:    {}", link.enabled);
                    println!("expires at: {}", link.token_expires_at.to_rfc3339());
                }
            }
        }
    }
    Ok(())
}
