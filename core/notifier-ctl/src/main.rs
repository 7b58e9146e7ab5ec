//! notifier-ctl: command-line client for the chat-notifier daemon.
//!
//! Forwards page and tab events on behalf of a browser bridge, queries and
//! watches the tracked status, and drains the browser commands the daemon
//! queues.
//!
//! ## Subcommands
//!
//! - `status` / `watch`: read the tracked session (`status` also prints the
//!   stored preferences)
//! - `started` / `finished`: page monitor signals for a tab
//! - `tab`: tab lifecycle events (`activated`, `updated`, `removed`)
//! - `click`: a notification was clicked
//! - `focus`: bring the tracked chat tab to the front
//! - `drain`: print queued browser commands, one JSON object per line
//! - `pref`: set a stored preference
//! - `health`: daemon health check

mod daemon_client;
mod logging;
mod watch;

use chat_notifier_protocol::{ExtensionMessage, PreferenceKey, TabEvent};
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "notifier-ctl")]
#[command(about = "Chat completion notifier control client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the tracked session and the stored preferences
    Status {
        /// Print the raw status record and preferences as JSON, one per line
        #[arg(long)]
        json: bool,
    },

    /// Print the tracked session every time it changes
    Watch {
        /// Exit once the session reports done
        #[arg(long)]
        until_done: bool,

        #[arg(long)]
        json: bool,
    },

    /// Report that a tab started generating a response
    Started {
        #[arg(long = "tab", value_name = "TAB_ID")]
        tab_id: i64,

        /// Conversation URL
        #[arg(value_name = "URL")]
        url: String,
    },

    /// Report that a tab finished generating a response
    Finished {
        #[arg(long = "tab", value_name = "TAB_ID")]
        tab_id: i64,

        #[arg(value_name = "URL")]
        url: String,
    },

    /// Report a tab lifecycle event
    Tab {
        #[command(subcommand)]
        event: TabCommand,
    },

    /// Report a click on a completion notification
    Click {
        #[arg(value_name = "NOTIFICATION_ID")]
        notification_id: String,
    },

    /// Bring the tracked chat tab to the front
    Focus,

    /// Print and clear the queued browser commands
    Drain,

    /// Set a stored preference
    Pref {
        #[arg(value_enum)]
        key: PrefKey,

        /// true/false, on/off, yes/no
        #[arg(
            value_name = "VALUE",
            action = clap::ArgAction::Set,
            value_parser = clap::builder::BoolishValueParser::new()
        )]
        value: bool,
    },

    /// Check that the daemon is up
    Health,
}

#[derive(Subcommand, Debug)]
enum TabCommand {
    /// The user switched to a tab
    Activated {
        #[arg(long = "tab", value_name = "TAB_ID")]
        tab_id: i64,

        #[arg(long = "window", value_name = "WINDOW_ID")]
        window_id: Option<i64>,

        #[arg(long)]
        url: Option<String>,

        #[arg(long)]
        title: Option<String>,
    },

    /// A tab navigated or changed its title
    Updated {
        #[arg(long = "tab", value_name = "TAB_ID")]
        tab_id: i64,

        #[arg(long)]
        url: Option<String>,

        #[arg(long)]
        title: Option<String>,
    },

    /// A tab was closed
    Removed {
        #[arg(long = "tab", value_name = "TAB_ID")]
        tab_id: i64,
    },
}

impl From<TabCommand> for TabEvent {
    fn from(command: TabCommand) -> Self {
        match command {
            TabCommand::Activated {
                tab_id,
                window_id,
                url,
                title,
            } => TabEvent::Activated {
                tab_id,
                window_id,
                url,
                title,
            },
            TabCommand::Updated { tab_id, url, title } => TabEvent::Updated { tab_id, url, title },
            TabCommand::Removed { tab_id } => TabEvent::Removed { tab_id },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum PrefKey {
    ImageHidden,
    SoundEnabled,
}

impl From<PrefKey> for PreferenceKey {
    fn from(key: PrefKey) -> Self {
        match key {
            PrefKey::ImageHidden => PreferenceKey::ImageHidden,
            PrefKey::SoundEnabled => PreferenceKey::SoundEnabled,
        }
    }
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli.command) {
        tracing::error!(error = %e, "notifier-ctl failed");
        std::process::exit(1);
    }
}

fn run(command: Commands) -> Result<(), String> {
    match command {
        Commands::Status { json } => {
            let status = daemon_client::get_status()?;
            println!("{}", watch::render(&status, json));
            let preferences = daemon_client::get_preferences()?;
            println!("{}", watch::render_preferences(&preferences, json));
        }
        Commands::Watch { until_done, json } => {
            watch::run(watch::WatchOptions { until_done, json })?;
        }
        Commands::Started { tab_id, url } => {
            daemon_client::send_page_message(tab_id, ExtensionMessage::GenerationStarted { url })?;
        }
        Commands::Finished { tab_id, url } => {
            daemon_client::send_page_message(tab_id, ExtensionMessage::GenerationFinished { url })?;
        }
        Commands::Tab { event } => {
            daemon_client::send_tab_event(&TabEvent::from(event))?;
        }
        Commands::Click { notification_id } => {
            daemon_client::notification_clicked(&notification_id)?;
        }
        Commands::Focus => {
            daemon_client::focus_tracked()?;
        }
        Commands::Drain => {
            for command in daemon_client::drain_commands()? {
                let line = serde_json::to_string(&command)
                    .map_err(|err| format!("Failed to serialize command: {}", err))?;
                println!("{}", line);
            }
        }
        Commands::Pref { key, value } => {
            daemon_client::set_preference(key.into(), value)?;
        }
        Commands::Health => {
            let health = daemon_client::daemon_health()?;
            println!("{}", health);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn tab_activated_maps_to_tab_event() {
        let cli = Cli::try_parse_from([
            "notifier-ctl",
            "tab",
            "activated",
            "--tab",
            "7",
            "--window",
            "3",
            "--url",
            "https://chatgpt.com/c/1",
        ])
        .unwrap();
        let Commands::Tab { event } = cli.command else {
            panic!("expected tab command");
        };
        assert_eq!(
            TabEvent::from(event),
            TabEvent::Activated {
                tab_id: 7,
                window_id: Some(3),
                url: Some("https://chatgpt.com/c/1".to_string()),
                title: None,
            }
        );
    }

    #[test]
    fn pref_accepts_boolish_values() {
        let cli = Cli::try_parse_from(["notifier-ctl", "pref", "sound-enabled", "off"]).unwrap();
        match cli.command {
            Commands::Pref { key, value } => {
                assert_eq!(PreferenceKey::from(key), PreferenceKey::SoundEnabled);
                assert!(!value);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn focus_takes_no_arguments() {
        let cli = Cli::try_parse_from(["notifier-ctl", "focus"]).unwrap();
        assert!(matches!(cli.command, Commands::Focus));
        assert!(Cli::try_parse_from(["notifier-ctl", "focus", "7"]).is_err());
    }

    #[test]
    fn started_requires_a_tab_id() {
        assert!(Cli::try_parse_from(["notifier-ctl", "started", "https://claude.ai/chat/1"]).is_err());
    }
}
