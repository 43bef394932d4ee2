use super::*;
use crate::credentials::{extract_identity, OAUTH_SCOPES};
use crate::helpers::{parse_time_of_day, truncate_for_error};
use crate::publish::{next_scheduled_time_text, Publisher};
use crate::scheduler::Scheduler;
use crate::state_store::{load_or_default, StateStore};

const HELP_TEXT: &str = "Commands:\n\
/start - begin or resume setup\n\
/publish - publish the oldest video now\n\
/autopost - configure daily autopost times\n\
/settings - show the current settings\n\
/stop - stop autopost\n\
/reset - forget the setup and start over\n\
/help - show this message";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Action {
    Start,
    Help,
    Publish,
    ConfigureAutopost,
    ShowSettings,
    StopAutopost,
    Reset,
}

impl From<ButtonAction> for Action {
    fn from(button: ButtonAction) -> Self {
        match button {
            ButtonAction::PublishNow => Action::Publish,
            ButtonAction::AutopostSetup => Action::ConfigureAutopost,
            ButtonAction::ShowSettings => Action::ShowSettings,
            ButtonAction::ResetSetup => Action::Reset,
            ButtonAction::AutopostStop => Action::StopAutopost,
        }
    }
}

fn command_action(command: &str) -> Option<Action> {
    match command.to_ascii_lowercase().as_str() {
        "start" => Some(Action::Start),
        "help" => Some(Action::Help),
        "publish" => Some(Action::Publish),
        "autopost" => Some(Action::ConfigureAutopost),
        "settings" => Some(Action::ShowSettings),
        "stop" => Some(Action::StopAutopost),
        "reset" => Some(Action::Reset),
        _ => None,
    }
}

fn phrase_action(text: &str) -> Option<Action> {
    match text.trim().to_lowercase().as_str() {
        "publish now" => Some(Action::Publish),
        "configure autopost" => Some(Action::ConfigureAutopost),
        "show settings" => Some(Action::ShowSettings),
        "stop autopost" => Some(Action::StopAutopost),
        "reset" => Some(Action::Reset),
        _ => None,
    }
}

fn credential_prompt() -> Reply {
    Reply::text(
        "Send the OAuth client file (client_secret.json) from Google Cloud Console as a document.",
    )
}

fn refresh_prompt() -> Reply {
    Reply::text(format!(
        "Now send the refresh token. It must be issued for these scopes:\n{}",
        OAUTH_SCOPES.join("\n")
    ))
}

fn folder_prompt() -> Reply {
    Reply::text("Now send the Google Drive folder id that holds the videos to publish.")
}

fn count_prompt() -> Reply {
    Reply::text(format!(
        "How many times a day should I publish? Send a number from 1 to {}.",
        MAX_AUTOPOST_COUNT
    ))
}

fn time_prompt(index: u32, count: u32) -> Reply {
    Reply::text(format!("Send time {} of {} as HH:MM (24-hour).", index, count))
}

fn main_menu() -> Reply {
    Reply::with_keyboard("What would you like to do?", Keyboard::MainMenu)
}

fn step_prompt(config: &ChatConfig) -> Reply {
    match config.step {
        Step::AwaitCredential => credential_prompt(),
        Step::AwaitRefresh => refresh_prompt(),
        Step::AwaitFolder => folder_prompt(),
        Step::AwaitAutopostCount => count_prompt(),
        Step::AwaitAutopostTime { index } => time_prompt(index, config.autopost_count),
        Step::Idle => main_menu(),
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

/// Per-chat setup and autopost flow.
///
/// Every mutating transition is persisted before replies are returned.
/// Callers must not run two events for the same chat concurrently.
pub(super) struct Conversation {
    store: Arc<dyn StateStore>,
    publisher: Arc<Publisher>,
    scheduler: Arc<Scheduler>,
}

impl Conversation {
    pub(super) fn new(store: Arc<dyn StateStore>, publisher: Arc<Publisher>, scheduler: Arc<Scheduler>) -> Self {
        Conversation {
            store,
            publisher,
            scheduler,
        }
    }

    pub(super) async fn handle_event(&self, chat_id: i64, event: ChatEvent) -> Result<Vec<Reply>> {
        let mut config = load_or_default(self.store.as_ref(), chat_id).await?;

        let action = match &event {
            ChatEvent::Button(button) => Some(Action::from(*button)),
            ChatEvent::Command(command) => match command_action(command) {
                Some(action) => Some(action),
                None if config.step == Step::Idle => Some(Action::Help),
                None => return Ok(vec![step_prompt(&config)]),
            },
            ChatEvent::Text(text) if config.step == Step::Idle => phrase_action(text),
            _ => None,
        };
        if let Some(action) = action {
            return self.run_action(chat_id, config, action).await;
        }

        match (config.step, event) {
            (Step::AwaitCredential, ChatEvent::Document { contents, file_name }) => {
                match extract_identity(&contents) {
                    Ok(identity) => {
                        info!(
                            "chat {}: credential file {} accepted",
                            chat_id,
                            file_name.as_deref().unwrap_or("<unnamed>")
                        );
                        config.credential_identity = Some(identity);
                        config.step = Step::AwaitRefresh;
                        self.save(chat_id, &config).await?;
                        Ok(vec![Reply::text("Credential file accepted."), refresh_prompt()])
                    }
                    Err(err) => Ok(vec![
                        Reply::text(format!("That credential file is not usable: {}.", err)),
                        credential_prompt(),
                    ]),
                }
            }
            (Step::AwaitRefresh, ChatEvent::Text(text)) => {
                let token = text.trim();
                if token.is_empty() {
                    return Ok(vec![refresh_prompt()]);
                }
                config.refresh_token = Some(token.to_string());
                config.step = Step::AwaitFolder;
                self.save(chat_id, &config).await?;
                Ok(vec![Reply::text("Refresh token saved."), folder_prompt()])
            }
            (Step::AwaitFolder, ChatEvent::Text(text)) => {
                let folder_id = text.trim();
                if folder_id.is_empty() {
                    return Ok(vec![folder_prompt()]);
                }
                config.folder_id = Some(folder_id.to_string());
                config.setup_complete = config.has_all_setup_fields();
                config.step = Step::Idle;
                self.save(chat_id, &config).await?;

                let listing = match self.publisher.count_folder_videos(&config).await {
                    Ok(count) => format!("Folder saved. Videos waiting in it: {}.", count),
                    Err(err) => {
                        warn!("chat {}: trial folder listing failed: {:#}", chat_id, err);
                        format!(
                            "Folder saved, but listing it failed for now: {}",
                            truncate_for_error(&format!("{:#}", err), 300)
                        )
                    }
                };
                Ok(vec![Reply::text(listing), Reply::text("Setup is complete."), main_menu()])
            }
            (Step::AwaitAutopostCount, ChatEvent::Text(text)) => {
                let count = match text.trim().parse::<u32>() {
                    Ok(count) if (1..=MAX_AUTOPOST_COUNT).contains(&count) => count,
                    _ => {
                        return Ok(vec![Reply::text(format!(
                            "Please send a whole number between 1 and {}.",
                            MAX_AUTOPOST_COUNT
                        ))])
                    }
                };
                config.autopost_count = count;
                config.autopost_times.clear();
                config.step = Step::AwaitAutopostTime { index: 1 };
                self.save(chat_id, &config).await?;
                Ok(vec![time_prompt(1, count)])
            }
            (Step::AwaitAutopostTime { index }, ChatEvent::Text(text)) => {
                let text = text.trim();
                if parse_time_of_day(text).is_none() {
                    return Ok(vec![Reply::text(
                        "Invalid time. Use HH:MM with hours 00-23 and minutes 00-59, for example 09:30.",
                    )]);
                }
                config.autopost_times.push(text.to_string());
                if (config.autopost_times.len() as u32) < config.autopost_count {
                    config.step = Step::AwaitAutopostTime { index: index + 1 };
                    self.save(chat_id, &config).await?;
                    return Ok(vec![time_prompt(index + 1, config.autopost_count)]);
                }

                config.autopost_enabled = true;
                config.step = Step::Idle;
                self.save(chat_id, &config).await?;
                let registered = self.scheduler.schedule(chat_id, &config.autopost_times).await;
                info!("chat {}: autopost enabled with {} triggers", chat_id, registered);
                Ok(vec![Reply::with_keyboard(
                    self.autopost_summary(&config),
                    Keyboard::AutopostControl,
                )])
            }
            (Step::Idle, ChatEvent::Document { .. }) | (Step::Idle, ChatEvent::Text(_)) => {
                Ok(vec![Reply::text(HELP_TEXT), main_menu()])
            }
            (Step::AwaitCredential, _) => Ok(vec![credential_prompt()]),
            (_, ChatEvent::Document { .. }) => {
                Ok(vec![Reply::text("I was not expecting a file here."), step_prompt(&config)])
            }
            _ => Ok(vec![step_prompt(&config)]),
        }
    }

    pub(super) async fn run_scheduled(&self, chat_id: i64) -> Result<()> {
        let config = load_or_default(self.store.as_ref(), chat_id).await?;
        if !config.autopost_enabled {
            info!("chat {}: autopost disabled, skipping scheduled run", chat_id);
            return Ok(());
        }
        info!("chat {}: scheduled publish starting", chat_id);
        let outcome = self.publisher.publish_and_report(chat_id).await?;
        debug!("chat {}: scheduled publish finished: {:?}", chat_id, outcome);
        Ok(())
    }

    async fn run_action(&self, chat_id: i64, mut config: ChatConfig, action: Action) -> Result<Vec<Reply>> {
        match action {
            Action::Start => {
                if config.setup_complete {
                    return Ok(vec![Reply::with_keyboard("Welcome back!", Keyboard::MainMenu)]);
                }
                config.step = Step::AwaitCredential;
                self.save(chat_id, &config).await?;
                Ok(vec![
                    Reply::text("Hi! I publish videos from a Google Drive folder to YouTube."),
                    credential_prompt(),
                ])
            }
            Action::Help => {
                let mut replies = vec![Reply::text(HELP_TEXT)];
                if config.step != Step::Idle || !config.setup_complete {
                    replies.push(step_prompt(&config));
                }
                Ok(replies)
            }
            Action::ShowSettings => {
                let triggers = self.scheduler.registered_times(chat_id).await;
                Ok(vec![self.settings_snapshot(&config, &triggers)])
            }
            Action::Publish => {
                if !config.setup_complete {
                    return Ok(vec![Self::setup_required(&config)]);
                }
                info!("chat {}: publish requested", chat_id);
                let outcome = self.publisher.publish(chat_id).await?;
                Ok(outcome.replies())
            }
            Action::ConfigureAutopost => {
                if !config.setup_complete {
                    return Ok(vec![Self::setup_required(&config)]);
                }
                if config.autopost_enabled {
                    info!("chat {}: autopost reconfiguration, dropping current triggers", chat_id);
                }
                config.clear_autopost();
                config.step = Step::AwaitAutopostCount;
                self.save(chat_id, &config).await?;
                self.scheduler.cancel(chat_id).await;
                Ok(vec![count_prompt()])
            }
            Action::StopAutopost => {
                config.clear_autopost();
                config.step = Step::Idle;
                self.save(chat_id, &config).await?;
                self.scheduler.cancel(chat_id).await;
                Ok(vec![Reply::with_keyboard("Autopost stopped.", Keyboard::MainMenu)])
            }
            Action::Reset => {
                self.scheduler.cancel(chat_id).await;
                self.save(chat_id, &ChatConfig::default()).await?;
                info!("chat {}: setup reset", chat_id);
                Ok(vec![Reply::text("Setup has been reset."), credential_prompt()])
            }
        }
    }

    fn setup_required(config: &ChatConfig) -> Reply {
        match config.step {
            Step::AwaitCredential | Step::AwaitRefresh | Step::AwaitFolder => {
                let mut reply = step_prompt(config);
                reply.text = format!("Finish the setup first.\n{}", reply.text);
                reply
            }
            _ => Reply::text("Setup is not complete. Send /reset to start it again."),
        }
    }

    fn settings_snapshot(&self, config: &ChatConfig, triggers: &[String]) -> Reply {
        let times = if config.autopost_times.is_empty() {
            "none".to_string()
        } else {
            config.autopost_times.join(", ")
        };
        let text = format!(
            "Settings:\nSetup complete: {}\nDrive folder: {}\nAutopost enabled: {}\nAutopost times: {}\nActive triggers: {}",
            yes_no(config.setup_complete),
            config.folder_id.as_deref().unwrap_or("not set"),
            yes_no(config.autopost_enabled),
            times,
            triggers.len()
        );
        if config.setup_complete {
            Reply::with_keyboard(text, Keyboard::MainMenu)
        } else {
            Reply::text(text)
        }
    }

    fn autopost_summary(&self, config: &ChatConfig) -> String {
        let now = chrono::Utc::now().with_timezone(&self.publisher.timezone);
        let mut text = format!(
            "Autopost enabled. Daily times: {}",
            config.autopost_times.join(", ")
        );
        if let Some(next) = next_scheduled_time_text(&config.autopost_times, now) {
            text.push_str(&format!("\nNext scheduled post: {}", next));
        }
        text
    }

    async fn save(&self, chat_id: i64, config: &ChatConfig) -> Result<()> {
        self.store
            .put(chat_id, config)
            .await
            .with_context(|| format!("save state for chat {}", chat_id))
    }
}
