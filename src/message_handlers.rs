use super::*;
use crate::helpers::{download_telegram_file, is_authorized, parse_command, send_replies};

pub(super) async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> Result<()> {
    let user_id = match msg.from() {
        Some(user) => user.id.0,
        None => return Ok(()),
    };

    if !is_authorized(user_id, &state.config.allowed_user_ids) {
        debug!("ignoring message from unauthorized user {}", user_id);
        return Ok(());
    }

    let chat_id = msg.chat.id;
    let event = match message_event(&bot, &msg).await {
        Ok(Some(event)) => event,
        Ok(None) => return Ok(()),
        Err(reply) => {
            send_replies(&bot, chat_id, &[reply]).await?;
            return Ok(());
        }
    };

    let replies = match state.conversation.handle_event(chat_id.0, event).await {
        Ok(replies) => replies,
        Err(err) => {
            error!("chat {}: handling message failed: {:#}", chat_id.0, err);
            vec![Reply::text("Something went wrong, please try again.")]
        }
    };
    send_replies(&bot, chat_id, &replies).await
}

async fn message_event(bot: &Bot, msg: &Message) -> std::result::Result<Option<ChatEvent>, Reply> {
    if let Some(document) = msg.document() {
        if document.file.size > MAX_CREDENTIAL_DOCUMENT_BYTES {
            return Err(Reply::text(format!(
                "That file is too large ({} bytes). The credential file should be under {} KiB.",
                document.file.size,
                MAX_CREDENTIAL_DOCUMENT_BYTES / 1024
            )));
        }
        return match download_telegram_file(bot, &document.file.id).await {
            Ok(contents) => Ok(Some(ChatEvent::Document {
                file_name: document.file_name.clone(),
                contents,
            })),
            Err(err) => {
                warn!("chat {}: document download failed: {:#}", msg.chat.id.0, err);
                Err(Reply::text("Could not download that file, please send it again."))
            }
        };
    }

    let text = match msg.text() {
        Some(text) => text,
        None => return Ok(None),
    };
    Ok(Some(match parse_command(text) {
        Some(command) => ChatEvent::Command(command.to_string()),
        None => ChatEvent::Text(text.to_string()),
    }))
}
