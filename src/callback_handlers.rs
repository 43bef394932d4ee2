use super::*;
use crate::helpers::{is_authorized, send_replies};

pub(super) async fn handle_callback(bot: Bot, q: CallbackQuery, state: Arc<AppState>) -> Result<()> {
    let user_id = q.from.id.0;
    if !is_authorized(user_id, &state.config.allowed_user_ids) {
        bot.answer_callback_query(q.id).await?;
        return Ok(());
    }

    let Some(message) = q.message.clone() else {
        bot.answer_callback_query(q.id).await?;
        return Ok(());
    };
    let action = q.data.as_deref().and_then(ButtonAction::from_callback_data);
    bot.answer_callback_query(q.id).await?;

    let Some(action) = action else {
        debug!("unknown callback data {:?}", q.data);
        return Ok(());
    };

    if let Err(err) = bot
        .edit_message_reply_markup(message.chat.id, message.id)
        .await
    {
        debug!("clearing keyboard failed: {}", err);
    }

    let chat_id = message.chat.id;
    let replies = match state
        .conversation
        .handle_event(chat_id.0, ChatEvent::Button(action))
        .await
    {
        Ok(replies) => replies,
        Err(err) => {
            error!("chat {}: handling button failed: {:#}", chat_id.0, err);
            vec![Reply::text("Something went wrong, please try again.")]
        }
    };
    send_replies(&bot, chat_id, &replies).await
}
