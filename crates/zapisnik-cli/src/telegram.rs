//! Telegram frontend
//!
//! Translates Telegram updates into core events, dispatches them, and
//! renders the replies back: texts get keyboards where the menu texts
//! call for them, dice become real animated dice, invoices are issued
//! in Stars.

use std::sync::Arc;

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{
    ChatId, InlineKeyboardButton, InlineKeyboardMarkup, KeyboardButton, KeyboardMarkup,
    LabeledPrice,
};
use tracing::{info, warn};

use zapisnik_core::tracks::messages;
use zapisnik_core::{
    BetaTrack, Context, CoreError, Event, EventKind, Invoice, NotificationSink, PaymentGateway,
    PaymentNotice, Reply, Router, StableTrack, TranscribeError, Transcriber, UserId, VoiceNote,
};
use zapisnik_store::RecordStore;

/// Chat id that receives forwarded feedback.
const OPERATOR_CHAT_ENV: &str = "ZAPISNIK_OPERATOR_CHAT";

const MESSAGE_CHUNK: usize = 4000;

pub async fn run(store: Arc<dyn RecordStore>) -> anyhow::Result<()> {
    info!("Zapisnik Telegram frontend starting");
    let bot = Bot::from_env();

    let sink = Arc::new(OperatorSink {
        bot: bot.clone(),
        chat: operator_chat(),
    });
    let ctx = Arc::new(Context::new(
        store,
        Arc::new(UnconfiguredTranscriber),
        sink,
        Arc::new(ManualRefunds),
    ));
    let router = Arc::new(Router::new(ctx, Arc::new(StableTrack), Arc::new(BetaTrack)));

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(on_message))
        .branch(Update::filter_callback_query().endpoint(on_callback))
        .branch(Update::filter_pre_checkout_query().endpoint(on_pre_checkout));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![router])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
    Ok(())
}

fn operator_chat() -> Option<ChatId> {
    let raw = std::env::var(OPERATOR_CHAT_ENV).ok()?;
    match raw.trim().parse() {
        Ok(id) => Some(ChatId(id)),
        Err(_) => {
            warn!(value = %raw, "ignoring unparseable {OPERATOR_CHAT_ENV}");
            None
        }
    }
}

async fn on_message(bot: Bot, msg: Message, router: Arc<Router>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let sender = UserId(user.id.0 as i64);

    let kind = if let Some(payment) = msg.successful_payment() {
        EventKind::Payment(PaymentNotice {
            payload: payment.invoice_payload.clone(),
            charge_id: Some(payment.telegram_payment_charge_id.clone()),
        })
    } else if let Some(voice) = msg.voice() {
        EventKind::Voice(VoiceNote {
            file_token: voice.file.id.clone(),
        })
    } else if let Some(text) = msg.text() {
        parse_text(text)
    } else {
        return Ok(());
    };

    let replies = router.dispatch(Event { sender, kind }).await;
    render(&bot, msg.chat.id, replies).await
}

async fn on_callback(bot: Bot, q: CallbackQuery, router: Arc<Router>) -> ResponseResult<()> {
    bot.answer_callback_query(q.id.clone()).await?;
    let Some(data) = q.data else {
        return Ok(());
    };

    let sender = UserId(q.from.id.0 as i64);
    let replies = router.dispatch(Event::button(sender, data)).await;

    let chat = q
        .message
        .map(|m| m.chat.id)
        .unwrap_or(ChatId(sender.0));
    render(&bot, chat, replies).await
}

/// Every invoice we issue is valid by construction, so checkout is
/// always approved. Failure handling happens after the charge, in the
/// payment handler.
async fn on_pre_checkout(bot: Bot, q: PreCheckoutQuery) -> ResponseResult<()> {
    bot.answer_pre_checkout_query(q.id, true).await?;
    Ok(())
}

/// `/command args` or plain text (including reply-keyboard labels).
fn parse_text(text: &str) -> EventKind {
    let Some(stripped) = text.strip_prefix('/') else {
        return EventKind::Text(text.to_string());
    };
    let (name, args) = match stripped.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (stripped, ""),
    };
    // "/start@SomeBot" in group chats
    let name = name.split('@').next().unwrap_or(name);
    EventKind::Command {
        name: name.to_string(),
        args: args.to_string(),
    }
}

async fn render(bot: &Bot, chat: ChatId, replies: Vec<Reply>) -> ResponseResult<()> {
    for reply in replies {
        match reply {
            Reply::Text(text) => send_text(bot, chat, &text).await?,
            Reply::Dice => {
                let sent = bot.send_dice(chat).await?;
                if let Some(dice) = sent.dice() {
                    bot.send_message(chat, format!("Выпало {}", dice.value))
                        .await?;
                }
            }
            Reply::Invoice(invoice) => send_invoice(bot, chat, invoice).await?,
        }
    }
    Ok(())
}

async fn send_text(bot: &Bot, chat: ChatId, text: &str) -> ResponseResult<()> {
    let chunks: Vec<String> = text
        .chars()
        .collect::<Vec<_>>()
        .chunks(MESSAGE_CHUNK)
        .map(|c| c.iter().collect())
        .collect();
    let last = chunks.len().saturating_sub(1);

    for (i, chunk) in chunks.into_iter().enumerate() {
        let markup = if i == last {
            inline_markup_for(&chunk)
        } else {
            None
        };
        let greeting = i == last && chunk == messages::GREETING;

        let req = bot.send_message(chat, chunk);
        if let Some(markup) = markup {
            req.reply_markup(markup).await?;
        } else if greeting {
            req.reply_markup(main_keyboard()).await?;
        } else {
            req.await?;
        }
    }
    Ok(())
}

async fn send_invoice(bot: &Bot, chat: ChatId, invoice: Invoice) -> ResponseResult<()> {
    // Stars: currency XTR, no provider token
    bot.send_invoice(
        chat,
        invoice.title,
        invoice.description,
        invoice.payload,
        String::new(),
        "XTR".to_string(),
        vec![LabeledPrice {
            label: invoice.label,
            amount: invoice.amount as i32,
        }],
    )
    .await?;
    Ok(())
}

/// Persistent reply keyboard sent with the greeting.
fn main_keyboard() -> KeyboardMarkup {
    KeyboardMarkup::new(vec![
        vec![KeyboardButton::new("Кубик"), KeyboardButton::new("Меню")],
        vec![
            KeyboardButton::new("Память"),
            KeyboardButton::new("Вопрос/Отзыв"),
        ],
    ])
    .resize_keyboard(true)
}

/// The two menu texts carry their button rows; everything else is plain.
fn inline_markup_for(text: &str) -> Option<InlineKeyboardMarkup> {
    if text == messages::MENU {
        return Some(InlineKeyboardMarkup::new(vec![
            vec![
                InlineKeyboardButton::callback("Выбрать имя", "name"),
                InlineKeyboardButton::callback("Донат", "donate"),
            ],
            vec![
                InlineKeyboardButton::callback("Статус", "status"),
                InlineKeyboardButton::callback("Версия", "changelog"),
            ],
            vec![
                InlineKeyboardButton::callback("Beta", "beta"),
                InlineKeyboardButton::callback("Стабильная", "stable"),
            ],
        ]));
    }
    if text == messages::MEMORY_MENU {
        return Some(InlineKeyboardMarkup::new(vec![vec![
            InlineKeyboardButton::callback("Запомнить", "remember"),
            InlineKeyboardButton::callback("Вспомнить", "recall"),
            InlineKeyboardButton::callback("Забыть", "forget"),
        ]]));
    }
    None
}

/// Forwards feedback to the operator chat. Errors surface to the user
/// as an apology instead of a false "sent" confirmation.
struct OperatorSink {
    bot: Bot,
    chat: Option<ChatId>,
}

#[async_trait]
impl NotificationSink for OperatorSink {
    async fn notify_operator(&self, text: &str) -> Result<(), CoreError> {
        let Some(chat) = self.chat else {
            return Err(CoreError::Notify(format!(
                "{OPERATOR_CHAT_ENV} is not set"
            )));
        };
        self.bot
            .send_message(chat, text)
            .await
            .map_err(|e| CoreError::Notify(e.to_string()))?;
        Ok(())
    }
}

/// Placeholder until a speech backend is wired in. Never consumes
/// quota: the unavailable path does not commit.
struct UnconfiguredTranscriber;

#[async_trait]
impl Transcriber for UnconfiguredTranscriber {
    async fn transcribe(&self, _file_token: &str) -> Result<String, TranscribeError> {
        Err(TranscribeError::Unavailable(
            "speech recognition backend is not configured".to_string(),
        ))
    }
}

/// The Bot API in use has no refund call, so refunds are flagged for
/// the operator and the user is told to get in touch.
struct ManualRefunds;

#[async_trait]
impl PaymentGateway for ManualRefunds {
    async fn refund(&self, user: UserId, charge_id: &str) -> Result<(), CoreError> {
        warn!(user = user.0, charge_id, "manual refund required");
        Err(CoreError::Refund("manual refund required".to_string()))
    }
}
