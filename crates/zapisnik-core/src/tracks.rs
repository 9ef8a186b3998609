//! Stable and beta handler tracks
//!
//! All the actual bot behavior lives here, shared between the two tracks
//! where it is identical. The beta track is a superset of stable: it
//! additionally handles voice transcription (with the weekly quota) and
//! payment notices, so those capabilities reach it via router fallback
//! even for stable-preference users.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::context::{Context, CoreError, TranscribeError};
use crate::event::{Event, EventKind, Invoice, PaymentNotice, Reply, VoiceNote};
use crate::router::{Capability, Track};
use crate::state::AwaitMode;
use zapisnik_store::{normalize_field, ForgetTarget, MemoryWrite, QuotaDecision, UserId};

/// Feature key for voice transcription quota fields.
pub const VOICE_FEATURE: &str = "voice";
/// Free transcriptions per rolling week.
pub const VOICE_WEEKLY_LIMIT: i64 = 10;
/// Stars to unlock one transcription past the limit.
const VOICE_UNLOCK_STARS: u32 = 5;
/// Stars for a donation.
const DONATE_STARS: u32 = 10;

/// User-facing texts, shared with tests and frontends.
pub mod messages {
    pub const GREETING: &str = "Здравствуйте, я Zapisnik.";
    pub const INTRODUCE: &str = "Давайте познакомимся! Меню > Выбрать имя";
    pub const HELP: &str = "Используйте кнопки (должны быть снизу экрана), \
         а если их нет: нажмите на 4 квадрата слева от скрепки";
    pub const MENU: &str = "Вот меню: Выбрать имя, Донат, Версия";
    pub const MEMORY_MENU: &str = "Выберите действие с памятью: Запомнить, Вспомнить, Забыть";
    pub const ASK_NAME: &str = "Как вас называть?";
    pub const ASK_FEEDBACK: &str = "Напишите Ваш отзыв";
    pub const ASK_REMEMBER: &str = "Напишите пару: ключ значение";
    pub const ASK_FORGET: &str =
        "Напишите номер записи или ключ, который хотите удалить. Или напишите \"все\"";
    pub const REMEMBER_FORMAT: &str =
        "Нужно ровно два слова: ключ значение. Откройте Память > Запомнить и попробуйте ещё раз";
    pub const NO_SUCH_KEY: &str = "Такого ключа нет";
    pub const FORGOT_ALL: &str = "Удалил все записи";
    pub const MEMORY_EMPTY: &str = "Нет элементов в памяти😔";
    pub const FEEDBACK_SENT: &str = "Написал";
    pub const NOTE_USAGE: &str = "Напишите /note <текст>, чтобы я его запомнил";
    pub const NO_SPEECH: &str = "Не удалось распознать речь.";
    pub const STORAGE_DOWN: &str = "Память сейчас недоступна, попробуйте позже😔";
    pub const SOMETHING_WRONG: &str = "Что-то пошло не так, попробуйте позже";
    pub const BETA_ON: &str = "Готово, теперь вы будете использовать beta-версию";
    pub const BETA_OFF: &str = "Готово, теперь вы будете использовать стабильную версию";
    pub const DONATE_THANKS: &str =
        "Спасибо! Если хотите отправить больше 10 звёзд, повторите процедуру оплаты несколько раз.";

    pub const INFO: &str = "Вот информация о Zapisnik:\n\
         Расшифровка голосовых сообщений в текст: отправьте или перешлите \
         голосовое сообщение. Бесплатно 10 сообщений в неделю, далее 5 звёзд за сообщение.\n\
         Память: запоминаю ключи, значения и заметки по команде /note.\n\
         Меню > Донат: не даёт привилегий, просто поддержка разработчика.";
    pub const STATUS: &str = "Выбрать имя — ✅\n\
         Кубик — ✅\n\
         Отзыв — ✅\n\
         Память🧠 — ✅\n\
         Расшифровка голосовых сообщений — ✅";
    pub const CHANGELOG: &str = "2.1: Добавлена расшифровка голосовых сообщений.\n\
         2.2: Кубик и тд. в чатах с другими людьми\n\
         2.3: Расшифровка стала платной😈\n\
         3.0: Память переехала на ключи и значения";
}

/// Parsed `feature:token` payment payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaidFeature {
    Donate,
    VoiceUnlock { file_token: String },
}

impl PaidFeature {
    pub fn parse(payload: &str) -> Option<PaidFeature> {
        if payload == "donate" {
            return Some(PaidFeature::Donate);
        }
        if let Some(token) = payload.strip_prefix("voice:") {
            return Some(PaidFeature::VoiceUnlock {
                file_token: token.trim().to_string(),
            });
        }
        None
    }
}

/// The original handler set: everything except voice and payments.
pub struct StableTrack;

#[async_trait]
impl Track for StableTrack {
    fn name(&self) -> &'static str {
        "stable"
    }

    fn supports(&self, cap: Capability) -> bool {
        !matches!(cap, Capability::Voice | Capability::Payment)
    }

    async fn handle(
        &self,
        ctx: &Context,
        cap: Capability,
        event: &Event,
    ) -> Result<Vec<Reply>, CoreError> {
        match common(ctx, cap, event).await? {
            Some(replies) => Ok(replies),
            None => Ok(vec![Reply::text(messages::HELP)]),
        }
    }
}

/// Superset of stable, plus the metered voice feature and payments.
pub struct BetaTrack;

#[async_trait]
impl Track for BetaTrack {
    fn name(&self) -> &'static str {
        "beta"
    }

    fn supports(&self, _cap: Capability) -> bool {
        true
    }

    async fn handle(
        &self,
        ctx: &Context,
        cap: Capability,
        event: &Event,
    ) -> Result<Vec<Reply>, CoreError> {
        match (cap, &event.kind) {
            (Capability::Voice, EventKind::Voice(note)) => {
                handle_voice(ctx, event.sender, note).await
            }
            (Capability::Payment, EventKind::Payment(notice)) => {
                handle_payment(ctx, event.sender, notice).await
            }
            _ => match common(ctx, cap, event).await? {
                Some(replies) => Ok(replies),
                None => Ok(vec![Reply::text(messages::HELP)]),
            },
        }
    }
}

/// Handlers both tracks share. `None` means the capability has no common
/// handler (voice/payment on the stable track).
async fn common(
    ctx: &Context,
    cap: Capability,
    event: &Event,
) -> Result<Option<Vec<Reply>>, CoreError> {
    let user = event.sender;
    let replies = match cap {
        Capability::Start => handle_start(ctx, user)?,
        Capability::Info => vec![Reply::text(messages::INFO)],
        Capability::Status => vec![Reply::text(messages::STATUS)],
        Capability::Changelog => vec![Reply::text(messages::CHANGELOG)],
        Capability::Menu => vec![Reply::text(messages::MENU)],
        Capability::MemoryMenu => vec![Reply::text(messages::MEMORY_MENU)],
        Capability::RollDice => vec![Reply::Dice],
        Capability::ChooseName => {
            ctx.states.set(user, AwaitMode::Name);
            vec![Reply::text(messages::ASK_NAME)]
        }
        Capability::Feedback => {
            ctx.states.set(user, AwaitMode::Feedback);
            vec![Reply::text(messages::ASK_FEEDBACK)]
        }
        Capability::Remember => {
            ctx.states.set(user, AwaitMode::Remember);
            vec![Reply::text(messages::ASK_REMEMBER)]
        }
        Capability::Forget => {
            ctx.states.set(user, AwaitMode::Forget);
            let mut replies = vec![Reply::text(messages::ASK_FORGET)];
            replies.extend(recall_listing(ctx, user)?);
            replies
        }
        Capability::Recall => recall_listing(ctx, user)?,
        Capability::Note => match &event.kind {
            EventKind::Command { args, .. } => handle_note(ctx, user, args)?,
            _ => vec![Reply::text(messages::NOTE_USAGE)],
        },
        Capability::TrackSelect => match &event.kind {
            EventKind::Button(data) if data == "beta" => {
                ctx.store.set_field(user, "beta", "True".into())?;
                vec![Reply::text(messages::BETA_ON)]
            }
            _ => {
                ctx.store.set_field(user, "beta", "False".into())?;
                vec![Reply::text(messages::BETA_OFF)]
            }
        },
        Capability::Donate => vec![Reply::Invoice(donate_invoice())],
        Capability::FreeText => match &event.kind {
            EventKind::Text(text) => handle_free_text(ctx, user, text).await?,
            _ => vec![Reply::text(messages::HELP)],
        },
        Capability::Voice | Capability::Payment => return Ok(None),
    };
    Ok(Some(replies))
}

fn handle_start(ctx: &Context, user: UserId) -> Result<Vec<Reply>, CoreError> {
    let mut replies = vec![Reply::text(messages::GREETING)];
    match ctx.store.get_field(user, "name")? {
        Some(name) => replies.push(Reply::Text(format!("О! Я вас помню! Вы {name}"))),
        None => replies.push(Reply::text(messages::INTRODUCE)),
    }
    Ok(replies)
}

fn handle_note(ctx: &Context, user: UserId, args: &str) -> Result<Vec<Reply>, CoreError> {
    let text = args.trim();
    if text.is_empty() {
        return Ok(vec![Reply::text(messages::NOTE_USAGE)]);
    }
    let reply = match ctx.store.add_memory(user, text)? {
        MemoryWrite::Inserted(id) => format!("Запомнил!\n{text} (№{id})"),
        MemoryWrite::Duplicate(id) => format!("Это уже записано (№{id})"),
    };
    Ok(vec![Reply::Text(reply)])
}

/// Everything the user asked to remember: free-form fields as
/// `key: value`, entries as `id: text`.
fn recall_listing(ctx: &Context, user: UserId) -> Result<Vec<Reply>, CoreError> {
    let fields = ctx.store.list_fields(user)?;
    let entries = ctx.store.list_memory(user)?;
    if fields.is_empty() && entries.is_empty() {
        return Ok(vec![Reply::text(messages::MEMORY_EMPTY)]);
    }

    let mut lines = Vec::with_capacity(fields.len() + entries.len());
    for (name, value) in fields {
        lines.push(format!("{name}: {value}"));
    }
    for entry in entries {
        lines.push(format!("{}: {}", entry.id, entry.text));
    }
    Ok(vec![Reply::Text(lines.join("\n"))])
}

/// Continuation of a pending awaiting-input mode, or help when idle.
///
/// The mode is taken before handling: one attempt per menu action,
/// malformed input answers once and the state is gone either way.
async fn handle_free_text(ctx: &Context, user: UserId, text: &str) -> Result<Vec<Reply>, CoreError> {
    let Some(mode) = ctx.states.take(user) else {
        return Ok(vec![Reply::text(messages::HELP)]);
    };

    match mode {
        AwaitMode::Name => {
            let name = text.trim();
            ctx.store.set_field(user, "name", name.into())?;
            Ok(vec![Reply::Text(format!("Запомнил! Теперь вы — {name}"))])
        }
        AwaitMode::Feedback => {
            ctx.sink
                .notify_operator(&format!("Хозяин, у тебя отзыв.\n{text}"))
                .await?;
            Ok(vec![Reply::text(messages::FEEDBACK_SENT)])
        }
        AwaitMode::Remember => {
            let tokens: Vec<&str> = text.split_whitespace().collect();
            match tokens.as_slice() {
                [key, value] => {
                    ctx.store.set_field(user, key, (*value).into())?;
                    Ok(vec![Reply::Text(format!(
                        "Запомнил: {} = {}",
                        normalize_field(key),
                        value
                    ))])
                }
                _ => Ok(vec![Reply::text(messages::REMEMBER_FORMAT)]),
            }
        }
        AwaitMode::Forget => handle_forget_input(ctx, user, text),
    }
}

/// "все"/"всё"/"all" wipes the whole record; a number deletes that
/// memory entry, or the field of that name when no entry matches;
/// anything else names a field. Unknown keys answer "no such key" and
/// delete nothing.
fn handle_forget_input(ctx: &Context, user: UserId, text: &str) -> Result<Vec<Reply>, CoreError> {
    let target = text.trim();
    let lowered = target.to_lowercase();

    if matches!(lowered.as_str(), "all" | "все" | "всё") {
        ctx.store.delete_user(user)?;
        return Ok(vec![Reply::text(messages::FORGOT_ALL)]);
    }

    // digits name an entry first, then a field with that exact name
    if let Ok(id) = target.parse::<i64>() {
        if ctx.store.delete_memory(user, ForgetTarget::Entry(id))? > 0 {
            return Ok(vec![Reply::Text(format!("Удалил запись {id}"))]);
        }
    }

    let reply = if ctx.store.delete_field(user, target)? {
        format!("Удалил ключ {} и его значение", normalize_field(target))
    } else {
        messages::NO_SUCH_KEY.to_string()
    };
    Ok(vec![Reply::Text(reply)])
}

/// The metered feature. Quota is checked first; the counter moves only
/// after a transcription actually came back, so a failed run costs the
/// user nothing.
async fn handle_voice(ctx: &Context, user: UserId, note: &VoiceNote) -> Result<Vec<Reply>, CoreError> {
    match ctx.quota.check(user, VOICE_FEATURE, VOICE_WEEKLY_LIMIT)? {
        QuotaDecision::Denied { resets_at } => {
            debug!(user = user.0, resets_at, "voice quota exhausted, sending invoice");
            Ok(vec![Reply::Invoice(voice_unlock_invoice(&note.file_token))])
        }
        QuotaDecision::Allowed { used } => {
            debug!(user = user.0, used, "transcribing within free quota");
            match ctx.transcriber.transcribe(&note.file_token).await {
                Ok(text) => {
                    // a lost increment must not withhold the finished text
                    if let Err(e) = ctx.quota.commit(user, VOICE_FEATURE) {
                        warn!(user = user.0, error = %e, "quota commit failed after transcription");
                    }
                    Ok(vec![Reply::Text(format!("Расшифрованный текст: {text}"))])
                }
                Err(TranscribeError::NoSpeech) => Ok(vec![Reply::text(messages::NO_SPEECH)]),
                Err(TranscribeError::Unavailable(e)) => {
                    warn!(user = user.0, error = %e, "transcriber unavailable");
                    Ok(vec![Reply::text(messages::SOMETHING_WRONG)])
                }
            }
        }
    }
}

/// A completed charge. Paid transcriptions never touch the weekly
/// counter, and anything that fails after payment is refunded.
async fn handle_payment(
    ctx: &Context,
    user: UserId,
    notice: &PaymentNotice,
) -> Result<Vec<Reply>, CoreError> {
    match PaidFeature::parse(&notice.payload) {
        Some(PaidFeature::Donate) => Ok(vec![Reply::text(messages::DONATE_THANKS)]),
        Some(PaidFeature::VoiceUnlock { file_token }) if file_token.is_empty() => {
            refund_and_notify(
                ctx,
                user,
                notice,
                "Не удалось определить, какое сообщение расшифровать после оплаты.",
            )
            .await
        }
        Some(PaidFeature::VoiceUnlock { file_token }) => {
            match ctx.transcriber.transcribe(&file_token).await {
                Ok(text) => Ok(vec![Reply::Text(format!(
                    "Расшифрованный текст (оплачено): {text}"
                ))]),
                Err(TranscribeError::NoSpeech) => {
                    refund_and_notify(
                        ctx,
                        user,
                        notice,
                        "Не удалось распознать речь по оплаченному сообщению.",
                    )
                    .await
                }
                Err(TranscribeError::Unavailable(e)) => {
                    warn!(user = user.0, error = %e, "paid transcription failed");
                    refund_and_notify(
                        ctx,
                        user,
                        notice,
                        "Произошла ошибка при обработке оплаченного сообщения.",
                    )
                    .await
                }
            }
        }
        None => {
            debug!(user = user.0, payload = %notice.payload, "unknown payment payload, ignoring");
            Ok(vec![])
        }
    }
}

async fn refund_and_notify(
    ctx: &Context,
    user: UserId,
    notice: &PaymentNotice,
    reason: &str,
) -> Result<Vec<Reply>, CoreError> {
    let Some(charge_id) = &notice.charge_id else {
        return Ok(vec![Reply::Text(format!(
            "{reason}\nНе найден идентификатор платежа для возврата. Свяжитесь с поддержкой."
        ))]);
    };
    match ctx.payments.refund(user, charge_id).await {
        Ok(()) => Ok(vec![Reply::Text(format!("{reason}\nСредства возвращены."))]),
        Err(e) => {
            warn!(user = user.0, error = %e, "refund failed");
            Ok(vec![Reply::Text(format!(
                "{reason}\nНе удалось автоматически вернуть средства. Свяжитесь с поддержкой."
            ))])
        }
    }
}

fn voice_unlock_invoice(file_token: &str) -> Invoice {
    Invoice {
        title: "Лимит расшифровок".to_string(),
        description: format!(
            "Вы использовали {VOICE_WEEKLY_LIMIT} бесплатных расшифровок на этой неделе. \
             Купите доступ за {VOICE_UNLOCK_STARS} звёзд."
        ),
        payload: format!("voice:{file_token}"),
        label: "Voice transcription".to_string(),
        amount: VOICE_UNLOCK_STARS,
    }
}

fn donate_invoice() -> Invoice {
    Invoice {
        title: "Донат".to_string(),
        description: format!("{DONATE_STARS} звёзд за раз"),
        payload: "donate".to_string(),
        label: "Донат".to_string(),
        amount: DONATE_STARS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::testutil::{world, world_with_transcriber, NoSpeechTranscriber};
    use std::sync::Arc;
    use zapisnik_store::{FieldValue, MemoryEntry, RecordStore, StoreError};

    const U: UserId = UserId(1001);

    fn text_of(replies: &[Reply]) -> String {
        replies
            .iter()
            .filter_map(|r| match r {
                Reply::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[tokio::test]
    async fn test_remember_key_value_scenario() {
        let w = world();
        let router = w.router();

        router.dispatch(Event::button(U, "remember")).await;
        assert_eq!(w.ctx.states.current(U), Some(AwaitMode::Remember));

        let replies = router.dispatch(Event::text(U, "color blue")).await;
        assert!(text_of(&replies).contains("color = blue"));
        assert_eq!(w.ctx.states.current(U), None);
        assert_eq!(
            w.ctx.store.get_field(U, "color").unwrap(),
            Some("blue".into())
        );
    }

    #[tokio::test]
    async fn test_malformed_remember_reprompts_and_clears() {
        let w = world();
        let router = w.router();

        router.dispatch(Event::button(U, "remember")).await;
        let replies = router.dispatch(Event::text(U, "just-one-token")).await;

        assert_eq!(replies, vec![Reply::text(messages::REMEMBER_FORMAT)]);
        // one attempt per menu action: the state is gone
        assert_eq!(w.ctx.states.current(U), None);
        assert_eq!(w.ctx.store.get_field(U, "just-one-token").unwrap(), None);
    }

    #[tokio::test]
    async fn test_forget_unknown_key() {
        let w = world();
        let router = w.router();

        router.dispatch(Event::button(U, "forget")).await;
        let replies = router.dispatch(Event::text(U, "color")).await;

        assert_eq!(replies, vec![Reply::text(messages::NO_SUCH_KEY)]);
        assert_eq!(w.ctx.states.current(U), None);
    }

    #[tokio::test]
    async fn test_forget_field_and_entry() {
        let w = world();
        let router = w.router();
        w.ctx.store.set_field(U, "color", "blue".into()).unwrap();
        let id = w.ctx.store.add_memory(U, "buy milk").unwrap().id();

        router.dispatch(Event::button(U, "forget")).await;
        let replies = router.dispatch(Event::text(U, "color")).await;
        assert!(text_of(&replies).contains("Удалил ключ color"));
        assert_eq!(w.ctx.store.get_field(U, "color").unwrap(), None);

        router.dispatch(Event::button(U, "forget")).await;
        let replies = router.dispatch(Event::text(U, id.to_string())).await;
        assert!(text_of(&replies).contains(&format!("Удалил запись {id}")));
        assert!(w.ctx.store.list_memory(U).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_forget_all_digit_field_name() {
        let w = world();
        let router = w.router();
        w.ctx.store.set_field(U, "2024", "olympics".into()).unwrap();

        // no entry has that id, so the digits resolve to the field
        router.dispatch(Event::button(U, "forget")).await;
        let replies = router.dispatch(Event::text(U, "2024")).await;

        assert!(text_of(&replies).contains("Удалил ключ 2024"));
        assert_eq!(w.ctx.store.get_field(U, "2024").unwrap(), None);
    }

    #[tokio::test]
    async fn test_forget_all_wipes_record() {
        let w = world();
        let router = w.router();
        w.ctx.store.set_field(U, "name", "Dima".into()).unwrap();
        w.ctx.store.add_memory(U, "a").unwrap();

        router.dispatch(Event::button(U, "forget")).await;
        let replies = router.dispatch(Event::text(U, "Всё")).await;

        assert_eq!(replies, vec![Reply::text(messages::FORGOT_ALL)]);
        assert_eq!(w.ctx.store.get_field(U, "name").unwrap(), None);
        assert!(w.ctx.store.list_memory(U).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_name_flow() {
        let w = world();
        let router = w.router();

        router.dispatch(Event::button(U, "name")).await;
        let replies = router.dispatch(Event::text(U, "Дима")).await;

        assert!(text_of(&replies).contains("Дима"));
        assert_eq!(w.ctx.store.get_field(U, "name").unwrap(), Some("Дима".into()));

        // greeting now remembers
        let replies = router.dispatch(Event::command(U, "start", "")).await;
        assert!(text_of(&replies).contains("Я вас помню"));
    }

    #[tokio::test]
    async fn test_feedback_reaches_operator() {
        let w = world();
        let router = w.router();

        router
            .dispatch(Event::text(U, "Вопрос/Отзыв"))
            .await;
        let replies = router.dispatch(Event::text(U, "отличный бот")).await;

        assert_eq!(replies, vec![Reply::text(messages::FEEDBACK_SENT)]);
        let sent = w.sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("отличный бот"));
    }

    #[tokio::test]
    async fn test_idle_free_text_gets_help_and_touches_nothing() {
        let w = world();
        let router = w.router();

        let replies = router.dispatch(Event::text(U, "привет")).await;
        assert_eq!(replies, vec![Reply::text(messages::HELP)]);
        assert!(w.ctx.store.list_fields(U).unwrap().is_empty());
        assert!(w.ctx.store.list_memory(U).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_note_and_duplicate_note() {
        let w = world();
        let router = w.router();

        let replies = router.dispatch(Event::command(U, "note", "buy milk")).await;
        assert!(text_of(&replies).contains("Запомнил"));

        let replies = router.dispatch(Event::command(U, "note", "buy milk")).await;
        assert!(text_of(&replies).contains("уже записано"));
        assert_eq!(w.ctx.store.list_memory(U).unwrap().len(), 1);

        let replies = router.dispatch(Event::command(U, "note", "  ")).await;
        assert_eq!(replies, vec![Reply::text(messages::NOTE_USAGE)]);
    }

    #[tokio::test]
    async fn test_recall_lists_fields_and_entries() {
        let w = world();
        let router = w.router();

        let replies = router.dispatch(Event::button(U, "recall")).await;
        assert_eq!(replies, vec![Reply::text(messages::MEMORY_EMPTY)]);

        w.ctx.store.set_field(U, "color", "blue".into()).unwrap();
        let id = w.ctx.store.add_memory(U, "buy milk").unwrap().id();

        let replies = router.dispatch(Event::button(U, "recall")).await;
        let listing = text_of(&replies);
        assert!(listing.contains("color: blue"));
        assert!(listing.contains(&format!("{id}: buy milk")));
    }

    #[tokio::test]
    async fn test_voice_commits_quota_on_success() {
        let w = world();
        let router = w.router();

        let replies = router
            .dispatch(Event {
                sender: U,
                kind: EventKind::Voice(VoiceNote {
                    file_token: "f1".into(),
                }),
            })
            .await;

        assert!(text_of(&replies).contains("Расшифрованный текст"));
        assert_eq!(
            w.ctx.store.get_field(U, "voice_counter").unwrap(),
            Some(FieldValue::Integer(1))
        );
    }

    #[tokio::test]
    async fn test_failed_transcription_spares_quota() {
        let w = world_with_transcriber(Arc::new(NoSpeechTranscriber));
        let router = w.router();

        let replies = router
            .dispatch(Event {
                sender: U,
                kind: EventKind::Voice(VoiceNote {
                    file_token: "f1".into(),
                }),
            })
            .await;

        assert_eq!(replies, vec![Reply::text(messages::NO_SPEECH)]);
        assert_eq!(
            w.ctx.store.get_field(U, "voice_counter").unwrap(),
            Some(FieldValue::Integer(0))
        );
    }

    /// Delegates to a real store but refuses counter increments, so the
    /// quota check passes and only the commit fails.
    struct CommitFailStore {
        inner: Arc<dyn RecordStore>,
    }

    impl RecordStore for CommitFailStore {
        fn set_field(&self, user: UserId, field: &str, value: FieldValue) -> Result<(), StoreError> {
            if field == "voice_counter" && value.as_i64().unwrap_or(0) > 0 {
                return Err(StoreError::Unavailable("db went away".into()));
            }
            self.inner.set_field(user, field, value)
        }
        fn get_field(&self, user: UserId, field: &str) -> Result<Option<FieldValue>, StoreError> {
            self.inner.get_field(user, field)
        }
        fn list_fields(&self, user: UserId) -> Result<Vec<(String, FieldValue)>, StoreError> {
            self.inner.list_fields(user)
        }
        fn delete_field(&self, user: UserId, field: &str) -> Result<bool, StoreError> {
            self.inner.delete_field(user, field)
        }
        fn add_memory(&self, user: UserId, text: &str) -> Result<MemoryWrite, StoreError> {
            self.inner.add_memory(user, text)
        }
        fn list_memory(&self, user: UserId) -> Result<Vec<MemoryEntry>, StoreError> {
            self.inner.list_memory(user)
        }
        fn delete_memory(&self, user: UserId, target: ForgetTarget) -> Result<usize, StoreError> {
            self.inner.delete_memory(user, target)
        }
        fn delete_user(&self, user: UserId) -> Result<(), StoreError> {
            self.inner.delete_user(user)
        }
    }

    #[tokio::test]
    async fn test_transcription_survives_commit_failure() {
        let w = world();
        let inner = w.ctx.store.clone();
        let w = w.with_store(Arc::new(CommitFailStore { inner }));
        let router = w.router();

        let replies = router
            .dispatch(Event {
                sender: U,
                kind: EventKind::Voice(VoiceNote {
                    file_token: "f1".into(),
                }),
            })
            .await;

        // the text made it back; the lost increment is only logged
        assert!(text_of(&replies).contains("Расшифрованный текст"));
    }

    #[tokio::test]
    async fn test_exhausted_quota_sends_invoice() {
        let w = world();
        let router = w.router();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        w.ctx.store.set_field(U, "voice_time", now.into()).unwrap();
        w.ctx
            .store
            .set_field(U, "voice_counter", VOICE_WEEKLY_LIMIT.into())
            .unwrap();

        let replies = router
            .dispatch(Event {
                sender: U,
                kind: EventKind::Voice(VoiceNote {
                    file_token: "f9".into(),
                }),
            })
            .await;

        match &replies[0] {
            Reply::Invoice(invoice) => {
                assert_eq!(invoice.payload, "voice:f9");
                assert_eq!(invoice.amount, 5);
            }
            other => panic!("expected invoice, got {other:?}"),
        }
        // denied check must not have moved the counter
        assert_eq!(
            w.ctx.store.get_field(U, "voice_counter").unwrap(),
            Some(FieldValue::Integer(VOICE_WEEKLY_LIMIT))
        );
    }

    #[tokio::test]
    async fn test_paid_voice_skips_counter() {
        let w = world();
        let router = w.router();

        let replies = router
            .dispatch(Event {
                sender: U,
                kind: EventKind::Payment(PaymentNotice {
                    payload: "voice:f2".into(),
                    charge_id: Some("ch_1".into()),
                }),
            })
            .await;

        assert!(text_of(&replies).contains("оплачено"));
        assert_eq!(w.ctx.store.get_field(U, "voice_counter").unwrap(), None);
        assert!(w.gateway.refunds.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_paid_voice_refunds() {
        let w = world_with_transcriber(Arc::new(NoSpeechTranscriber));
        let router = w.router();

        let replies = router
            .dispatch(Event {
                sender: U,
                kind: EventKind::Payment(PaymentNotice {
                    payload: "voice:f2".into(),
                    charge_id: Some("ch_1".into()),
                }),
            })
            .await;

        assert!(text_of(&replies).contains("Средства возвращены"));
        assert_eq!(
            w.gateway.refunds.lock().unwrap().as_slice(),
            ["ch_1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unknown_payment_payload_ignored() {
        let w = world();
        let router = w.router();

        let replies = router
            .dispatch(Event {
                sender: U,
                kind: EventKind::Payment(PaymentNotice {
                    payload: "mystery".into(),
                    charge_id: None,
                }),
            })
            .await;
        assert!(replies.is_empty());
    }

    #[test]
    fn test_paid_feature_parse() {
        assert_eq!(PaidFeature::parse("donate"), Some(PaidFeature::Donate));
        assert_eq!(
            PaidFeature::parse("voice:abc"),
            Some(PaidFeature::VoiceUnlock {
                file_token: "abc".into()
            })
        );
        assert_eq!(PaidFeature::parse("scan:abc"), None);
        assert_eq!(PaidFeature::parse(""), None);
    }

    #[tokio::test]
    async fn test_beta_opt_in_and_out() {
        let w = world();
        let router = w.router();

        router.dispatch(Event::button(U, "beta")).await;
        assert_eq!(
            w.ctx.store.get_field(U, "beta").unwrap(),
            Some("True".into())
        );

        router.dispatch(Event::button(U, "stable")).await;
        assert_eq!(
            w.ctx.store.get_field(U, "beta").unwrap(),
            Some("False".into())
        );
    }
}
