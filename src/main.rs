use std::sync::Arc;

use dotenv::dotenv;
use ent_quiz::quiz::{
    BoxError, ChatGptGenerator, QuotaPolicy, Report, Selection, SelectionStep, Stage,
    StatsSummary,
};
use ent_quiz::storage::{
    InMemorySessionStore, InMemoryStatisticsStore, JsonFileStatisticsStore, SessionStore,
    SqliteSessionStore, StatisticsStore,
};
use ent_quiz::{Config, QuizEngine, QuizError, Reply, UserId};
use log::{debug, error, info, warn};
use teloxide::{
    prelude::*,
    types::{
        ChatAction, InlineKeyboardButton, InlineKeyboardMarkup, KeyboardButton, KeyboardMarkup,
        MessageId, ParseMode,
    },
    utils::{command::BotCommands, html},
};

type HandlerResult = Result<(), BoxError>;

const OBLIGATORY: &str = "📖 Обязательные предметы";
const PROFILE: &str = "🧪 Профильные предметы";
const MOCK_EXAM: &str = "📝 Пробный ЕНТ";
const STATISTICS: &str = "📊 Статистика";
const RESTART: &str = "🔄 Пройти ещё раз";
const MENU: &str = "☰ Меню";

// Callback payloads: `pick:<subject>`, `next:<subject>`, `finish`.
const PICK: &str = "pick:";
const NEXT: &str = "next:";
const FINISH: &str = "finish";

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Доступные команды:")]
enum Command {
    #[command(description = "главное меню")]
    Start,
    #[command(description = "как пользоваться ботом")]
    Help,
    #[command(description = "💎 Premium")]
    Premium,
    #[command(description = "📊 ваша статистика")]
    Stats,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    dotenv().ok();
    pretty_env_logger::init();
    info!("Starting ENT quiz bot...");

    let config = Config::from_env()?;
    let generator = ChatGptGenerator::new(
        &config.chatgpt_api_key,
        &config.chatgpt_engine,
        config.generation_timeout,
    )?;

    let statistics: Arc<dyn StatisticsStore> = match &config.stats_path {
        Some(path) => {
            info!("Keeping statistics in {}", path.display());
            Arc::new(JsonFileStatisticsStore::open(path).await?)
        }
        None => {
            warn!("STATS_PATH is not set, statistics are kept in memory only");
            Arc::new(InMemoryStatisticsStore::new())
        }
    };

    let sessions: Arc<dyn SessionStore> = match &config.sessions_path {
        Some(path) => Arc::new(SqliteSessionStore::open(path).await?),
        None => {
            warn!("SESSIONS_PATH is not set, unfinished quizzes are lost on restart");
            Arc::new(InMemorySessionStore::new())
        }
    };

    let engine = QuizEngine::builder(Arc::new(generator), sessions, statistics)
    .quota(QuotaPolicy {
        limit: config.free_generation_limit,
        window: config.generation_window,
    })
    .timeout(config.generation_timeout)
    .build();

    for user in &config.premium_users {
        engine.set_premium(*user, true).await?;
    }
    let engine = Arc::new(engine);

    let bot = Bot::from_env();
    if let Err(e) = bot.set_my_commands(Command::bot_commands()).await {
        warn!("Could not register bot commands: {}", e);
    }

    let handler = dptree::entry()
        .branch(
            Update::filter_message()
                .branch(dptree::entry().filter_command::<Command>().endpoint(handle_command))
                .branch(dptree::endpoint(handle_text)),
        )
        .branch(Update::filter_callback_query().endpoint(handle_callback));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![engine])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
    Ok(())
}

async fn handle_command(
    bot: Bot,
    engine: Arc<QuizEngine>,
    msg: Message,
    cmd: Command,
) -> HandlerResult {
    let Some(user) = msg.from().map(|u| UserId(u.id.0)) else {
        return Ok(());
    };
    match cmd {
        Command::Start => {
            let result = engine.restart(user).await;
            let name = msg.from().map(|u| u.first_name.clone()).unwrap_or_default();
            bot.send_message(
                msg.chat.id,
                format!("👋 Добро пожаловать, {}! 🚀\n\nВыберите раздел:", html::escape(&name)),
            )
            .parse_mode(ParseMode::Html)
            .reply_markup(main_menu())
            .await?;
            if let Err(e) = result {
                send_error(&bot, msg.chat.id, &e).await?;
            }
        }
        Command::Help => {
            bot.send_message(msg.chat.id, help_text())
                .parse_mode(ParseMode::Html)
                .await?;
        }
        Command::Premium => {
            bot.send_message(msg.chat.id, PREMIUM_TEXT)
                .parse_mode(ParseMode::Html)
                .await?;
        }
        Command::Stats => send_stats(&bot, msg.chat.id, &engine, user).await?,
    }
    Ok(())
}

async fn handle_text(bot: Bot, engine: Arc<QuizEngine>, msg: Message) -> HandlerResult {
    let (Some(user), Some(text)) = (msg.from().map(|u| UserId(u.id.0)), msg.text()) else {
        bot.send_message(msg.chat.id, "Пожалуйста, отправьте текстовое сообщение.")
            .await?;
        return Ok(());
    };
    let chat = msg.chat.id;

    let result = match text {
        OBLIGATORY => engine.start_obligatory(user).await,
        PROFILE => engine.start_profile(user).await,
        MOCK_EXAM => engine.start_mock_exam(user).await,
        STATISTICS => return send_stats(&bot, chat, &engine, user).await,
        RESTART | MENU => engine.restart(user).await,
        other => match engine.stage(user).await? {
            Stage::SubjectSelecting(_) => {
                return pick_subject(&bot, &engine, chat, user, other, None).await;
            }
            Stage::InProgress { .. } => engine.submit_answer(user, other).await,
            Stage::AwaitingNextSubjectChoice => engine.choose_next_subject(user, other).await,
            Stage::Generating { .. } => Err(QuizError::GenerationInProgress),
            Stage::Idle | Stage::Completed => {
                bot.send_message(chat, "Пожалуйста, выберите раздел для начала тестирования.")
                    .reply_markup(main_menu())
                    .await?;
                return Ok(());
            }
        },
    };

    match result {
        Ok(reply) => send_reply(&bot, chat, reply).await,
        Err(e) => send_error(&bot, chat, &e).await,
    }
}

async fn handle_callback(bot: Bot, engine: Arc<QuizEngine>, q: CallbackQuery) -> HandlerResult {
    bot.answer_callback_query(q.id.clone()).await?;
    let user = UserId(q.from.id.0);
    let chat = q
        .message
        .as_ref()
        .map(|m| m.chat.id)
        .unwrap_or_else(|| ChatId::from(q.from.id));
    let Some(data) = q.data.as_deref() else {
        return Ok(());
    };

    let result = if let Some(subject) = data.strip_prefix(PICK) {
        let picker = q.message.as_ref().map(|m| m.id);
        return pick_subject(&bot, &engine, chat, user, subject, picker).await;
    } else if let Some(subject) = data.strip_prefix(NEXT) {
        engine.choose_next_subject(user, subject).await
    } else if data == FINISH {
        engine.finish_exam(user).await
    } else {
        warn!("Unknown callback payload from user {}: {:?}", user, data);
        return Ok(());
    };

    match result {
        Ok(reply) => send_reply(&bot, chat, reply).await,
        Err(e) => send_error(&bot, chat, &e).await,
    }
}

/// Apply a pick; when it completes the selection, tell the user before the
/// slow generation starts.
async fn pick_subject(
    bot: &Bot,
    engine: &QuizEngine,
    chat: ChatId,
    user: UserId,
    subject: &str,
    picker: Option<MessageId>,
) -> HandlerResult {
    let pending = match engine.pick_subject(user, subject).await {
        Ok(Selection::Continue(reply)) => return send_reply(bot, chat, reply).await,
        Ok(Selection::Generate(pending)) => pending,
        Err(e) => return send_error(bot, chat, &e).await,
    };
    if let Some(message) = picker {
        if let Err(e) = bot
            .edit_message_text(chat, message, format!("Выбран предмет: {subject}"))
            .await
        {
            warn!("Could not mark the subject picker in chat {}: {}", chat, e);
        }
    }
    notify_generation(bot, chat).await;

    match engine.generate(pending).await {
        Ok(reply) => send_reply(bot, chat, reply).await,
        Err(e) => send_error(bot, chat, &e).await,
    }
}

// Failures here must not keep the generation from running.
async fn notify_generation(bot: &Bot, chat: ChatId) {
    if let Err(e) = bot.send_chat_action(chat, ChatAction::Typing).await {
        warn!("Could not send typing action to chat {}: {}", chat, e);
    }
    if let Err(e) = bot
        .send_message(chat, "⏳ Генерирую вопросы, это может занять до пары минут...")
        .await
    {
        warn!("Could not announce generation in chat {}: {}", chat, e);
    }
}

async fn send_reply(bot: &Bot, chat: ChatId, reply: Reply) -> HandlerResult {
    match reply {
        Reply::ChooseSubject { step, options } => {
            let prefix = match step {
                SelectionStep::Obligatory => "📚",
                SelectionStep::Profile1 | SelectionStep::FullExamProfile1 => "🧪",
                SelectionStep::Profile2 { .. } | SelectionStep::FullExamProfile2 { .. } => "🔬",
            };
            let buttons = options.iter().map(|subject| {
                InlineKeyboardButton::callback(format!("{prefix} {subject}"), format!("{PICK}{subject}"))
            });
            bot.send_message(chat, selection_title(&step))
                .reply_markup(InlineKeyboardMarkup::new(in_pairs(buttons)))
                .await?;
        }
        Reply::Question(prompt) => {
            let text = format!(
                "<b>{}</b>\nВопрос {} из {}\n\n{}",
                html::escape(&prompt.subject),
                prompt.number,
                prompt.total,
                html::escape(&prompt.text)
            );
            bot.send_message(chat, text)
                .parse_mode(ParseMode::Html)
                .reply_markup(answer_keyboard())
                .await?;
        }
        Reply::ChooseNextSubject { remaining } => {
            let mut rows: Vec<Vec<InlineKeyboardButton>> = remaining
                .iter()
                .map(|subject| {
                    vec![InlineKeyboardButton::callback(
                        format!("📚 {subject}"),
                        format!("{NEXT}{subject}"),
                    )]
                })
                .collect();
            rows.push(vec![InlineKeyboardButton::callback("🏁 Завершить экзамен", FINISH)]);
            bot.send_message(chat, "Предмет завершён! Выберите следующий предмет или завершите экзамен:")
                .reply_markup(InlineKeyboardMarkup::new(rows))
                .await?;
        }
        Reply::Finished(report) => send_report(bot, chat, &report).await?,
        Reply::Menu => {
            bot.send_message(chat, "Выберите раздел:")
                .reply_markup(main_menu())
                .await?;
        }
    }
    Ok(())
}

fn selection_title(step: &SelectionStep) -> &'static str {
    match step {
        SelectionStep::Obligatory => "Выберите обязательный предмет:",
        SelectionStep::Profile1 => "Выберите первый профильный предмет:",
        SelectionStep::Profile2 { .. } => "Выберите второй профильный предмет:",
        SelectionStep::FullExamProfile1 => "Выберите первый профильный предмет для пробного ЕНТ:",
        SelectionStep::FullExamProfile2 { .. } => {
            "Выберите второй профильный предмет для пробного ЕНТ:"
        }
    }
}

/// Sends one message per subject so a full mock exam stays under the
/// Telegram message size limit.
async fn send_report(bot: &Bot, chat: ChatId, report: &Report) -> HandlerResult {
    bot.send_message(chat, "<b>🎉 Результаты теста! 🎉</b>")
        .parse_mode(ParseMode::Html)
        .await?;

    for subject in &report.subjects {
        let mut text = format!("<b>{}</b>\n", html::escape(&subject.subject));
        for (i, outcome) in subject.outcomes.iter().enumerate() {
            let given = outcome.given.map_or("нет ответа", |l| l.as_str());
            let correct = outcome.correct.map_or("-", |l| l.as_str());
            let mark = if outcome.is_correct() { "✅" } else { "❌" };
            text.push_str(&format!(
                "{}. {} Ваш ответ: {}, Правильный: {}\n",
                i + 1,
                mark,
                given,
                correct
            ));
        }
        text.push_str(&format!(
            "Итого: {}/{} ({:.2}%)",
            subject.correct, subject.total, subject.percentage
        ));
        bot.send_message(chat, text)
            .parse_mode(ParseMode::Html)
            .await?;
    }

    bot.send_message(
        chat,
        format!(
            "<b>Общий итог:</b> {}/{} ({:.2}%)",
            report.correct, report.total, report.percentage
        ),
    )
    .parse_mode(ParseMode::Html)
    .reply_markup(end_keyboard())
    .await?;
    Ok(())
}

async fn send_stats(bot: &Bot, chat: ChatId, engine: &QuizEngine, user: UserId) -> HandlerResult {
    match engine.stats(user).await {
        Ok(summary) => {
            bot.send_message(chat, stats_text(&summary))
                .parse_mode(ParseMode::Html)
                .await?;
            Ok(())
        }
        Err(e) => send_error(bot, chat, &e).await,
    }
}

fn stats_text(summary: &StatsSummary) -> String {
    if summary.is_empty() {
        return "📊 Статистика пока отсутствует. Пройдите хотя бы один тест.".to_string();
    }
    let mut report = format!(
        "📊 <b>Ваша статистика:</b>\nВсего пройдено тестов: {}\n\n",
        summary.tests_passed
    );
    if summary.averages.is_empty() {
        report.push_str("Статистика по предметам пока отсутствует.\n");
        return report;
    }
    report.push_str("<b>Средний балл по предметам:</b>\n");
    for (subject, average) in &summary.averages {
        match average {
            Some(avg) => report.push_str(&format!("  - {}: {:.2}%\n", html::escape(subject), avg)),
            None => report.push_str(&format!(
                "  - {}: Тесты еще не пройдены.\n",
                html::escape(subject)
            )),
        }
    }
    report
}

async fn send_error(bot: &Bot, chat: ChatId, err: &QuizError) -> HandlerResult {
    let text = match err {
        QuizError::GenerationSuperseded => {
            debug!("Late questions for chat {} dropped", chat);
            return Ok(());
        }
        QuizError::NoSubjectSelected => "Сначала выберите предмет.".to_string(),
        QuizError::DuplicateProfileSubject(subject) => {
            format!("Предмет «{subject}» уже выбран. Выберите другой предмет.")
        }
        QuizError::QuotaExceeded { limit } => format!(
            "⚠️ Достигнут лимит бесплатных генераций вопросов на сегодня ({limit} раза).\n\n\
             Оформите Premium для неограниченной генерации: /premium"
        ),
        QuizError::GenerationTransientFailure { subject, .. } => format!(
            "⚠️ Не удалось сгенерировать вопросы по предмету «{subject}». Попробуйте выбрать предмет ещё раз."
        ),
        QuizError::InvalidAnswerInput(_) => {
            "Пожалуйста, выберите один из вариантов ответа: A, B, C или D.".to_string()
        }
        QuizError::UnknownSubjectChoice(_) => "Пожалуйста, выберите предмет из списка.".to_string(),
        QuizError::GenerationInProgress => {
            "⏳ Вопросы ещё генерируются, пожалуйста, подождите.".to_string()
        }
        QuizError::UnexpectedAction { .. } => {
            "Пожалуйста, выберите раздел для начала тестирования.".to_string()
        }
        other => {
            error!("Request failed: {}", other);
            "⚠️ Произошла ошибка. Попробуйте позже.".to_string()
        }
    };
    bot.send_message(chat, text).await?;
    Ok(())
}

fn in_pairs(
    buttons: impl Iterator<Item = InlineKeyboardButton>,
) -> Vec<Vec<InlineKeyboardButton>> {
    let buttons: Vec<_> = buttons.collect();
    buttons.chunks(2).map(<[_]>::to_vec).collect()
}

fn main_menu() -> KeyboardMarkup {
    KeyboardMarkup::new(vec![
        vec![KeyboardButton::new(OBLIGATORY)],
        vec![KeyboardButton::new(PROFILE)],
        vec![KeyboardButton::new(MOCK_EXAM)],
        vec![KeyboardButton::new(STATISTICS)],
    ])
    .resize_keyboard(true)
}

fn answer_keyboard() -> KeyboardMarkup {
    KeyboardMarkup::new(vec![
        vec![KeyboardButton::new("A"), KeyboardButton::new("B")],
        vec![KeyboardButton::new("C"), KeyboardButton::new("D")],
    ])
    .resize_keyboard(true)
}

fn end_keyboard() -> KeyboardMarkup {
    KeyboardMarkup::new(vec![
        vec![KeyboardButton::new(RESTART)],
        vec![KeyboardButton::new(MENU)],
    ])
    .resize_keyboard(true)
}

fn help_text() -> String {
    format!(
        "ℹ️ <b>Бот для подготовки к ЕНТ</b> 📚\n\n\
         <b>{OBLIGATORY}</b> - тест по одному обязательному предмету.\n\
         <b>{PROFILE}</b> - тест по двум профильным предметам.\n\
         <b>{MOCK_EXAM}</b> - полный пробный экзамен: 120 вопросов по пяти предметам.\n\
         <b>{STATISTICS}</b> - пройденные тесты и средний балл по предметам.\n\n\
         После выбора предмета бот сгенерирует вопросы с вариантами ответов A, B, C, D. \
         Отвечайте кнопками, по завершении вы увидите результат.\n\n\
         Бесплатные генерации ограничены в сутки. Подробнее о Premium: /premium\n\n{}",
        Command::descriptions()
    )
}

const PREMIUM_TEXT: &str = "🚀 <b>Premium подписка для подготовки к ЕНТ</b> 💎\n\n\
    Оформите Premium и получите неограниченный доступ к генерации вопросов \
    и увеличьте количество вопросов за тест до 10!\n\n\
    Следите за обновлениями!";
