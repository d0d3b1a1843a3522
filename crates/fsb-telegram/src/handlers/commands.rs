use std::{str::FromStr, time::Duration};

use tracing::{info, warn};

use fsb_core::{
    config::FREE_COMMANDS,
    domain::{MessageId, UserId},
    errors::Error,
    formatting::{premium_line, quota_status_line, readable_duration, token_balance},
    links::{encode_file_link, verify_payload},
    premium::PlanType,
    security::is_admin,
    Result,
};

use super::{reply, start::handle_start, Ctx};
use crate::router::AppState;

fn parse_command(text: &str) -> (String, String) {
    // Telegram may send `/cmd@botname arg1 ...`
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

fn usage(text: &str) -> Error {
    Error::Validation(format!("Usage: {text}"))
}

fn parse_user_id(raw: Option<&str>, usage_text: &str) -> Result<UserId> {
    raw.and_then(|s| s.parse::<i64>().ok())
        .map(UserId)
        .ok_or_else(|| usage(usage_text))
}

const ADMIN_COMMANDS: &[&str] = &[
    "addpremium",
    "removepremium",
    "listpremium",
    "resetquota",
    "verifymode",
    "setdeletetime",
    "genlink",
    "stats",
    "users",
];

pub(crate) async fn handle_command(state: &AppState, ctx: &Ctx, text: &str) {
    let (cmd, arg) = parse_command(text);
    let reply_text = match run_command(state, ctx, &cmd, &arg).await {
        Ok(t) => t,
        Err(e) => {
            if !matches!(e, Error::Validation(_) | Error::NotFound(_) | Error::Conflict(_)) {
                warn!(user_id = ctx.user_id.0, command = %cmd, error = %e, "command failed");
            }
            e.user_message()
        }
    };
    if !reply_text.is_empty() {
        reply(state, ctx.chat_id, &reply_text).await;
    }
}

async fn run_command(state: &AppState, ctx: &Ctx, cmd: &str, arg: &str) -> Result<String> {
    if ADMIN_COMMANDS.contains(&cmd) && !is_admin(Some(ctx.user_id), state.services.cfg.as_ref()) {
        info!(user_id = ctx.user_id.0, command = %cmd, "admin command refused");
        return Ok("⛔ This command is for admins only.".to_string());
    }

    let svc = &state.services;
    let mut args = arg.split_whitespace();

    match cmd {
        "start" => handle_start(state, ctx, arg).await,

        "token" => {
            if !svc.settings.verify_mode() || svc.quota.is_exempt(ctx.user_id).await {
                return Ok("🔥 You have unlimited access; no verification needed.".to_string());
            }
            let token = svc.verification.issue(ctx.user_id).await?;
            let link = state.start_link(&verify_payload(ctx.user_id, &token));
            Ok(format!(
                "🔑 <a href=\"{link}\">Tap here to verify</a> and get {FREE_COMMANDS} more free commands.\n\n\
The link is valid for {} and works once.",
                readable_duration(svc.cfg.verify_token_ttl)
            ))
        }

        "myplan" => {
            let mut lines = Vec::new();
            match svc.premium.info(ctx.user_id).await? {
                Some(rec) if rec.is_active() => {
                    lines.push(format!("💎 <b>Plan:</b> {}", rec.plan));
                    lines.push(format!("<b>Balance:</b> {}", token_balance(rec.tokens_remaining)));
                }
                _ => lines.push("You have no active premium plan.".to_string()),
            }
            if svc.settings.verify_mode() {
                let status = svc.quota.check_limit(ctx.user_id).await?;
                lines.push(quota_status_line(&status, FREE_COMMANDS));
            }
            Ok(lines.join("\n"))
        }

        "addpremium" => {
            const USAGE: &str = "/addpremium <user_id> <basic|standard|premium|unlimited> [tokens]";
            let user = parse_user_id(args.next(), USAGE)?;
            let plan = PlanType::from_str(args.next().ok_or_else(|| usage(USAGE))?)?;
            let rec = match args.next() {
                Some(raw) => {
                    let tokens = raw.parse::<i64>().map_err(|_| usage(USAGE))?;
                    svc.premium.grant(user, plan, tokens).await?
                }
                None => svc.premium.grant_plan(user, plan).await?,
            };
            Ok(format!("✅ Premium granted: {}", premium_line(&rec)))
        }

        "removepremium" => {
            let user = parse_user_id(args.next(), "/removepremium <user_id>")?;
            svc.premium.revoke(user).await?;
            Ok(format!("✅ Premium removed from <code>{}</code>.", user.0))
        }

        "listpremium" => {
            let records = svc.premium.list().await?;
            if records.is_empty() {
                return Ok("No premium users.".to_string());
            }
            let mut lines = vec![format!("💎 <b>Premium users ({})</b>", records.len())];
            lines.extend(records.iter().map(premium_line));
            Ok(lines.join("\n"))
        }

        "resetquota" => {
            let user = parse_user_id(args.next(), "/resetquota <user_id>")?;
            svc.quota.reset(user).await?;
            Ok(format!("✅ Quota reset for <code>{}</code>.", user.0))
        }

        "verifymode" => {
            let on = match args.next().map(str::to_lowercase).as_deref() {
                Some("on") => true,
                Some("off") => false,
                _ => return Err(usage("/verifymode on|off")),
            };
            svc.settings.set_verify_mode(on);
            info!(admin = ctx.user_id.0, on, "verify mode changed");
            Ok(format!(
                "✅ Verification is now <b>{}</b>.",
                if on { "on" } else { "off" }
            ))
        }

        "setdeletetime" => {
            let secs = args
                .next()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| usage("/setdeletetime <seconds>"))?;
            let ttl = Duration::from_secs(secs);
            svc.settings.set_auto_delete_time(ttl)?;
            info!(admin = ctx.user_id.0, secs, "auto-delete time changed");
            Ok(if ttl.is_zero() {
                "✅ Auto-delete disabled.".to_string()
            } else {
                format!("✅ Delivered files now auto-delete after {}.", readable_duration(ttl))
            })
        }

        "genlink" => {
            const USAGE: &str = "/genlink <message_id> [last_message_id]";
            let parse = |s: &str| s.parse::<i32>().ok().filter(|n| *n > 0).map(MessageId);
            let first = args.next().and_then(parse).ok_or_else(|| usage(USAGE))?;
            let last = match args.next() {
                Some(raw) => Some(parse(raw).ok_or_else(|| usage(USAGE))?),
                None => None,
            };
            let payload = encode_file_link(first, last, svc.cfg.channel_id);
            Ok(format!("🔗 <code>{}</code>", state.start_link(&payload)))
        }

        "users" => {
            let total = svc.users.count_users().await?;
            Ok(format!("👥 <b>Total users:</b> {total}"))
        }

        "stats" => {
            let users = svc.users.count_users().await?;
            let premium = svc.premium.list().await?;
            let active = premium.iter().filter(|r| r.is_active()).count();
            let rate = if users == 0 {
                0.0
            } else {
                active as f64 * 100.0 / users as f64
            };
            let pending = svc.scheduler.pending_count().await?;
            let settings = svc.settings.snapshot();
            let delete_after = if settings.auto_delete_time.is_zero() {
                "off".to_string()
            } else {
                readable_duration(settings.auto_delete_time)
            };
            Ok(format!(
                "📊 <b>Bot stats</b>\n\n\
Users: {users}\n\
Premium users: {active} active / {} total ({rate:.1}%)\n\
Pending deletion batches: {pending}\n\
Verification: {}\n\
Auto-delete: {delete_after}",
                premium.len(),
                if settings.verify_mode { "on" } else { "off" },
            ))
        }

        "help" => Ok("Commands:\n/start - Welcome and remaining free commands\n\
/token - Get a verification link\n/myplan - Show your plan"
            .to_string()),

        _ => Ok("❓ Unknown command. Try /help.".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeSet,
        path::PathBuf,
        sync::{
            atomic::{AtomicI32, Ordering},
            Arc, Mutex,
        },
    };

    use async_trait::async_trait;

    use fsb_core::{
        config::Config,
        domain::{ChatId, MessageRef},
        links::{parse_start_payload, StartPayload},
        memory::MemoryStore,
        messaging::port::{CopyOptions, MessagingPort},
        services::Services,
    };

    use super::*;

    const OWNER: UserId = UserId(1);
    const CHANNEL: i64 = -1001234567890;

    #[derive(Default)]
    struct Recorder {
        next_id: AtomicI32,
        copied: Mutex<Vec<(i64, i32)>>,
    }

    #[async_trait]
    impl MessagingPort for Recorder {
        async fn send_html(&self, chat_id: ChatId, _html: &str) -> Result<MessageRef> {
            Ok(MessageRef {
                chat_id,
                message_id: MessageId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1000),
            })
        }

        async fn copy_message(
            &self,
            to_chat: ChatId,
            _from_chat: ChatId,
            message_id: MessageId,
            _opts: &CopyOptions,
        ) -> Result<MessageRef> {
            self.copied.lock().unwrap().push((to_chat.0, message_id.0));
            Ok(MessageRef {
                chat_id: to_chat,
                message_id: MessageId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1000),
            })
        }

        async fn delete_message(&self, _msg: MessageRef) -> Result<()> {
            Ok(())
        }
    }

    fn config() -> Config {
        Config {
            bot_token: "t".to_string(),
            owner_id: OWNER,
            admins: BTreeSet::from([OWNER]),
            channel_id: CHANNEL,
            protect_content: false,
            copy_interval: Duration::ZERO,
            custom_caption: None,
            database_path: PathBuf::from(":memory:"),
            auto_delete_msg: "bye in {time}".to_string(),
            auto_del_success_msg: None,
            sweep_interval: Duration::from_secs(5),
            verify_token_ttl: Duration::from_secs(3600),
            auto_delete_time: Duration::from_secs(600),
            verify_mode: true,
        }
    }

    fn state() -> (AppState, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let messenger: Arc<dyn MessagingPort> = recorder.clone();
        let services = Services::build(
            Arc::new(config()),
            Arc::new(MemoryStore::new()),
            messenger.clone(),
        )
        .unwrap();
        (
            AppState {
                services,
                messenger,
                bot_username: "files_bot".to_string(),
            },
            recorder,
        )
    }

    fn ctx(user: i64) -> Ctx {
        Ctx {
            user_id: UserId(user),
            chat_id: ChatId(user),
            first_name: "Ann".to_string(),
        }
    }

    fn payload_of(link_html: &str) -> String {
        let start = link_html.find("?start=").unwrap() + "?start=".len();
        link_html[start..]
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect()
    }

    #[test]
    fn parses_command_with_bot_suffix() {
        assert_eq!(
            parse_command("/AddPremium@files_bot 42 basic"),
            ("addpremium".to_string(), "42 basic".to_string())
        );
        assert_eq!(parse_command("/start"), ("start".to_string(), String::new()));
    }

    #[tokio::test]
    async fn admin_commands_are_refused_for_regular_users() {
        let (st, _) = state();
        let out = run_command(&st, &ctx(9), "addpremium", "9 basic").await.unwrap();
        assert!(out.contains("admins only"));
        assert!(st.services.premium.info(UserId(9)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn addpremium_then_duplicate_is_a_conflict() {
        let (st, _) = state();
        let owner = ctx(OWNER.0);
        let out = run_command(&st, &owner, "addpremium", "9 basic 5").await.unwrap();
        assert!(out.contains("5 tokens"));

        let err = run_command(&st, &owner, "addpremium", "9 premium").await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        let err = run_command(&st, &owner, "addpremium", "9 gold").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        run_command(&st, &owner, "removepremium", "9").await.unwrap();
        let err = run_command(&st, &owner, "removepremium", "9").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn genlink_output_delivers_through_start() {
        let (st, recorder) = state();
        let out = run_command(&st, &ctx(OWNER.0), "genlink", "10 12").await.unwrap();
        let payload = payload_of(&out);
        assert_eq!(
            parse_start_payload(&payload, CHANNEL).unwrap(),
            StartPayload::Files(vec![MessageId(10), MessageId(11), MessageId(12)])
        );

        let reply = run_command(&st, &ctx(5), "start", &payload).await.unwrap();
        assert!(reply.is_empty());
        assert_eq!(recorder.copied.lock().unwrap().len(), 3);
        assert_eq!(st.services.scheduler.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn token_link_verifies_exhausted_user() {
        let (st, _) = state();
        let user = ctx(7);
        for _ in 0..FREE_COMMANDS {
            assert!(st.services.quota.consume(user.user_id).await.unwrap());
        }
        let welcome = run_command(&st, &user, "start", "").await.unwrap();
        assert!(welcome.contains("Command limit reached"));

        let out = run_command(&st, &user, "token", "").await.unwrap();
        let payload = payload_of(&out);

        // Someone else opening the link gains nothing.
        let other = run_command(&st, &ctx(8), "start", &payload).await.unwrap();
        assert!(other.contains("another user"));

        let ok = run_command(&st, &user, "start", &payload).await.unwrap();
        assert!(ok.contains("Verified"));
        let again = run_command(&st, &user, "start", &payload).await.unwrap();
        assert!(again.contains("already used"));

        let status = st.services.quota.check_limit(user.user_id).await.unwrap();
        assert_eq!(status.remaining, i64::from(FREE_COMMANDS));
    }

    #[tokio::test]
    async fn runtime_settings_follow_admin_commands() {
        let (st, _) = state();
        let owner = ctx(OWNER.0);
        run_command(&st, &owner, "verifymode", "off").await.unwrap();
        assert!(!st.services.settings.verify_mode());
        let out = run_command(&st, &ctx(3), "token", "").await.unwrap();
        assert!(out.contains("unlimited"));

        run_command(&st, &owner, "setdeletetime", "0").await.unwrap();
        assert!(st.services.settings.auto_delete_time().is_zero());
        assert!(run_command(&st, &owner, "verifymode", "maybe").await.is_err());

        let stats = run_command(&st, &owner, "stats", "").await.unwrap();
        assert!(stats.contains("Verification: off"));
        assert!(stats.contains("Auto-delete: off"));
    }

    #[tokio::test]
    async fn start_registers_users_for_stats() {
        let (st, _) = state();
        let owner = ctx(OWNER.0);
        run_command(&st, &ctx(20), "start", "").await.unwrap();
        run_command(&st, &ctx(20), "start", "").await.unwrap();
        run_command(&st, &ctx(21), "start", "").await.unwrap();
        run_command(&st, &owner, "start", "").await.unwrap();
        run_command(&st, &owner, "addpremium", "21 basic 5").await.unwrap();

        let users = run_command(&st, &owner, "users", "").await.unwrap();
        assert!(users.contains("Total users:</b> 3"));
        let refused = run_command(&st, &ctx(20), "users", "").await.unwrap();
        assert!(refused.contains("admins only"));

        let stats = run_command(&st, &owner, "stats", "").await.unwrap();
        assert!(stats.contains("Users: 3"));
        assert!(stats.contains("1 active / 1 total (33.3%)"));
    }

    #[tokio::test]
    async fn oversized_delete_time_is_rejected() {
        let (st, _) = state();
        let owner = ctx(OWNER.0);
        let err = run_command(&st, &owner, "setdeletetime", &u64::MAX.to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(st.services.settings.auto_delete_time(), Duration::from_secs(600));

        // Deliveries keep working with the previous setting.
        let link = run_command(&st, &owner, "genlink", "4").await.unwrap();
        run_command(&st, &ctx(5), "start", &payload_of(&link)).await.unwrap();
        assert_eq!(st.services.scheduler.pending_count().await.unwrap(), 1);
    }
}
