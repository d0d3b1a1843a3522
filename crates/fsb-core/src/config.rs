use std::{
    collections::BTreeSet,
    env, fs,
    path::{Path, PathBuf},
    sync::RwLock,
    time::Duration,
};

use crate::{domain::UserId, errors::Error, Result};

/// Free commands granted per verification cycle.
pub const FREE_COMMANDS: u32 = 3;

/// Longest auto-delete delay an admin may configure.
pub const MAX_AUTO_DELETE_TIME: Duration = Duration::from_secs(30 * 86_400);

const DEFAULT_AUTO_DELETE_MSG: &str =
    "⏳ These files will be automatically deleted in {time}. Save them somewhere else.";
const DEFAULT_AUTO_DEL_SUCCESS_MSG: &str = "✅ Your files were deleted.";

/// Startup configuration. Immutable after `load()`.
///
/// Anything an admin may change while the bot runs lives in [`SettingsStore`]
/// instead.
#[derive(Clone, Debug)]
pub struct Config {
    // Telegram
    pub bot_token: String,
    pub owner_id: UserId,
    pub admins: BTreeSet<UserId>,
    /// Private channel the delivered files are copied from.
    pub channel_id: i64,
    pub protect_content: bool,
    pub copy_interval: Duration,
    /// HTML caption put on every delivered copy; `None` keeps the source caption.
    pub custom_caption: Option<String>,

    // Storage
    pub database_path: PathBuf,

    // Deletion
    pub auto_delete_msg: String,
    /// Sent once a batch is gone; `None` sends nothing.
    pub auto_del_success_msg: Option<String>,
    pub sweep_interval: Duration,

    // Verification
    pub verify_token_ttl: Duration,

    // Initial values for the runtime settings
    pub auto_delete_time: Duration,
    pub verify_mode: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let bot_token = env_str("BOT_TOKEN").and_then(non_empty).ok_or_else(|| {
            Error::Config("BOT_TOKEN environment variable is required".to_string())
        })?;

        let owner_id = env_i64("OWNER_ID").map(UserId).ok_or_else(|| {
            Error::Config("OWNER_ID environment variable is required".to_string())
        })?;
        let channel_id = env_i64("CHANNEL_ID").ok_or_else(|| {
            Error::Config("CHANNEL_ID environment variable is required".to_string())
        })?;
        if channel_id == 0 {
            return Err(Error::Config("CHANNEL_ID must be non-zero".to_string()));
        }

        let mut admins: BTreeSet<UserId> =
            parse_id_list(env_str("ADMINS")).into_iter().map(UserId).collect();
        admins.insert(owner_id);

        let protect_content = env_bool("PROTECT_CONTENT").unwrap_or(false);
        let copy_interval = Duration::from_millis(env_u64("COPY_INTERVAL_MS").unwrap_or(500));
        let custom_caption = env_str("CUSTOM_CAPTION").and_then(non_empty);

        let database_path =
            PathBuf::from(env_str("DATABASE_PATH").and_then(non_empty).unwrap_or("fsb.db".to_string()));

        let auto_delete_time = Duration::from_secs(env_u64("AUTO_DELETE_TIME").unwrap_or(600));
        check_auto_delete_time(auto_delete_time).map_err(|e| Error::Config(e.to_string()))?;
        let auto_delete_msg = env_str("AUTO_DELETE_MSG")
            .and_then(non_empty)
            .unwrap_or(DEFAULT_AUTO_DELETE_MSG.to_string());
        // Set but empty disables the message.
        let auto_del_success_msg = match env_str("AUTO_DEL_SUCCESS_MSG") {
            Some(v) => non_empty(v),
            None => Some(DEFAULT_AUTO_DEL_SUCCESS_MSG.to_string()),
        };
        let sweep_interval = Duration::from_secs(env_u64("SWEEP_INTERVAL").unwrap_or(5).max(1));

        let verify_mode = env_bool("VERIFY_MODE").unwrap_or(true);
        let verify_token_ttl =
            Duration::from_secs(env_u64("VERIFY_TOKEN_TTL").unwrap_or(86_400).max(60));

        Ok(Self {
            bot_token,
            owner_id,
            admins,
            channel_id,
            protect_content,
            copy_interval,
            custom_caption,
            database_path,
            auto_delete_msg,
            auto_del_success_msg,
            sweep_interval,
            verify_token_ttl,
            auto_delete_time,
            verify_mode,
        })
    }

    pub fn is_admin(&self, user_id: UserId) -> bool {
        user_id == self.owner_id || self.admins.contains(&user_id)
    }

    pub fn initial_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            verify_mode: self.verify_mode,
            auto_delete_time: self.auto_delete_time,
        }
    }
}

/// Settings admins may change while the bot is running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub verify_mode: bool,
    /// Zero disables auto-deletion.
    pub auto_delete_time: Duration,
}

/// Typed, lock-protected holder for [`RuntimeSettings`].
#[derive(Debug)]
pub struct SettingsStore {
    inner: RwLock<RuntimeSettings>,
}

impl SettingsStore {
    pub fn new(initial: RuntimeSettings) -> Self {
        Self {
            inner: RwLock::new(initial),
        }
    }

    pub fn snapshot(&self) -> RuntimeSettings {
        *self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn verify_mode(&self) -> bool {
        self.snapshot().verify_mode
    }

    pub fn set_verify_mode(&self, on: bool) {
        self.inner.write().unwrap_or_else(|e| e.into_inner()).verify_mode = on;
    }

    pub fn auto_delete_time(&self) -> Duration {
        self.snapshot().auto_delete_time
    }

    /// Fails with `Validation` above [`MAX_AUTO_DELETE_TIME`].
    pub fn set_auto_delete_time(&self, ttl: Duration) -> Result<()> {
        check_auto_delete_time(ttl)?;
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .auto_delete_time = ttl;
        Ok(())
    }
}

fn check_auto_delete_time(ttl: Duration) -> Result<()> {
    if ttl > MAX_AUTO_DELETE_TIME {
        return Err(Error::Validation(format!(
            "auto-delete time is capped at {} seconds",
            MAX_AUTO_DELETE_TIME.as_secs()
        )));
    }
    Ok(())
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| parse_bool(&s))
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_i64(key: &str) -> Option<i64> {
    env_str(key).and_then(|s| s.trim().parse::<i64>().ok())
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Ids separated by whitespace and/or commas; junk entries are dropped.
fn parse_id_list(v: Option<String>) -> Vec<i64> {
    v.unwrap_or_default()
        .split(|c: char| c == ',' || c.is_whitespace())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
