//! Configuration loading and management

use anyhow::{Context, Result, bail};
use crossposter_domain::policy::{
    MentionMode, OverflowPolicy, PolicyConfig, ReplyAudienceMode, VisibilityMode,
    default_privacy_table,
};
use crossposter_domain::usecases::{
    DispatchConfig, NormalizeConfig, RenderConfig, RunLoopConfig, SendConfig,
};
use crossposter_domain::{Privacy, Service};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub mastodon: MastodonConfig,

    #[serde(default)]
    pub bluesky: BlueskyConfig,

    #[serde(default)]
    pub twitter: TwitterConfig,

    /// privacy level -> service -> crosspost?
    #[serde(default)]
    pub privacy: BTreeMap<String, BTreeMap<String, bool>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Service posts are read from
    #[serde(default = "default_input")]
    pub input: String,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// 0 disables the cap
    #[serde(default)]
    pub max_per_hour: usize,

    #[serde(default = "default_post_time_limit_hours")]
    pub post_time_limit_hours: u32,

    #[serde(default = "default_overflow_posts")]
    pub overflow_posts: String,

    #[serde(default = "default_true")]
    pub quote_posts: bool,

    #[serde(default = "default_mentions")]
    pub mentions: String,

    #[serde(default = "default_true")]
    pub post_default: bool,

    /// Percentage of remaining quota below which a destination is paused
    #[serde(default)]
    pub rate_limit_buffer: f64,

    #[serde(default = "default_inherit")]
    pub visibility: String,

    #[serde(default = "default_inherit")]
    pub allow_reply: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_ledger_path")]
    pub ledger: PathBuf,

    #[serde(default = "default_backup_path")]
    pub backup: PathBuf,

    #[serde(default = "default_activity_path")]
    pub activity_cache: PathBuf,

    #[serde(default = "default_rate_limit_path")]
    pub rate_limit: PathBuf,

    #[serde(default = "default_media_dir")]
    pub media_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MastodonConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_mastodon_instance")]
    pub instance: String,

    #[serde(default)]
    pub handle: String,

    #[serde(default = "default_mastodon_token_env")]
    pub token_env: String,

    /// Language tag that flips `post_default` for this destination
    #[serde(default)]
    pub lang_toggle: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueskyConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_bluesky_pds")]
    pub pds: String,

    #[serde(default)]
    pub handle: String,

    #[serde(default = "default_bluesky_password_env")]
    pub password_env: String,

    #[serde(default)]
    pub lang_toggle: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwitterConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_twitter_base_url")]
    pub base_url: String,

    #[serde(default = "default_twitter_token_env")]
    pub token_env: String,

    /// Mirror reposts as retweets (needs a paid API tier)
    #[serde(default)]
    pub retweets: bool,

    #[serde(default)]
    pub lang_toggle: String,
}

// Default value functions
fn default_input() -> String {
    "bluesky".to_string()
}

fn default_max_retries() -> u32 {
    5
}

fn default_post_time_limit_hours() -> u32 {
    12
}

fn default_overflow_posts() -> String {
    "post".to_string()
}

fn default_mentions() -> String {
    "strip".to_string()
}

fn default_inherit() -> String {
    "inherit".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("./db/database.jsonl")
}

fn default_backup_path() -> PathBuf {
    PathBuf::from("./backup/database.jsonl")
}

fn default_activity_path() -> PathBuf {
    PathBuf::from("./db/cache.csv")
}

fn default_rate_limit_path() -> PathBuf {
    PathBuf::from("./db/rate_limit")
}

fn default_media_dir() -> PathBuf {
    PathBuf::from("./media")
}

fn default_mastodon_instance() -> String {
    "https://mastodon.social".to_string()
}

fn default_mastodon_token_env() -> String {
    "MASTODON_TOKEN".to_string()
}

fn default_bluesky_pds() -> String {
    "https://bsky.social".to_string()
}

fn default_bluesky_password_env() -> String {
    "BLUESKY_PASSWORD".to_string()
}

fn default_twitter_base_url() -> String {
    "https://api.twitter.com".to_string()
}

fn default_twitter_token_env() -> String {
    "TWITTER_USER_TOKEN".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            input: default_input(),
            max_retries: default_max_retries(),
            max_per_hour: 0,
            post_time_limit_hours: default_post_time_limit_hours(),
            overflow_posts: default_overflow_posts(),
            quote_posts: true,
            mentions: default_mentions(),
            post_default: true,
            rate_limit_buffer: 0.0,
            visibility: default_inherit(),
            allow_reply: default_inherit(),
            log_level: default_log_level(),
            dry_run: false,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            ledger: default_ledger_path(),
            backup: default_backup_path(),
            activity_cache: default_activity_path(),
            rate_limit: default_rate_limit_path(),
            media_dir: default_media_dir(),
        }
    }
}

impl Default for MastodonConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            instance: default_mastodon_instance(),
            handle: String::new(),
            token_env: default_mastodon_token_env(),
            lang_toggle: String::new(),
        }
    }
}

impl Default for BlueskyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            pds: default_bluesky_pds(),
            handle: String::new(),
            password_env: default_bluesky_password_env(),
            lang_toggle: String::new(),
        }
    }
}

impl Default for TwitterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_twitter_base_url(),
            token_env: default_twitter_token_env(),
            retweets: false,
            lang_toggle: String::new(),
        }
    }
}

const PRIVACY_LEVELS: [Privacy; 5] = [
    Privacy::Public,
    Privacy::Unlisted,
    Privacy::Followers,
    Privacy::Following,
    Privacy::Mentioned,
];

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        // Try default config path if none specified
        let default_path = PathBuf::from("./config.toml");
        let path = config_path.unwrap_or(&default_path);

        if path.exists() {
            builder = builder.add_source(config::File::from(path));
        } else if config_path.is_some() {
            // User specified a path that doesn't exist
            bail!("Config file not found: {}", path.display());
        }

        // Add environment variable overrides
        builder = builder.add_source(
            config::Environment::with_prefix("CROSSPOSTER")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// The single source service. Twitter can only be written to.
    pub fn input_service(&self) -> Result<Service> {
        let service: Service = self
            .general
            .input
            .parse()
            .with_context(|| format!("Invalid general.input: {}", self.general.input))?;
        if service == Service::Twitter {
            bail!("Twitter cannot be used as input");
        }
        Ok(service)
    }

    /// Enabled destinations, never including the input
    pub fn output_services(&self) -> Result<Vec<Service>> {
        let input = self.input_service()?;
        Ok(Service::ALL
            .into_iter()
            .filter(|&s| s != input && self.is_enabled(s))
            .collect())
    }

    pub fn is_enabled(&self, service: Service) -> bool {
        match service {
            Service::Mastodon => self.mastodon.enabled,
            Service::Bluesky => self.bluesky.enabled,
            Service::Twitter => self.twitter.enabled,
        }
    }

    /// Name of the environment variable holding the credential for `service`
    pub fn credential_env(&self, service: Service) -> &str {
        match service {
            Service::Mastodon => &self.mastodon.token_env,
            Service::Bluesky => &self.bluesky.password_env,
            Service::Twitter => &self.twitter.token_env,
        }
    }

    fn lang_toggle(&self, service: Service) -> &str {
        match service {
            Service::Mastodon => &self.mastodon.lang_toggle,
            Service::Bluesky => &self.bluesky.lang_toggle,
            Service::Twitter => &self.twitter.lang_toggle,
        }
    }

    /// Translate the file settings into the domain's run configuration
    pub fn run_loop_config(&self, dry_run: bool) -> Result<RunLoopConfig> {
        let general = &self.general;
        let mentions: MentionMode = general.mentions.parse()?;
        let overflow: OverflowPolicy = general.overflow_posts.parse()?;
        let visibility: VisibilityMode = general.visibility.parse()?;
        let allow_reply: ReplyAudienceMode = general.allow_reply.parse()?;

        let language_toggles = Service::ALL
            .into_iter()
            .filter_map(|s| {
                let lang = self.lang_toggle(s).trim();
                (!lang.is_empty()).then(|| (s, lang.to_string()))
            })
            .collect();

        Ok(RunLoopConfig {
            max_retries: general.max_retries,
            lookback: time::Duration::hours(i64::from(general.post_time_limit_hours)),
            overflow,
            dry_run,
            policy: PolicyConfig {
                post_default: general.post_default,
                language_toggles,
                privacy: self.privacy_table()?,
                visibility,
                allow_reply,
            },
            normalize: NormalizeConfig {
                mentions,
                quote_posts: general.quote_posts,
            },
            dispatch: DispatchConfig {
                max_per_hour: general.max_per_hour,
                quote_posts: general.quote_posts,
                ..Default::default()
            },
            send: SendConfig {
                rate_limit_buffer: general.rate_limit_buffer,
                ..Default::default()
            },
            render: RenderConfig::default(),
        })
    }

    /// Defaults overlaid with the `[privacy.*]` tables
    fn privacy_table(&self) -> Result<HashMap<Privacy, HashMap<Service, bool>>> {
        let mut table = default_privacy_table();
        for (level, services) in &self.privacy {
            let privacy = PRIVACY_LEVELS
                .into_iter()
                .find(|p| p.as_str() == level.trim().to_ascii_lowercase())
                .with_context(|| format!("Unknown privacy level: {}", level))?;
            let row = table.entry(privacy).or_default();
            for (service, include) in services {
                let service: Service = service
                    .parse()
                    .with_context(|| format!("Invalid service in [privacy.{}]", level))?;
                row.insert(service, *include);
            }
        }
        Ok(table)
    }

    /// Generate example configuration as TOML string
    pub fn example_toml() -> String {
        r#"# crossposter configuration
#
# Credentials never live here: each service names the environment
# variable that holds its token or app password.

[general]
# Where posts are read from: bluesky or mastodon
input = "bluesky"
# Failed attempts before a post is given up on for a destination
max_retries = 5
# Posts sent per sliding hour, 0 for unlimited
max_per_hour = 0
# Posts older than this are never crossposted
post_time_limit_hours = 12
# Posts held back by max_per_hour: "post" sends them later, "skip" drops them
overflow_posts = "post"
# Crosspost quotes of other accounts' posts as links
quote_posts = true
# ignore, skip, strip or url
mentions = "strip"
# Crosspost posts that do not carry a service's lang_toggle
post_default = true
# Pause a destination when its remaining quota drops below this percentage
rate_limit_buffer = 0.0
# public, unlisted, private, direct, inherit or hybrid
visibility = "inherit"
# inherit, everybody, following or mentioned
allow_reply = "inherit"
log_level = "info"
dry_run = false

[paths]
ledger = "./db/database.jsonl"
backup = "./backup/database.jsonl"
activity_cache = "./db/cache.csv"
rate_limit = "./db/rate_limit"
media_dir = "./media"

[mastodon]
enabled = true
instance = "https://mastodon.social"
handle = "example"
token_env = "MASTODON_TOKEN"
# lang_toggle = "en"

[bluesky]
enabled = true
pds = "https://bsky.social"
handle = "example.bsky.social"
password_env = "BLUESKY_PASSWORD"
# lang_toggle = "en"

[twitter]
enabled = false
base_url = "https://api.twitter.com"
token_env = "TWITTER_USER_TOKEN"
retweets = false
# lang_toggle = "en"

# Which destinations receive posts of each privacy level.
# Public and unlisted posts go everywhere by default.
[privacy.followers]
mastodon = false
bluesky = false
twitter = false

[privacy.mentioned]
mastodon = false
bluesky = false
twitter = false
"#
        .to_string()
    }
}

/// Read a credential from the environment variable named by the config
pub fn load_secret(env_var: &str, service: Service) -> Result<SecretString> {
    if env_var.trim().is_empty() {
        bail!("No credential env var configured for {}", service);
    }

    let value = std::env::var(env_var)
        .with_context(|| format!("Missing credential env var {} for {}", env_var, service))?;

    if value.trim().is_empty() {
        bail!("Credential env var {} is empty for {}", env_var, service);
    }

    Ok(SecretString::new(value.into()))
}
