//! Crossposting policy: which posts go where, and how they look there

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::model::{Post, Privacy, ReplyAudience, Service};
use crate::ports::Visibility;

/// What to do with @mentions of other accounts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MentionMode {
    /// Leave the mention text untouched
    Ignore,
    /// Drop posts that mention anyone
    Skip,
    /// Remove the leading `@`
    #[default]
    Strip,
    /// Replace the mention with a link to the profile
    Url,
}

/// What happens to posts held back by the hourly cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Carry them forward and post them in a later run
    #[default]
    Post,
    /// Never post anything older than the last send
    Skip,
}

/// How destination visibility is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VisibilityMode {
    Public,
    Unlisted,
    Private,
    Direct,
    /// Follow the source post's privacy
    #[default]
    Inherit,
    /// Public for top-level posts, unlisted for replies
    Hybrid,
}

/// How the destination reply audience is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReplyAudienceMode {
    /// Mirror the source restriction
    #[default]
    Inherit,
    Everybody,
    Following,
    Mentioned,
}

macro_rules! impl_from_str {
    ($ty:ty, $name:literal, { $($text:literal => $value:expr),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = PolicyError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($value),)+
                    other => Err(PolicyError::InvalidValue {
                        setting: $name,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

impl_from_str!(MentionMode, "mentions", {
    "ignore" => MentionMode::Ignore,
    "skip" => MentionMode::Skip,
    "strip" => MentionMode::Strip,
    "url" => MentionMode::Url,
});

impl_from_str!(OverflowPolicy, "overflow_posts", {
    "post" => OverflowPolicy::Post,
    "skip" => OverflowPolicy::Skip,
});

impl_from_str!(VisibilityMode, "visibility", {
    "public" => VisibilityMode::Public,
    "unlisted" => VisibilityMode::Unlisted,
    "private" => VisibilityMode::Private,
    "direct" => VisibilityMode::Direct,
    "inherit" => VisibilityMode::Inherit,
    "hybrid" => VisibilityMode::Hybrid,
});

impl_from_str!(ReplyAudienceMode, "allow_reply", {
    "inherit" => ReplyAudienceMode::Inherit,
    "everybody" => ReplyAudienceMode::Everybody,
    "following" => ReplyAudienceMode::Following,
    "mentioned" => ReplyAudienceMode::Mentioned,
});

/// Policy configuration
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Crosspost posts that do not carry the toggle language
    pub post_default: bool,
    /// Per-destination language tag that flips `post_default`
    pub language_toggles: HashMap<Service, String>,
    /// Per-privacy, per-destination inclusion
    pub privacy: HashMap<Privacy, HashMap<Service, bool>>,
    pub visibility: VisibilityMode,
    pub allow_reply: ReplyAudienceMode,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            post_default: true,
            language_toggles: HashMap::new(),
            privacy: default_privacy_table(),
            visibility: VisibilityMode::default(),
            allow_reply: ReplyAudienceMode::default(),
        }
    }
}

/// Public and unlisted posts go everywhere; restricted audiences go nowhere.
pub fn default_privacy_table() -> HashMap<Privacy, HashMap<Service, bool>> {
    [
        (Privacy::Public, true),
        (Privacy::Unlisted, true),
        (Privacy::Followers, false),
        (Privacy::Following, false),
        (Privacy::Mentioned, false),
    ]
    .into_iter()
    .map(|(privacy, include)| {
        let services = Service::ALL.iter().map(|&s| (s, include)).collect();
        (privacy, services)
    })
    .collect()
}

/// Policy evaluation for crossposting decisions
pub struct Policy {
    config: PolicyConfig,
}

impl Policy {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Whether `post` should go to `service` at all
    pub fn post_toggle(&self, post: &Post, service: Service) -> bool {
        self.lang_toggle(post, service) && self.privacy_allows(post.privacy, service)
    }

    /// Language-based inclusion for `service`
    pub fn lang_toggle(&self, post: &Post, service: Service) -> bool {
        let Some(toggle) = self
            .config
            .language_toggles
            .get(&service)
            .filter(|t| !t.trim().is_empty())
        else {
            return true;
        };

        if post.language.iter().any(|lang| lang == toggle) {
            !self.config.post_default
        } else {
            self.config.post_default
        }
    }

    fn privacy_allows(&self, privacy: Privacy, service: Service) -> bool {
        self.config
            .privacy
            .get(&privacy)
            .and_then(|services| services.get(&service))
            .copied()
            .unwrap_or(false)
    }

    /// Destination visibility for `post`
    pub fn visibility(&self, post: &Post) -> Visibility {
        match self.config.visibility {
            VisibilityMode::Public => Visibility::Public,
            VisibilityMode::Unlisted => Visibility::Unlisted,
            VisibilityMode::Private => Visibility::Private,
            VisibilityMode::Direct => Visibility::Direct,
            VisibilityMode::Hybrid if post.reply_id.is_some() => Visibility::Unlisted,
            VisibilityMode::Hybrid => Visibility::Public,
            VisibilityMode::Inherit => match post.privacy {
                Privacy::Public => Visibility::Public,
                Privacy::Unlisted => Visibility::Unlisted,
                Privacy::Followers | Privacy::Following => Visibility::Private,
                Privacy::Mentioned => Visibility::Direct,
            },
        }
    }

    /// Destination reply audience for `post`
    pub fn reply_audience(&self, post: &Post) -> ReplyAudience {
        match self.config.allow_reply {
            ReplyAudienceMode::Inherit => post.reply_audience,
            ReplyAudienceMode::Everybody => ReplyAudience::All,
            ReplyAudienceMode::Following => ReplyAudience::Following,
            ReplyAudienceMode::Mentioned => ReplyAudience::Mentioned,
        }
    }
}

/// Invalid policy settings
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("Invalid value '{value}' for {setting}")]
    InvalidValue { setting: &'static str, value: String },
}
