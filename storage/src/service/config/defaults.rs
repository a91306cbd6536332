//! Default sources for config stores
//!
//! The instance store is backed by the compiled [`instance_defaults`]
//! catalogue. Domain stores derive their defaults from the instance store
//! through [`DOMAIN_KEY_MAP`], resolved on every lookup so a change to an
//! instance-level value is seen by every domain that did not override it.

use super::item::ConfigItem;
use super::store::ConfigStore;
use crate::tool::error::DbError;
use async_trait::async_trait;
use std::sync::Arc;

/// Supplies the complete item set a store is populated from
#[async_trait]
pub trait DefaultSource: Send + Sync {
    /// Every item the store may hold, valued at its default.
    async fn items(&self) -> Result<Vec<ConfigItem>, DbError>;

    /// Current default of `key` when defaults can change after load.
    async fn live_default(&self, _key: &str) -> Result<Option<String>, DbError> {
        Ok(None)
    }
}

/// A fixed, compiled set of defaults
#[derive(Debug, Clone)]
pub struct StaticDefaults {
    items: Vec<ConfigItem>,
}

impl StaticDefaults {
    pub fn new(items: Vec<ConfigItem>) -> Self {
        Self { items }
    }
}

#[async_trait]
impl DefaultSource for StaticDefaults {
    async fn items(&self) -> Result<Vec<ConfigItem>, DbError> {
        Ok(self.items.clone())
    }
}

/// Key of a domain-level setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DomainKey(pub &'static str);

/// Key of the instance-level setting a domain key inherits from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceKey(pub &'static str);

/// One domain key and where its default comes from
#[derive(Debug, Clone, Copy)]
pub struct KeyMapping {
    pub domain: DomainKey,
    pub instance: InstanceKey,
}

const fn map(domain: &'static str, instance: &'static str) -> KeyMapping {
    KeyMapping {
        domain: DomainKey(domain),
        instance: InstanceKey(instance),
    }
}

pub const SECTION_AUTH: &str = "auth";
pub const SECTION_COMMENTS: &str = "comments";
pub const SECTION_MARKDOWN: &str = "markdown";
pub const SECTION_INTEGRATIONS: &str = "integrations";
pub const SECTION_MISC: &str = "misc";

/// Domain settings and the instance settings providing their defaults
pub const DOMAIN_KEY_MAP: &[KeyMapping] = &[
    map("comments.enableVoting", "domain.defaults.comments.enableVoting"),
    map("comments.showDeletedComments", "domain.defaults.comments.showDeletedComments"),
    map("comments.editing.author", "domain.defaults.comments.editing.author"),
    map("comments.editing.moderator", "domain.defaults.comments.editing.moderator"),
    map("comments.deletion.author", "domain.defaults.comments.deletion.author"),
    map("comments.deletion.moderator", "domain.defaults.comments.deletion.moderator"),
    map("comments.maxLength", "domain.defaults.comments.maxLength"),
    map("markdown.images.enabled", "domain.defaults.markdown.images.enabled"),
    map("markdown.links.enabled", "domain.defaults.markdown.links.enabled"),
    map("markdown.tables.enabled", "domain.defaults.markdown.tables.enabled"),
    map("login.showForUnauth", "domain.defaults.login.showForUnauth"),
    map("signup.enableLocal", "domain.defaults.signup.enableLocal"),
];

/// Instance-level defaults of the comment host
pub fn instance_defaults() -> Vec<ConfigItem> {
    vec![
        ConfigItem::bool("auth.signup.enabled", true, SECTION_AUTH),
        ConfigItem::bool("auth.signup.confirm.user", true, SECTION_AUTH),
        ConfigItem::bool("auth.signup.confirm.commenter", true, SECTION_AUTH),
        ConfigItem::bool("auth.login.local.maxAttempts.enabled", true, SECTION_AUTH),
        ConfigItem::int("auth.login.local.maxAttempts", 10, Some(1), Some(1000), SECTION_AUTH),
        ConfigItem::bool("domain.defaults.comments.enableVoting", true, SECTION_COMMENTS),
        ConfigItem::bool("domain.defaults.comments.showDeletedComments", true, SECTION_COMMENTS),
        ConfigItem::bool("domain.defaults.comments.editing.author", true, SECTION_COMMENTS),
        ConfigItem::bool("domain.defaults.comments.editing.moderator", true, SECTION_COMMENTS),
        ConfigItem::bool("domain.defaults.comments.deletion.author", true, SECTION_COMMENTS),
        ConfigItem::bool("domain.defaults.comments.deletion.moderator", true, SECTION_COMMENTS),
        ConfigItem::int(
            "domain.defaults.comments.maxLength",
            4096,
            Some(140),
            Some(1_048_576),
            SECTION_COMMENTS,
        ),
        ConfigItem::bool("domain.defaults.markdown.images.enabled", true, SECTION_MARKDOWN),
        ConfigItem::bool("domain.defaults.markdown.links.enabled", true, SECTION_MARKDOWN),
        ConfigItem::bool("domain.defaults.markdown.tables.enabled", true, SECTION_MARKDOWN),
        ConfigItem::bool("domain.defaults.login.showForUnauth", true, SECTION_AUTH),
        ConfigItem::bool("domain.defaults.signup.enableLocal", true, SECTION_AUTH),
        ConfigItem::bool("integrations.useGravatar", true, SECTION_INTEGRATIONS),
        ConfigItem::bool("operation.newOwner.enabled", false, SECTION_MISC),
        ConfigItem::string("misc.termsOfServiceUrl", "", SECTION_MISC),
        ConfigItem::string("misc.privacyPolicyUrl", "", SECTION_MISC),
    ]
}

fn section_of(domain_key: &str) -> &str {
    domain_key.split('.').next().unwrap_or(domain_key)
}

/// Domain defaults read from the instance store at lookup time
pub struct DerivedDefaults {
    instance: Arc<ConfigStore>,
    mapping: &'static [KeyMapping],
}

impl DerivedDefaults {
    pub fn new(instance: Arc<ConfigStore>) -> Self {
        Self::with_mapping(instance, DOMAIN_KEY_MAP)
    }

    pub fn with_mapping(instance: Arc<ConfigStore>, mapping: &'static [KeyMapping]) -> Self {
        Self { instance, mapping }
    }

    fn instance_key(&self, domain_key: &str) -> Option<InstanceKey> {
        self.mapping
            .iter()
            .find(|m| m.domain.0 == domain_key)
            .map(|m| m.instance)
    }
}

#[async_trait]
impl DefaultSource for DerivedDefaults {
    async fn items(&self) -> Result<Vec<ConfigItem>, DbError> {
        let mut items = Vec::with_capacity(self.mapping.len());
        for m in self.mapping {
            let source = self.instance.get(m.instance.0).await?;
            items.push(ConfigItem {
                key: m.domain.0.to_string(),
                default_value: source.value.clone(),
                value: source.value,
                datatype: source.datatype,
                min: source.min,
                max: source.max,
                section: section_of(m.domain.0).to_string(),
                updated_at: None,
                updated_by: None,
            });
        }
        Ok(items)
    }

    async fn live_default(&self, key: &str) -> Result<Option<String>, DbError> {
        match self.instance_key(key) {
            Some(instance_key) => Ok(Some(self.instance.get(instance_key.0).await?.value)),
            None => Ok(None),
        }
    }
}
