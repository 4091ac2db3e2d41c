//! Extraction rules resolved from configuration
//!
//! Every rule is compiled once, when the registry is built, so a job that
//! resolves a rule never meets a selector parse error mid-crawl.

use crate::config::{FieldEntry, RuleEntry, RuleKind};
use crate::extract::BUILTIN_RULES;
use crate::job::JobError;
use crate::ConfigError;
use scraper::Selector;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A named field with its selectors compiled
#[derive(Debug, Clone)]
pub struct CompiledField {
    pub name: String,

    /// Primary selector first, then fallbacks in order
    pub selectors: Vec<Selector>,

    pub attr: Option<String>,
    pub multiple: bool,
    pub required: bool,
}

/// What a rule pulls out of a page
#[derive(Debug, Clone)]
pub enum RuleSet {
    /// Title, meta description and visible text
    Document,
    /// One record per outgoing link
    Links,
    /// One record assembled from named fields
    Selectors { fields: Vec<CompiledField> },
    /// One record per `item` match, fields evaluated inside the item
    Listing {
        item: Selector,
        fields: Vec<CompiledField>,
    },
}

/// A rule ready to run against rendered pages
#[derive(Debug, Clone)]
pub struct ResolvedRule {
    pub id: String,
    pub set: RuleSet,

    /// Return discovered links so the job's frontier can grow
    pub follow_links: bool,

    /// Host patterns followed links must match; empty means the page's host
    pub allowed_hosts: Vec<String>,
}

impl ResolvedRule {
    fn builtin(id: &str, set: RuleSet) -> Self {
        Self {
            id: id.to_string(),
            set,
            follow_links: false,
            allowed_hosts: Vec::new(),
        }
    }

    /// Compiles a configured rule
    ///
    /// # Arguments
    ///
    /// * `entry` - The `[[rules]]` entry from the configuration
    ///
    /// # Returns
    ///
    /// * `Ok(ResolvedRule)` - Every selector compiled
    /// * `Err(ConfigError)` - A selector does not parse or a listing lacks its item selector
    pub fn compile(entry: &RuleEntry) -> Result<Self, ConfigError> {
        let set = match entry.kind {
            RuleKind::Document => RuleSet::Document,
            RuleKind::Links => RuleSet::Links,
            RuleKind::Selectors => RuleSet::Selectors {
                fields: compile_fields(&entry.id, &entry.fields)?,
            },
            RuleKind::Listing => {
                let item = entry.item.as_deref().ok_or_else(|| ConfigError::InvalidRule {
                    rule: entry.id.clone(),
                    message: "listing rules need an item selector".to_string(),
                })?;
                RuleSet::Listing {
                    item: compile_selector(&entry.id, item)?,
                    fields: compile_fields(&entry.id, &entry.fields)?,
                }
            }
        };

        Ok(Self {
            id: entry.id.clone(),
            set,
            follow_links: entry.follow_links,
            allowed_hosts: entry.allowed_hosts.clone(),
        })
    }
}

fn compile_selector(rule: &str, selector: &str) -> Result<Selector, ConfigError> {
    Selector::parse(selector).map_err(|e| ConfigError::InvalidRule {
        rule: rule.to_string(),
        message: format!("invalid selector '{}': {:?}", selector, e),
    })
}

fn compile_fields(rule: &str, fields: &[FieldEntry]) -> Result<Vec<CompiledField>, ConfigError> {
    fields
        .iter()
        .map(|field| {
            let selectors = std::iter::once(&field.selector)
                .chain(field.fallback.iter())
                .map(|s| compile_selector(rule, s))
                .collect::<Result<Vec<_>, _>>()?;

            Ok(CompiledField {
                name: field.name.clone(),
                selectors,
                attr: field.attr.clone(),
                multiple: field.multiple,
                required: field.required,
            })
        })
        .collect()
}

/// Rules keyed by id, built-ins included
#[derive(Debug, Clone)]
pub struct RuleRegistry {
    rules: BTreeMap<String, Arc<ResolvedRule>>,
}

impl RuleRegistry {
    /// Builds the registry from the built-ins plus the configured rules
    pub fn from_config(entries: &[RuleEntry]) -> Result<Self, ConfigError> {
        let mut rules = BTreeMap::new();
        rules.insert(
            BUILTIN_RULES[0].to_string(),
            Arc::new(ResolvedRule::builtin(BUILTIN_RULES[0], RuleSet::Document)),
        );
        rules.insert(
            BUILTIN_RULES[1].to_string(),
            Arc::new(ResolvedRule::builtin(BUILTIN_RULES[1], RuleSet::Links)),
        );

        for entry in entries {
            if rules.contains_key(&entry.id) {
                return Err(ConfigError::InvalidRule {
                    rule: entry.id.clone(),
                    message: "rule id is already defined".to_string(),
                });
            }
            rules.insert(entry.id.clone(), Arc::new(ResolvedRule::compile(entry)?));
        }

        tracing::debug!("Rule registry holds {} rules", rules.len());
        Ok(Self { rules })
    }

    /// Looks up a rule for a job
    pub fn resolve(&self, id: &str) -> Result<Arc<ResolvedRule>, JobError> {
        self.rules
            .get(id)
            .cloned()
            .ok_or_else(|| JobError::UnknownRule(id.to_string()))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }
}
