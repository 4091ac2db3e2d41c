//! Extraction pipeline
//!
//! This module turns rendered HTML into JSON payloads according to a job's
//! rule, and collects the links a rule wants fed back into the frontier:
//! - Built-in `document` and `links` rules
//! - Configured `selectors` and `listing` rules with fallback selectors
//! - Host filtering of discovered links
//!
//! Extraction is synchronous and deterministic: payloads are built from
//! ordered JSON maps, so the same page and rule always yield the same records.

mod rules;

pub use rules::{CompiledField, ResolvedRule, RuleRegistry, RuleSet};

use crate::renderer::RenderOutput;
use crate::url::{is_host_allowed, resolve_link};
use scraper::{ElementRef, Html, Selector};
use serde_json::{Map, Value};
use std::collections::HashSet;
use thiserror::Error;
use url::Url;

/// Rule ids that are always available and cannot be redefined
pub const BUILTIN_RULES: &[&str] = &["document", "links"];

/// Unit-level extraction failures; the unit is retried like a render failure
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("required field '{field}' not found on {url}")]
    MissingField { field: String, url: String },

    #[error("rendered page {0} is empty")]
    EmptyDocument(String),
}

/// Everything pulled out of one rendered page
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub payloads: Vec<Value>,

    /// Normalized links to add to the frontier, empty unless the rule follows links
    pub links: Vec<Url>,
}

/// Applies resolved rules to rendered pages
#[derive(Debug, Clone)]
pub struct ExtractionPipeline {
    anchors: Selector,
    title: Selector,
    description: Selector,
}

impl Default for ExtractionPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtractionPipeline {
    pub fn new() -> Self {
        Self {
            anchors: fixed_selector("a[href]"),
            title: fixed_selector("title"),
            description: fixed_selector("meta[name='description']"),
        }
    }

    /// Extracts payloads and links from a rendered page
    ///
    /// # Arguments
    ///
    /// * `raw` - The render output
    /// * `rule` - The job's resolved rule
    ///
    /// # Returns
    ///
    /// * `Ok(Extraction)` - Zero or more payloads plus discovered links
    /// * `Err(ExtractError)` - The page is empty or a required field is missing
    pub fn extract(&self, raw: &RenderOutput, rule: &ResolvedRule) -> Result<Extraction, ExtractError> {
        if raw.html.trim().is_empty() {
            return Err(ExtractError::EmptyDocument(raw.final_url.to_string()));
        }

        let document = Html::parse_document(&raw.html);
        let base = &raw.final_url;

        let payloads = match &rule.set {
            RuleSet::Document => vec![self.document_record(&document, base)],
            RuleSet::Links => self
                .anchor_links(&document, base)
                .into_iter()
                .map(|(href, text)| {
                    let mut record = Map::new();
                    record.insert("href".to_string(), Value::String(href.to_string()));
                    record.insert("text".to_string(), Value::String(text));
                    Value::Object(record)
                })
                .collect(),
            RuleSet::Selectors { fields } => {
                let record = evaluate_fields(document.root_element(), fields, base)
                    .map_err(|field| ExtractError::MissingField {
                        field,
                        url: base.to_string(),
                    })?;
                vec![Value::Object(record)]
            }
            RuleSet::Listing { item, fields } => document
                .select(item)
                .filter_map(|element| match evaluate_fields(element, fields, base) {
                    Ok(record) => Some(Value::Object(record)),
                    Err(field) => {
                        tracing::debug!("Skipping listing item on {} without '{}'", base, field);
                        None
                    }
                })
                .collect(),
        };

        let links = if rule.follow_links {
            self.anchor_links(&document, base)
                .into_iter()
                .map(|(url, _)| url)
                .filter(|url| is_host_allowed(url, base, &rule.allowed_hosts))
                .collect()
        } else {
            Vec::new()
        };

        Ok(Extraction { payloads, links })
    }

    fn document_record(&self, document: &Html, base: &Url) -> Value {
        let title = document
            .select(&self.title)
            .next()
            .map(|e| collapse_whitespace(&e.text().collect::<String>()))
            .filter(|s| !s.is_empty());
        let description = document
            .select(&self.description)
            .next()
            .and_then(|e| e.value().attr("content"))
            .map(collapse_whitespace)
            .filter(|s| !s.is_empty());

        let mut record = Map::new();
        record.insert("url".to_string(), Value::String(base.to_string()));
        record.insert("title".to_string(), title.map_or(Value::Null, Value::String));
        record.insert(
            "description".to_string(),
            description.map_or(Value::Null, Value::String),
        );
        record.insert("text".to_string(), Value::String(visible_text(document)));
        Value::Object(record)
    }

    /// Resolved links with their anchor text, first occurrence wins
    fn anchor_links(&self, document: &Html, base: &Url) -> Vec<(Url, String)> {
        let mut seen = HashSet::new();
        document
            .select(&self.anchors)
            .filter(|a| a.value().attr("download").is_none())
            .filter_map(|a| {
                let url = resolve_link(base, a.value().attr("href")?)?;
                let text = collapse_whitespace(&a.text().collect::<String>());
                Some((url, text))
            })
            .filter(|(url, _)| seen.insert(url.to_string()))
            .collect()
    }
}

fn fixed_selector(css: &str) -> Selector {
    match Selector::parse(css) {
        Ok(selector) => selector,
        Err(e) => unreachable!("built-in selector '{}' does not parse: {:?}", css, e),
    }
}

/// Evaluates fields inside `scope`; on a missing required field returns its name
fn evaluate_fields(
    scope: ElementRef<'_>,
    fields: &[CompiledField],
    base: &Url,
) -> Result<Map<String, Value>, String> {
    let mut record = Map::new();

    for field in fields {
        let values = field
            .selectors
            .iter()
            .map(|selector| {
                scope
                    .select(selector)
                    .filter_map(|element| field_value(element, field.attr.as_deref(), base))
                    .collect::<Vec<_>>()
            })
            .find(|values| !values.is_empty())
            .unwrap_or_default();

        if values.is_empty() && field.required {
            return Err(field.name.clone());
        }

        let value = if field.multiple {
            Value::Array(values.into_iter().map(Value::String).collect())
        } else {
            values.into_iter().next().map_or(Value::Null, Value::String)
        };
        record.insert(field.name.clone(), value);
    }

    Ok(record)
}

fn field_value(element: ElementRef<'_>, attr: Option<&str>, base: &Url) -> Option<String> {
    let value = match attr {
        Some(name @ ("href" | "src")) => {
            let raw = element.value().attr(name)?.trim();
            base.join(raw).map(|u| u.to_string()).unwrap_or_else(|_| raw.to_string())
        }
        Some(name) => element.value().attr(name)?.trim().to_string(),
        None => collapse_whitespace(&element.text().collect::<String>()),
    };

    (!value.is_empty()).then_some(value)
}

/// Text of the page outside scripts, styles and the head
fn visible_text(document: &Html) -> String {
    let mut parts = Vec::new();

    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor.value().as_element().is_some_and(|e| {
                matches!(e.name(), "script" | "style" | "noscript" | "template" | "head")
            })
        });
        if !hidden {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                parts.push(trimmed);
            }
        }
    }

    collapse_whitespace(&parts.join(" "))
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
