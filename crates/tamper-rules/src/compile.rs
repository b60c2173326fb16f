use thiserror::Error;

use crate::schema::{ConfigJson, EntryJson, RuleJson, TargetsJson};

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid regex '{pattern}': {detail}")]
    InvalidRegex { pattern: String, detail: String },
    #[error("illegal field choice in rewrite rule: exactly one of replace/prepend/append/delete must be set")]
    IllegalCombination,
    #[error("rewritten value is not a valid URL: {0}")]
    InvalidUrl(String),
    #[error("rewritten header block is not parseable: {0}")]
    InvalidHeader(String),
}

/// A find pattern compiled for both text targets (URL, header, status) and
/// byte-stream targets (body).
#[derive(Debug, Clone)]
pub struct FindPattern {
    pub text: regex::Regex,
    pub bytes: regex::bytes::Regex,
}

impl FindPattern {
    fn compile(pattern: &str) -> Result<Self, RuleError> {
        let text = regex::Regex::new(pattern).map_err(|error| RuleError::InvalidRegex {
            pattern: pattern.to_string(),
            detail: error.to_string(),
        })?;
        let bytes = regex::bytes::Regex::new(pattern).map_err(|error| RuleError::InvalidRegex {
            pattern: pattern.to_string(),
            detail: error.to_string(),
        })?;
        Ok(Self { text, bytes })
    }
}

/// One compiled rewrite operation. The variant is chosen at compile time, so
/// an illegal field combination cannot reach the application layer.
#[derive(Debug, Clone)]
pub enum Rule {
    /// With a find pattern: regex find/replace. Without: the replacement text
    /// substitutes the entire value (for bodies, the input is discarded).
    Replace {
        find: Option<FindPattern>,
        text: String,
    },
    Prepend(String),
    Append(String),
}

impl Rule {
    fn compile(json: &RuleJson) -> Result<Self, RuleError> {
        match json {
            RuleJson {
                replace: Some(text),
                prepend: None,
                append: None,
                delete: None,
                find,
            } => Ok(Rule::Replace {
                find: find.as_deref().map(FindPattern::compile).transpose()?,
                text: text.clone(),
            }),
            RuleJson {
                prepend: Some(text),
                find: None,
                replace: None,
                append: None,
                delete: None,
            } => Ok(Rule::Prepend(text.clone())),
            RuleJson {
                append: Some(text),
                find: None,
                replace: None,
                prepend: None,
                delete: None,
            } => Ok(Rule::Append(text.clone())),
            // Delete is replace-with-empty.
            RuleJson {
                delete: Some(pattern),
                find: None,
                replace: None,
                prepend: None,
                append: None,
            } => Ok(Rule::Replace {
                find: Some(FindPattern::compile(pattern)?),
                text: String::new(),
            }),
            _ => Err(RuleError::IllegalCombination),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Targets {
    pub url: Vec<Rule>,
    pub header: Vec<Rule>,
    pub body: Vec<Rule>,
    pub status: Vec<Rule>,
}

impl Targets {
    fn compile(json: &TargetsJson) -> Result<Self, RuleError> {
        Ok(Self {
            url: compile_rules(&json.url)?,
            header: compile_rules(&json.header)?,
            body: compile_rules(&json.body)?,
            status: compile_rules(&json.status)?,
        })
    }
}

/// One compiled configuration entry.
#[derive(Debug, Clone)]
pub struct Entry {
    pub url: regex::Regex,
    pub upload_speed: Option<u64>,
    pub download_speed: Option<u64>,
    /// Microseconds.
    pub response_delay: Option<u64>,
    pub request: Targets,
    pub response: Targets,
}

pub type RewriteRules = Vec<Entry>;

/// Compiles a parsed configuration into regex-backed rules. Fails as a whole
/// on the first invalid pattern or illegal field combination, so a rejected
/// upload never partially replaces an active rule set.
pub fn compile(config: &ConfigJson) -> Result<RewriteRules, RuleError> {
    config.rules.iter().map(compile_entry).collect()
}

fn compile_entry(json: &EntryJson) -> Result<Entry, RuleError> {
    let url_pattern = json.url.as_deref().unwrap_or(".*");
    let url = regex::Regex::new(url_pattern).map_err(|error| RuleError::InvalidRegex {
        pattern: url_pattern.to_string(),
        detail: error.to_string(),
    })?;
    let rewrite = json.rewrite.clone().unwrap_or_default();
    Ok(Entry {
        url,
        upload_speed: json.upload_speed,
        download_speed: json.download_speed,
        response_delay: json.response_delay,
        request: rewrite
            .request
            .as_ref()
            .map(Targets::compile)
            .transpose()?
            .unwrap_or_default(),
        response: rewrite
            .response
            .as_ref()
            .map(Targets::compile)
            .transpose()?
            .unwrap_or_default(),
    })
}

fn compile_rules(rules: &[RuleJson]) -> Result<Vec<Rule>, RuleError> {
    rules.iter().map(Rule::compile).collect()
}
