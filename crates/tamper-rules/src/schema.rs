use serde::Deserialize;

/// Wire form of one rewrite rule. Exactly one of the operation fields may be
/// set; the compiler rejects every other combination.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleJson {
    #[serde(default)]
    pub find: Option<String>,
    #[serde(default)]
    pub replace: Option<String>,
    #[serde(default)]
    pub prepend: Option<String>,
    #[serde(default)]
    pub append: Option<String>,
    #[serde(default)]
    pub delete: Option<String>,
}

/// Rule lists per rewrite target.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetsJson {
    #[serde(default)]
    pub url: Vec<RuleJson>,
    #[serde(default)]
    pub header: Vec<RuleJson>,
    #[serde(default)]
    pub body: Vec<RuleJson>,
    #[serde(default)]
    pub status: Vec<RuleJson>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirectionsJson {
    #[serde(default)]
    pub request: Option<TargetsJson>,
    #[serde(default)]
    pub response: Option<TargetsJson>,
}

/// One configuration entry: a URL filter plus the transformations applied to
/// traffic it matches.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct EntryJson {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub upload_speed: Option<u64>,
    #[serde(default)]
    pub download_speed: Option<u64>,
    /// Microseconds.
    #[serde(default)]
    pub response_delay: Option<u64>,
    #[serde(default)]
    pub rewrite: Option<DirectionsJson>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigJson {
    /// Overrides the client address the rules are stored under.
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub rules: Vec<EntryJson>,
}
