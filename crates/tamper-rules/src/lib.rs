//! Rewrite-rule schema, compiler, and application layer.
//!
//! Rules arrive as JSON, are compiled into regex-backed operations, and are
//! then applied to URLs, header blocks, status lines, and streaming bodies.

mod apply;
mod compile;
mod schema;

pub use apply::{
    alter_body, alter_header, alter_status, alter_url, BoxedBody, BODY_REWRITE_WINDOW,
};
pub use compile::{compile, Entry, FindPattern, RewriteRules, Rule, RuleError, Targets};
pub use schema::{ConfigJson, DirectionsJson, EntryJson, RuleJson, TargetsJson};
