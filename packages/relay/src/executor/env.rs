// packages/relay/src/executor/env.rs
//! Calling environment for command executions
//!
//! Every command sees its invocation through environment variables:
//!
//! ```text
//! COG_BUNDLE, COG_COMMAND          which command is running
//! COG_ARGC, COG_ARGV_0..n          positional arguments
//! COG_OPTS, COG_OPT_<NAME>         named options (lists add _COUNT and _0..n)
//! COG_CHAT_HANDLE, COG_ROOM        who asked, and where
//! COG_PIPELINE_ID                  correlation ID
//! ```
//!
//! Dynamic configuration and operator extra env are appended afterwards.
//! Keys in the reserved namespaces are dropped from both so they cannot
//! shadow the variables above.

use crate::executor::request::ExecutionRequest;
use serde_json::Value;
use tracing::debug;

/// Prefixes owned by the relay
pub const RESERVED_PREFIXES: &[&str] = &["COG_", "RELAY_"];

pub fn is_reserved(key: &str) -> bool {
    RESERVED_PREFIXES.iter().any(|prefix| key.starts_with(prefix))
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Builds the variable list for one execution
#[derive(Debug, Default)]
pub struct CallingEnvironment {
    vars: Vec<(String, String)>,
}

impl CallingEnvironment {
    /// Protocol variables describing the invocation
    pub fn for_request(request: &ExecutionRequest, bundle: &str, command: &str) -> Self {
        let mut vars = vec![
            ("COG_BUNDLE".to_string(), bundle.to_string()),
            ("COG_COMMAND".to_string(), command.to_string()),
            ("COG_ARGC".to_string(), request.args.len().to_string()),
        ];

        for (i, arg) in request.args.iter().enumerate() {
            vars.push((format!("COG_ARGV_{}", i), render(arg)));
        }

        let names: Vec<String> = request.options.keys().map(|name| name.to_uppercase()).collect();
        if !names.is_empty() {
            vars.push(("COG_OPTS".to_string(), names.join(",")));
        }
        for (name, value) in &request.options {
            let key = format!("COG_OPT_{}", name.to_uppercase());
            match value {
                Value::Array(items) => {
                    vars.push((format!("{}_COUNT", key), items.len().to_string()));
                    for (i, item) in items.iter().enumerate() {
                        vars.push((format!("{}_{}", key, i), render(item)));
                    }
                }
                other => vars.push((key, render(other))),
            }
        }

        vars.push(("COG_CHAT_HANDLE".to_string(), request.requestor.handle.clone()));
        vars.push(("COG_PIPELINE_ID".to_string(), request.correlation_id().to_string()));
        vars.push(("COG_ROOM".to_string(), request.room.name.clone()));

        Self { vars }
    }

    /// Append entries, dropping reserved keys
    pub fn extend_unreserved<I>(&mut self, source: &str, entries: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in entries {
            if key.is_empty() || is_reserved(&key) {
                debug!("Dropping reserved {} key {}", source, key);
                continue;
            }
            self.vars.push((key, value));
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        // Later entries win, matching how the process sees duplicates
        self.vars
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn vars(&self) -> &[(String, String)] {
        &self.vars
    }

    /// `KEY=VALUE` form used on the driver wire
    pub fn into_entries(self) -> Vec<String> {
        self.vars
            .into_iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect()
    }
}
