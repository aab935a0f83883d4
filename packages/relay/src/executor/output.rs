// packages/relay/src/executor/output.rs
//! Command output parser
//!
//! Commands talk back to the relay through their stdout. Lines of the form
//! `<DIRECTIVE>: <rest>` are control lines; everything else is body. A line
//! consisting of `JSON` ends directive processing and the rest of stdout is
//! parsed as a single JSON document.
//!
//! | Directive                  | Effect                              |
//! |----------------------------|-------------------------------------|
//! | `COGCMD_DEBUG`             | log at debug                        |
//! | `COGCMD_INFO`              | log at info                         |
//! | `COGCMD_WARN`              | log at warn                         |
//! | `COGCMD_ERR`/`COGCMD_ERROR`| log at error                        |
//! | `COG_TEMPLATE`             | name the template for rendering     |
//! | `COGCMD_ACTION`            | `abort` turns an ok into an abort   |

use crate::executor::request::{ExecutionResponse, ResponseStatus};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

/// Marker line that switches to JSON mode
pub const JSON_MARKER: &str = "JSON";

#[derive(Debug, PartialEq, Eq)]
enum Directive<'a> {
    Debug(&'a str),
    Info(&'a str),
    Warn(&'a str),
    Error(&'a str),
    Template(&'a str),
    Action(&'a str),
}

fn directive(line: &str) -> Option<Directive<'_>> {
    let (name, rest) = line.split_once(':')?;
    let rest = rest.trim();
    match name {
        "COGCMD_DEBUG" => Some(Directive::Debug(rest)),
        "COGCMD_INFO" => Some(Directive::Info(rest)),
        "COGCMD_WARN" => Some(Directive::Warn(rest)),
        "COGCMD_ERR" | "COGCMD_ERROR" => Some(Directive::Error(rest)),
        "COG_TEMPLATE" => Some(Directive::Template(rest)),
        "COGCMD_ACTION" => Some(Directive::Action(rest)),
        _ => None,
    }
}

/// Turn raw command output into a response.
///
/// `origin` names the command in log lines emitted for directives.
pub fn parse_output(stdout: &[u8], stderr: &[u8], success: bool, origin: &str) -> ExecutionResponse {
    let stdout = String::from_utf8_lossy(stdout);
    let mut response = ExecutionResponse::ok();
    let mut retained: Vec<&str> = Vec::new();
    let mut json_lines: Vec<&str> = Vec::new();
    let mut json_mode = false;
    let mut abort = false;

    for line in stdout.lines() {
        if json_mode {
            json_lines.push(line);
            continue;
        }
        if line.trim_end() == JSON_MARKER {
            json_mode = true;
            continue;
        }

        match directive(line) {
            Some(Directive::Debug(msg)) => debug!(command = origin, "{}", msg),
            Some(Directive::Info(msg)) => info!(command = origin, "{}", msg),
            Some(Directive::Warn(msg)) => warn!(command = origin, "{}", msg),
            Some(Directive::Error(msg)) => error!(command = origin, "{}", msg),
            Some(Directive::Template(name)) => response.template = name.to_string(),
            Some(Directive::Action(action)) => {
                if action.eq_ignore_ascii_case("abort") {
                    abort = true;
                } else {
                    warn!(command = origin, "Ignoring unknown action '{}'", action);
                }
            }
            None => retained.push(line),
        }
    }

    if !stderr.is_empty() {
        response.status = ResponseStatus::Error;
        response.status_message = String::from_utf8_lossy(stderr).into_owned();
        return response;
    }

    if json_mode {
        let document = json_lines.join("\n");
        if !document.trim().is_empty() {
            match serde_json::from_str::<Value>(&document) {
                Ok(body) => {
                    response.body = Some(body);
                    response.is_json = true;
                }
                Err(e) => {
                    debug!(command = origin, "Output JSON failed to parse: {}", e);
                    response.status = ResponseStatus::Error;
                    response.status_message = "invalid JSON".to_string();
                    return response;
                }
            }
        }
    } else if !retained.is_empty() {
        response.body = Some(json!([{ "body": retained }]));
    }

    if !success {
        response.status = ResponseStatus::Error;
        response.status_message = "command failed".to_string();
    } else if abort {
        response.status = ResponseStatus::Abort;
    }

    response
}
