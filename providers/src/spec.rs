//! Provider specs: how to reach one tool provider.
//!
//! A spec is an immutable descriptor registered under a logical name.
//! Local specs spawn a child process speaking the tool protocol on its
//! standard streams; remote specs reach a server over framed HTTP or
//! long-poll streaming.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ProviderError, ProviderResult};

#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderSpec {
    /// Child process spoken to over stdin/stdout.
    Local {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        /// Environment passed to the child. Values may reference the
        /// coordinator's environment as `${VAR_NAME}`; references are
        /// resolved at session-start time.
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Remote server reached over HTTP.
    Remote {
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
        /// Transport hint; auto-detected from the URL when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transport: Option<RemoteTransport>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteTransport {
    /// One framed HTTP exchange per call.
    Framed,
    /// Persistent long-poll read channel opened at connect time.
    LongPoll,
}

impl ProviderSpec {
    /// Validate the parts of the spec that can fail before any I/O.
    pub fn validate(&self) -> ProviderResult<()> {
        match self {
            ProviderSpec::Local { command, .. } => {
                if command.is_empty() {
                    return Err(ProviderError::Spec("empty command".to_string()));
                }
            }
            ProviderSpec::Remote { url, .. } => {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(ProviderError::Spec(format!(
                        "unsupported URL scheme: {url}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Resolve `${VAR}` references in a local spec's environment against
    /// the coordinator's process environment.
    ///
    /// The whole map is scanned before failing, so the error names every
    /// missing variable, not just the first.
    pub fn resolved_env(&self) -> ProviderResult<HashMap<String, String>> {
        let env = match self {
            ProviderSpec::Local { env, .. } => env,
            ProviderSpec::Remote { .. } => return Ok(HashMap::new()),
        };

        let mut missing = BTreeSet::new();
        let resolved = env
            .iter()
            .map(|(key, value)| (key.clone(), interpolate(value, &mut missing)))
            .collect();

        if missing.is_empty() {
            Ok(resolved)
        } else {
            Err(ProviderError::UnresolvedEnv {
                vars: missing.into_iter().collect(),
            })
        }
    }

    /// Effective transport for a remote spec: the hint when present,
    /// otherwise detected from the URL shape.
    pub fn effective_transport(&self) -> Option<RemoteTransport> {
        match self {
            ProviderSpec::Local { .. } => None,
            ProviderSpec::Remote { url, transport, .. } => Some(transport.unwrap_or({
                if url.trim_end_matches('/').ends_with("/sse") {
                    RemoteTransport::LongPoll
                } else {
                    RemoteTransport::Framed
                }
            })),
        }
    }
}

impl fmt::Debug for ProviderSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderSpec::Local { command, args, env } => f
                .debug_struct("Local")
                .field("command", command)
                .field("args", args)
                .field("env", &format!("{} vars", env.len()))
                .finish(),
            ProviderSpec::Remote {
                url,
                headers,
                transport,
            } => f
                .debug_struct("Remote")
                .field("url", url)
                .field("headers", &format!("{} headers", headers.len()))
                .field("transport", transport)
                .finish(),
        }
    }
}

/// Substitute `${VAR}` references from the process environment,
/// collecting unresolved names. Text without a closing brace is kept
/// literally.
fn interpolate(value: &str, missing: &mut BTreeSet<String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(v) => out.push_str(&v),
                    Err(_) => {
                        missing.insert(name.to_string());
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
