// Copyright 2026 BadCompany
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

use crate::engine_core::constants::{config as keys, executor, protocol, redaction, watcher};
use crate::engine_core::errors::McpError;
use crate::mcp::executor::ExecutorConfig;

/// Feature toggles advertised in `initialize` and consulted before emitting
/// notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityConfig {
    pub notify_prompts: bool,
    pub notify_resources: bool,
    pub notify_tools: bool,
    pub resource_subscribe: bool,
    pub tool_versioning: bool,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            notify_prompts: true,
            notify_resources: true,
            notify_tools: true,
            resource_subscribe: true,
            tool_versioning: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchConfig {
    pub debounce_ms: u64,
    pub prompts_dir: Option<PathBuf>,
    pub resources_dir: Option<PathBuf>,
    pub tools_dir: Option<PathBuf>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: watcher::DEFAULT_DEBOUNCE_MS,
            prompts_dir: None,
            resources_dir: None,
            tools_dir: None,
        }
    }
}

impl WatchConfig {
    pub fn has_roots(&self) -> bool {
        self.prompts_dir.is_some() || self.resources_dir.is_some() || self.tools_dir.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server_name: String,
    pub protocol_version: String,
    pub capabilities: CapabilityConfig,
    pub watch: WatchConfig,
    pub executor: ExecutorConfig,
    /// Accept `resources/subscribe` for URIs that are not registered yet.
    pub allow_speculative_subscriptions: bool,
    pub sensitive_keys: Vec<String>,
    pub log_level: String,
    pub log_format: String, // "json" or "text"
}

impl Config {
    pub fn from_env() -> Result<Self, McpError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from any key lookup, then validates it.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, McpError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let path = |key: &str| lookup(key).filter(|v| !v.trim().is_empty()).map(PathBuf::from);

        let config = Self {
            server_name: lookup(keys::ENV_SERVER_NAME).unwrap_or(defaults.server_name),
            protocol_version: lookup(keys::ENV_PROTOCOL_VERSION)
                .unwrap_or(defaults.protocol_version),
            capabilities: CapabilityConfig {
                notify_prompts: parse_bool_or_default(&lookup, keys::ENV_NOTIFY_PROMPTS, true)?,
                notify_resources: parse_bool_or_default(
                    &lookup,
                    keys::ENV_NOTIFY_RESOURCES,
                    true,
                )?,
                notify_tools: parse_bool_or_default(&lookup, keys::ENV_NOTIFY_TOOLS, true)?,
                resource_subscribe: parse_bool_or_default(
                    &lookup,
                    keys::ENV_RESOURCE_SUBSCRIBE,
                    true,
                )?,
                tool_versioning: parse_bool_or_default(&lookup, keys::ENV_TOOL_VERSIONING, false)?,
            },
            watch: WatchConfig {
                debounce_ms: parse_u64_or_default(
                    &lookup,
                    keys::ENV_WATCH_DEBOUNCE_MS,
                    watcher::DEFAULT_DEBOUNCE_MS,
                )?,
                prompts_dir: path(keys::ENV_PROMPTS_DIR),
                resources_dir: path(keys::ENV_RESOURCES_DIR),
                tools_dir: path(keys::ENV_TOOLS_DIR),
            },
            executor: ExecutorConfig {
                allowed_commands: parse_list(&lookup, keys::ENV_ALLOWED_COMMANDS)
                    .unwrap_or(defaults.executor.allowed_commands),
                max_concurrent: parse_usize_or_default(
                    &lookup,
                    keys::ENV_MAX_PROCESSES,
                    executor::DEFAULT_MAX_CONCURRENT,
                )?,
                max_output_bytes: parse_usize_or_default(
                    &lookup,
                    keys::ENV_MAX_OUTPUT_BYTES,
                    executor::DEFAULT_MAX_OUTPUT_BYTES,
                )?,
                ..defaults.executor
            },
            allow_speculative_subscriptions: parse_bool_or_default(
                &lookup,
                keys::ENV_SPECULATIVE_SUBSCRIBE,
                false,
            )?,
            sensitive_keys: parse_list(&lookup, keys::ENV_SENSITIVE_KEYS)
                .unwrap_or(defaults.sensitive_keys),
            log_level: lookup(keys::ENV_LOG_LEVEL).unwrap_or(defaults.log_level),
            log_format: lookup(keys::ENV_LOG_FORMAT).unwrap_or(defaults.log_format),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects out-of-range values instead of clamping them.
    pub fn validate(&self) -> Result<(), McpError> {
        if self.server_name.trim().is_empty() {
            return Err(McpError::Configuration("server name must not be empty".into()));
        }
        if !(watcher::MIN_DEBOUNCE_MS..=watcher::MAX_DEBOUNCE_MS).contains(&self.watch.debounce_ms)
        {
            return Err(McpError::Configuration(format!(
                "{}={} is outside {}..={}",
                keys::ENV_WATCH_DEBOUNCE_MS,
                self.watch.debounce_ms,
                watcher::MIN_DEBOUNCE_MS,
                watcher::MAX_DEBOUNCE_MS
            )));
        }
        self.executor.validate()?;
        match self.log_format.as_str() {
            "json" | "text" => Ok(()),
            other => Err(McpError::Configuration(format!(
                "{} must be 'json' or 'text', got '{}'",
                keys::ENV_LOG_FORMAT,
                other
            ))),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_name: env!("CARGO_PKG_NAME").to_string(),
            protocol_version: protocol::LATEST.to_string(),
            capabilities: CapabilityConfig::default(),
            watch: WatchConfig::default(),
            executor: ExecutorConfig::default(),
            allow_speculative_subscriptions: false,
            sensitive_keys: redaction::DEFAULT_SENSITIVE_KEYS
                .iter()
                .map(|k| k.to_string())
                .collect(),
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }
}

pub fn parse_bool_or_default<F>(lookup: &F, key: &str, default: bool) -> Result<bool, McpError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "" => Ok(default),
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(McpError::Configuration(format!(
                "{} must be a boolean, got '{}'",
                key, raw
            ))),
        },
    }
}

pub fn parse_u64_or_default<F>(lookup: &F, key: &str, default: u64) -> Result<u64, McpError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            McpError::Configuration(format!("{} must be an integer, got '{}'", key, raw))
        }),
    }
}

/// Like [`parse_u64_or_default`], but rejects values that do not fit `usize`
/// on this target instead of truncating them.
pub fn parse_usize_or_default<F>(lookup: &F, key: &str, default: usize) -> Result<usize, McpError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = parse_u64_or_default(lookup, key, default as u64)?;
    usize::try_from(value).map_err(|_| {
        McpError::Configuration(format!(
            "{} is too large for this platform, got {}",
            key, value
        ))
    })
}

/// Comma-separated list; `None` when unset or empty.
fn parse_list<F>(lookup: &F, key: &str) -> Option<Vec<String>>
where
    F: Fn(&str) -> Option<String>,
{
    let items: Vec<String> = lookup(key)?
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    (!items.is_empty()).then_some(items)
}
