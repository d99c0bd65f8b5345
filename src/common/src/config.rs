// Copyright 2025 SqlBridge Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! YAML configuration with `${NAME}` / `${NAME:-default}` environment
//! substitution, applied to the raw document before deserialization.

use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::{Captures, Regex};
use serde::Deserialize;

use crate::error::{ProxyError, Result};

static DOLLAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").unwrap()
});

/// Expand `${NAME}` and `${NAME:-default}` against the process environment.
/// An unset variable without a default expands to the empty string.
pub fn expand_env(raw: &str) -> String {
    DOLLAR_RE
        .replace_all(raw, |caps: &Captures<'_>| {
            match std::env::var(&caps[1]) {
                Ok(v) => v,
                Err(_) => caps.get(2).map(|m| m.as_str().to_owned()).unwrap_or_default(),
            }
        })
        .into_owned()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProxyConfig {
    pub proxy: ProxySection,
    pub backend: BackendSection,
    pub capabilities: CapabilitiesSection,
    pub transformations: TransformationsSection,
    pub business_rules: BusinessRulesSection,
    pub security: SecuritySection,
    pub logging: LoggingSection,
}

impl ProxyConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let expanded = expand_env(raw);
        serde_yaml::from_str(&expanded).map_err(|e| ProxyError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend.connection_string.is_empty() {
            return Err(ProxyError::Config(
                "backend.connection_string must be set".into(),
            ));
        }
        if self.backend.pool_size == 0 {
            return Err(ProxyError::Config("backend.pool_size must be >= 1".into()));
        }
        if self.business_rules.date_columns.is_empty() {
            return Err(ProxyError::Config(
                "business_rules.date_columns must name at least one column".into(),
            ));
        }
        Ok(())
    }

    /// Effective function denylist: `capabilities.unsupported_functions` plus
    /// `COUNT` when `count_function` is listed as an unsupported feature.
    pub fn denied_functions(&self) -> HashSet<String> {
        let mut set: HashSet<String> = self
            .capabilities
            .unsupported_functions
            .iter()
            .map(|f| f.to_uppercase())
            .collect();
        if self
            .capabilities
            .unsupported_features
            .contains(&Feature::CountFunction)
        {
            set.insert("COUNT".to_owned());
        }
        set
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProxySection {
    pub host: String,
    pub port: u16,
    /// Admission bound on concurrent client connections.
    pub max_connections: usize,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 3307,
            max_connections: 100,
        }
    }
}

impl ProxySection {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Odbc,
    Native,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BackendSection {
    pub connection_type: ConnectionType,
    /// Raw connector string; `${…}` expansion has already been applied.
    pub connection_string: String,
    /// P. 1 is supported and common: the backend holds a single session.
    pub pool_size: usize,
    /// Per-statement deadline, seconds.
    pub timeout: u64,
    /// Health-probe a slot before each loan.
    pub pool_pre_ping: bool,
    /// Max slot age in seconds before proactive replacement; 0 disables.
    pub pool_recycle: u64,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            connection_type: ConnectionType::Native,
            connection_string: String::new(),
            pool_size: 1,
            timeout: 30,
            pool_pre_ping: true,
            pool_recycle: 3600,
        }
    }
}

impl BackendSection {
    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn recycle_after(&self) -> Option<Duration> {
        (self.pool_recycle > 0).then(|| Duration::from_secs(self.pool_recycle))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Joins,
    Unions,
    WindowFunctions,
    CountFunction,
    CaseStatements,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CapabilitiesSection {
    pub unsupported_features: Vec<Feature>,
    /// Identifier denylist, matched case-insensitively.
    pub unsupported_functions: Vec<String>,
}

impl Default for CapabilitiesSection {
    fn default() -> Self {
        Self {
            unsupported_features: vec![
                Feature::Joins,
                Feature::Unions,
                Feature::WindowFunctions,
                Feature::CountFunction,
            ],
            unsupported_functions: vec![],
        }
    }
}

impl CapabilitiesSection {
    pub fn feature_unsupported(&self, feature: Feature) -> bool {
        self.unsupported_features.contains(&feature)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TransformationsSection {
    /// Enable the subquery flattener.
    pub unwrap_subqueries: bool,
    /// Enable the GROUP BY completer.
    pub auto_fix_group_by: bool,
    /// Flattener recursion bound.
    pub max_subquery_depth: u32,
}

impl Default for TransformationsSection {
    fn default() -> Self {
        Self {
            unwrap_subqueries: true,
            auto_fix_group_by: true,
            max_subquery_depth: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BusinessRulesSection {
    /// Enable the date-predicate gate.
    pub require_cob_date: bool,
    /// Column names satisfying the gate.
    pub date_columns: Vec<String>,
}

impl Default for BusinessRulesSection {
    fn default() -> Self {
        Self {
            require_cob_date: true,
            date_columns: vec!["cob_date".to_owned(), "date_index".to_owned()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SecuritySection {
    pub block_writes: bool,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self { block_writes: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingSection {
    pub level: String,
    /// Log file path; rotated daily when set.
    pub file: Option<String>,
    /// Emit JSON records instead of the compact human format.
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            file: None,
            json: false,
        }
    }
}
