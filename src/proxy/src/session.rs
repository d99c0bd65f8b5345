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

//! Per-connection session state: the current database, user-defined
//! variables and the shadow system variables BI clients read back. None of
//! this ever reaches the backend.

use std::collections::HashMap;
use std::fmt;

/// A scalar as the session and the static-SELECT evaluator see it.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
}

impl ScalarValue {
    /// Render for the text protocol; NULL becomes an absent cell.
    pub fn to_cell(&self) -> Option<String> {
        match self {
            Self::Null => None,
            other => Some(other.to_string()),
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !s.is_empty() && s != "0",
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

/// Session-variable shadows seeded with the defaults a stock MySQL 8 reports.
/// Tableau and its drivers read these back right after connecting.
fn default_system_variables() -> HashMap<String, ScalarValue> {
    let mut vars = HashMap::new();
    let defaults: &[(&str, ScalarValue)] = &[
        ("autocommit", ScalarValue::Int(1)),
        ("auto_increment_increment", ScalarValue::Int(1)),
        ("character_set_client", ScalarValue::Str("utf8mb4".into())),
        ("character_set_connection", ScalarValue::Str("utf8mb4".into())),
        ("character_set_results", ScalarValue::Str("utf8mb4".into())),
        ("character_set_server", ScalarValue::Str("utf8mb4".into())),
        ("character_set_database", ScalarValue::Str("utf8mb4".into())),
        ("collation_connection", ScalarValue::Str("utf8mb4_general_ci".into())),
        ("collation_server", ScalarValue::Str("utf8mb4_general_ci".into())),
        ("interactive_timeout", ScalarValue::Int(28800)),
        ("wait_timeout", ScalarValue::Int(28800)),
        ("net_write_timeout", ScalarValue::Int(60)),
        ("max_allowed_packet", ScalarValue::Int(67108864)),
        ("lower_case_table_names", ScalarValue::Int(0)),
        ("sql_mode", ScalarValue::Str("ANSI_QUOTES".into())),
        ("tx_isolation", ScalarValue::Str("REPEATABLE-READ".into())),
        ("transaction_isolation", ScalarValue::Str("REPEATABLE-READ".into())),
        ("tx_read_only", ScalarValue::Int(0)),
        ("transaction_read_only", ScalarValue::Int(0)),
        ("version", ScalarValue::Str("8.0.26".into())),
        ("version_comment", ScalarValue::Str("SqlBridge proxy".into())),
        ("sql_select_limit", ScalarValue::Null),
    ];
    for (name, value) in defaults {
        vars.insert((*name).to_owned(), value.clone());
    }
    vars
}

#[derive(Debug)]
pub struct SessionState {
    connection_id: u32,
    user: String,
    current_database: Option<String>,
    user_variables: HashMap<String, ScalarValue>,
    system_variables: HashMap<String, ScalarValue>,
}

impl SessionState {
    pub fn new(connection_id: u32) -> Self {
        Self {
            connection_id,
            user: "proxy@%".to_owned(),
            current_database: None,
            user_variables: HashMap::new(),
            system_variables: default_system_variables(),
        }
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn current_database(&self) -> Option<&str> {
        self.current_database.as_deref()
    }

    pub fn set_current_database(&mut self, database: impl Into<String>) {
        self.current_database = Some(database.into());
    }

    /// System-variable shadow lookup; names are case-insensitive and an
    /// optional `session.` / `global.` scope prefix is ignored.
    pub fn system_variable(&self, name: &str) -> Option<&ScalarValue> {
        self.system_variables.get(&normalize_variable_name(name))
    }

    pub fn set_system_variable(&mut self, name: &str, value: ScalarValue) {
        self.system_variables
            .insert(normalize_variable_name(name), value);
    }

    pub fn user_variable(&self, name: &str) -> Option<&ScalarValue> {
        self.user_variables.get(&name.to_lowercase())
    }

    pub fn set_user_variable(&mut self, name: &str, value: ScalarValue) {
        self.user_variables.insert(name.to_lowercase(), value);
    }

    /// `SET NAMES <cs> [COLLATE <collation>]`.
    pub fn apply_set_names(&mut self, charset: &str, collation: Option<&str>) {
        for var in [
            "character_set_client",
            "character_set_connection",
            "character_set_results",
        ] {
            self.set_system_variable(var, ScalarValue::Str(charset.to_owned()));
        }
        if let Some(collation) = collation {
            self.set_system_variable("collation_connection", ScalarValue::Str(collation.to_owned()));
        }
    }

    /// `SET CHARACTER SET <cs>`: client and results follow the argument, the
    /// connection charset follows the database charset.
    pub fn apply_set_character_set(&mut self, charset: &str) {
        for var in ["character_set_client", "character_set_results"] {
            self.set_system_variable(var, ScalarValue::Str(charset.to_owned()));
        }
        let database_charset = self
            .system_variable("character_set_database")
            .cloned()
            .unwrap_or_else(|| ScalarValue::Str("utf8mb4".to_owned()));
        self.set_system_variable("character_set_connection", database_charset);
    }

    pub fn apply_isolation_level(&mut self, level: &str) {
        self.set_system_variable("tx_isolation", ScalarValue::Str(level.to_owned()));
        self.set_system_variable("transaction_isolation", ScalarValue::Str(level.to_owned()));
    }

    pub fn apply_read_only(&mut self, read_only: bool) {
        let value = ScalarValue::Int(read_only as i64);
        self.set_system_variable("tx_read_only", value.clone());
        self.set_system_variable("transaction_read_only", value);
    }
}

fn normalize_variable_name(name: &str) -> String {
    let name = name.trim_start_matches("@@");
    let name = name
        .strip_prefix("session.")
        .or_else(|| name.strip_prefix("SESSION."))
        .or_else(|| name.strip_prefix("global."))
        .or_else(|| name.strip_prefix("GLOBAL."))
        .unwrap_or(name);
    name.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_present() {
        let state = SessionState::new(7);
        assert_eq!(state.connection_id(), 7);
        assert_eq!(
            state.system_variable("version_comment"),
            Some(&ScalarValue::Str("SqlBridge proxy".into()))
        );
        assert_eq!(state.system_variable("autocommit"), Some(&ScalarValue::Int(1)));
    }

    #[test]
    fn test_variable_name_normalization() {
        let state = SessionState::new(1);
        assert!(state.system_variable("@@AUTOCOMMIT").is_some());
        assert!(state.system_variable("@@session.autocommit").is_some());
        assert!(state.system_variable("GLOBAL.autocommit").is_some());
        assert!(state.system_variable("no_such_variable").is_none());
    }

    #[test]
    fn test_set_names() {
        let mut state = SessionState::new(1);
        state.apply_set_names("latin1", Some("latin1_swedish_ci"));
        assert_eq!(
            state.system_variable("character_set_client"),
            Some(&ScalarValue::Str("latin1".into()))
        );
        assert_eq!(
            state.system_variable("character_set_connection"),
            Some(&ScalarValue::Str("latin1".into()))
        );
        assert_eq!(
            state.system_variable("collation_connection"),
            Some(&ScalarValue::Str("latin1_swedish_ci".into()))
        );
    }

    #[test]
    fn test_set_character_set_connection_follows_database() {
        let mut state = SessionState::new(1);
        state.set_system_variable("character_set_database", ScalarValue::Str("latin1".into()));
        state.apply_set_character_set("ascii");
        assert_eq!(
            state.system_variable("character_set_client"),
            Some(&ScalarValue::Str("ascii".into()))
        );
        assert_eq!(
            state.system_variable("character_set_connection"),
            Some(&ScalarValue::Str("latin1".into()))
        );
    }

    #[test]
    fn test_user_variables() {
        let mut state = SessionState::new(1);
        state.set_user_variable("Answer", ScalarValue::Int(42));
        assert_eq!(state.user_variable("answer"), Some(&ScalarValue::Int(42)));
        assert_eq!(state.user_variable("other"), None);
    }

    #[test]
    fn test_scalar_cells() {
        assert_eq!(ScalarValue::Null.to_cell(), None);
        assert_eq!(ScalarValue::Int(5).to_cell(), Some("5".to_owned()));
        assert_eq!(ScalarValue::Str("x".into()).to_cell(), Some("x".to_owned()));
    }
}
