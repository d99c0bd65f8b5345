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

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

/// Everything that can abort a statement, plus process-level failures.
///
/// Rewrites never produce a `ProxyError`: a rewrite that cannot apply declines
/// silently and the original statement continues through the pipeline.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("syntax error in statement: {0}")]
    Parse(String),

    #[error("writes are blocked by this proxy; statement looks like `{verb}`")]
    WriteBlocked { verb: String },

    #[error("{feature} is not supported by the backend{}", .hint.as_deref().map(|h| format!("; {h}")).unwrap_or_default())]
    Unsupported {
        feature: String,
        hint: Option<String>,
    },

    #[error(
        "statement must filter on a partition date column; add a predicate on one of: {}, e.g. `WHERE {} = '2024-01-15'` or `WHERE {} = -1`",
        .columns.join(", "),
        .columns.first().map(String::as_str).unwrap_or("cob_date"),
        .columns.last().map(String::as_str).unwrap_or("date_index"),
    )]
    MissingDatePredicate { columns: Vec<String> },

    #[error("lost connection to backend: {0}")]
    BackendTransient(String),

    #[error("{message}")]
    BackendQuery { code: Option<u16>, message: String },

    #[error("timed out after {0:.1?} waiting for the backend")]
    Timeout(Duration),

    #[error("result shape error")]
    ResultShape,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("fatal proxy error: {0}")]
    Fatal(String),
}

impl ProxyError {
    pub fn unsupported(feature: impl Into<String>) -> Self {
        Self::Unsupported {
            feature: feature.into(),
            hint: None,
        }
    }

    pub fn unsupported_with_hint(feature: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Unsupported {
            feature: feature.into(),
            hint: Some(hint.into()),
        }
    }

    /// The MySQL error code surfaced on the wire for this kind.
    pub fn mysql_code(&self) -> u16 {
        match self {
            Self::Parse(_) => 1064,
            Self::WriteBlocked { .. } => 1290,
            Self::Unsupported { .. } => 1235,
            Self::MissingDatePredicate { .. } => 1235,
            Self::BackendTransient(_) => 1053,
            Self::BackendQuery { code, .. } => code.unwrap_or(1105),
            Self::Timeout(_) => 1205,
            Self::ResultShape => 1815,
            Self::Config(_) => 1105,
            Self::Fatal(_) => 1815,
        }
    }

    /// Whether the client may reasonably retry the same statement.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::BackendTransient(_) | Self::Timeout(_))
    }

    /// Process-level failures that should tear the connection down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}
