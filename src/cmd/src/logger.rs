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

//! Logger wiring: compact or JSON records, stderr or a daily-rotated file,
//! with per-target filtering so third-party crates stay at WARN.

use std::path::Path;

use sqlbridge_common::config::LoggingSection;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter;
use tracing_subscriber::prelude::*;

fn sqlbridge_targets(level: Level) -> filter::Targets {
    filter::Targets::new()
        .with_target("sqlbridge_cmd", level)
        .with_target("sqlbridge_common", level)
        .with_target("sqlbridge_proxy", level)
        .with_target("sqlbridge_wire", level)
        // Third-party crates only surface warnings.
        .with_default(Level::WARN)
}

/// Initialize the global subscriber. The returned guard must live for the
/// whole process when file logging is on; dropping it loses buffered records.
pub fn init(settings: &LoggingSection) -> Option<WorkerGuard> {
    let level = settings
        .level
        .parse::<Level>()
        .unwrap_or(Level::INFO);
    let targets = sqlbridge_targets(level);

    match &settings.file {
        Some(file) => {
            let path = Path::new(file);
            let directory = path.parent().unwrap_or_else(|| Path::new("."));
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "sqlbridge.log".to_owned());
            let appender = tracing_appender::rolling::daily(directory, filename);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            if settings.json {
                tracing_subscriber::registry()
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_ansi(false)
                            .with_writer(writer)
                            .with_filter(targets),
                    )
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(
                        tracing_subscriber::fmt::layer()
                            .compact()
                            .with_ansi(false)
                            .with_writer(writer)
                            .with_filter(targets),
                    )
                    .init();
            }
            Some(guard)
        }
        None => {
            if settings.json {
                tracing_subscriber::registry()
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_filter(targets),
                    )
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(
                        tracing_subscriber::fmt::layer()
                            .compact()
                            .with_filter(targets),
                    )
                    .init();
            }
            None
        }
    }
}
