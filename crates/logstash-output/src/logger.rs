// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Logging setup for embedders that do not install their own subscriber.
//!
//! The publisher itself only emits `tracing` events, all prefixed with
//! `LOGSTASH |`. [`init`] installs a plain fmt subscriber filtered to the
//! configured level, muting the chatty runtime crates.

use crate::error::PublishError;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Filter directive for the given level.
pub fn env_filter(log_level: &str) -> Result<EnvFilter, PublishError> {
    EnvFilter::try_new(format!("tokio=off,runtime=off,{log_level}"))
        .map_err(|e| PublishError::InvalidConfig(format!("could not parse log level: {e}")))
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init(log_level: &str) -> Result<(), PublishError> {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter(log_level)?)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| PublishError::InvalidConfig(format!("setting default subscriber failed: {e}")))?;

    debug!("LOGSTASH | Logging subsystem enabled");
    Ok(())
}
