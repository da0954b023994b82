// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::backend::mock::MockConfig;
use serde::{Deserialize, Serialize};

/// Errors associated with loading a platform configuration.
#[derive(Debug, thiserror::Error, displaydoc::Display, derive_more::From)]
pub enum ConfigError {
    /// Invalid JSON: {0}
    InvalidJson(serde_json::Error),
    /// The mock platform must allow at least one vcpu
    #[from(ignore)]
    InvalidVcpuCount,
}

/// Which implementation of the platform to drive.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// The host's virtualization framework.
    #[default]
    Native,
    /// The in-process test double.
    Mock,
}

/// Platform selection, as read from a json file.
#[derive(Debug, Default, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub backend: BackendKind,
    pub mock: MockConfig,
}

impl PlatformConfig {
    pub fn from_json(config_json: &str) -> std::result::Result<Self, ConfigError> {
        let config: PlatformConfig = serde_json::from_str(config_json)?;
        if config.backend == BackendKind::Mock && config.mock.max_vcpus == 0 {
            return Err(ConfigError::InvalidVcpuCount);
        }
        Ok(config)
    }

    pub fn mock(mock: MockConfig) -> Self {
        PlatformConfig {
            backend: BackendKind::Mock,
            mock,
        }
    }
}
