// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// Embed-time configuration owned by the pacing core.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PacerConfig {
    /// Force chardev front-ends into synchronous I/O so that device
    /// side-effects complete inside the granted virtual-time interval.
    #[serde(default)]
    pub io_sync: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_async_io() {
        assert!(!PacerConfig::default().io_sync);
    }

    #[test]
    fn deserializes_from_json() {
        let config: PacerConfig = serde_json::from_str(r#"{ "io_sync": true }"#).unwrap();
        assert!(config.io_sync);
        let config: PacerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, PacerConfig::default());
    }

    #[test]
    fn rejects_unknown_fields() {
        let res: Result<PacerConfig, _> = serde_json::from_str(r#"{ "iosync": true }"#);
        res.unwrap_err();
    }
}
