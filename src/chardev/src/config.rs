// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// Embed-time configuration of one chardev backend.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ChardevConfig {
    /// Identifier used in diagnostics and conflict errors.
    pub label: String,
    /// Suppress input and input-derived events towards guest-attached
    /// bindings of this backend.
    #[serde(default)]
    pub drop_guest_input: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_with_default_input_policy() {
        let config: ChardevConfig = serde_json::from_str(r#"{ "label": "serial0" }"#).unwrap();
        assert_eq!(config.label, "serial0");
        assert!(!config.drop_guest_input);

        let config: ChardevConfig =
            serde_json::from_str(r#"{ "label": "serial1", "drop_guest_input": true }"#).unwrap();
        assert!(config.drop_guest_input);
    }

    #[test]
    fn rejects_unknown_fields() {
        let res: Result<ChardevConfig, _> =
            serde_json::from_str(r#"{ "label": "x", "drop_input": true }"#);
        res.unwrap_err();
    }
}
