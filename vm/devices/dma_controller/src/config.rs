// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use serde::Deserialize;
use serde::Serialize;

/// The number of regions a controller holds when not configured otherwise.
pub const DEFAULT_MAX_REGIONS: usize = 16;

/// Configuration for a [`DmaController`](crate::DmaController).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DmaControllerConfig {
    /// The name of the owning device, used in log records.
    pub name: String,
    /// The maximum number of regions the controller can hold.
    pub max_regions: usize,
}

impl Default for DmaControllerConfig {
    fn default() -> Self {
        Self {
            name: "dma".to_owned(),
            max_regions: DEFAULT_MAX_REGIONS,
        }
    }
}
