// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::DmaController;
use parking_lot::RwLock;
use parking_lot::RwLockReadGuard;
use parking_lot::RwLockWriteGuard;
use std::sync::Arc;

/// A [`DmaController`] shared between the thread that registers regions and
/// the threads that perform DMA.
///
/// DMA runs under a shared lock, so transfers on different threads proceed in
/// parallel. Region changes take the lock exclusively and wait for every
/// outstanding guard, and with it every resolved buffer, to be dropped.
#[derive(Debug, Clone)]
pub struct SharedDmaController(Arc<RwLock<DmaController>>);

impl SharedDmaController {
    /// Wraps `controller` for sharing.
    pub fn new(controller: DmaController) -> Self {
        Self(Arc::new(RwLock::new(controller)))
    }

    /// Locks the controller for DMA.
    pub fn read(&self) -> RwLockReadGuard<'_, DmaController> {
        self.0.read()
    }

    /// Locks the controller for adding or removing regions.
    pub fn write(&self) -> RwLockWriteGuard<'_, DmaController> {
        self.0.write()
    }
}
