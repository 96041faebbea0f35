use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{GlueError, GlueResult};

/// Executable code pulled out of the container an instantiate call produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelBinary {
    pub code: Vec<u8>,
    /// Program header bytes, empty when the container format has none.
    pub header: Vec<u8>,
}

/// Pulls the executable part out of a kernel container. The container format belongs to the
/// device tool-chain, so callers inject the parser.
pub trait BinaryExtractor: Send + Sync {
    fn extract(&self, container: &[u8]) -> Result<KernelBinary, String>;
}

/// Treats the whole container as the binary.
#[derive(Clone, Copy, Debug, Default)]
pub struct WholeContainer;

impl BinaryExtractor for WholeContainer {
    fn extract(&self, container: &[u8]) -> Result<KernelBinary, String> {
        if container.is_empty() {
            return Err("kernel container is empty".to_string());
        }
        Ok(KernelBinary {
            code: container.to_vec(),
            header: Vec::new(),
        })
    }
}

/// Process-wide cache of extracted binaries keyed by the node that produced them.
#[derive(Debug, Default)]
pub struct KernelBinaryCache {
    entries: Mutex<HashMap<u64, Arc<KernelBinary>>>,
}

impl KernelBinaryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node_id: u64) -> GlueResult<Option<Arc<KernelBinary>>> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| GlueError::contract("kernel binary cache mutex poisoned"))?
            .get(&node_id)
            .cloned())
    }

    pub fn get_or_extract(
        &self,
        node_id: u64,
        container: &[u8],
        extractor: &dyn BinaryExtractor,
    ) -> GlueResult<Arc<KernelBinary>> {
        if let Some(found) = self.get(node_id)? {
            tracing::trace!(node_id, "kernel binary cache hit");
            return Ok(found);
        }

        let binary = extractor.extract(container).map_err(|reason| {
            tracing::error!(node_id, %reason, "failed to extract kernel binary");
            GlueError::BinaryExtraction { node_id, reason }
        })?;
        tracing::debug!(node_id, size = binary.code.len(), "extracted kernel binary");

        let mut entries = self
            .entries
            .lock()
            .map_err(|_| GlueError::contract("kernel binary cache mutex poisoned"))?;
        let cached = entries
            .entry(node_id)
            .or_insert_with(|| Arc::new(binary));
        Ok(Arc::clone(cached))
    }

    /// Drops every cached binary. Binaries already handed out stay alive through their `Arc`.
    pub fn clear(&self) {
        let mut entries = self.recovered();
        tracing::debug!(dropped = entries.len(), "clearing kernel binary cache");
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.recovered().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries are only inserted whole, so a poisoned map is still consistent.
    fn recovered(&self) -> MutexGuard<'_, HashMap<u64, Arc<KernelBinary>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Kernel container returned by instantiation plus its lazily extracted binary.
#[derive(Clone, Debug, Default)]
pub struct DeviceKernelImage {
    container: Vec<u8>,
    binary: Option<Arc<KernelBinary>>,
}

impl DeviceKernelImage {
    pub fn new(container: Vec<u8>) -> Self {
        Self {
            container,
            binary: None,
        }
    }

    pub fn container(&self) -> &[u8] {
        &self.container
    }

    pub fn is_extracted(&self) -> bool {
        self.binary.is_some()
    }

    pub fn binary(&self) -> Option<&Arc<KernelBinary>> {
        self.binary.as_ref()
    }

    /// Extracts once; later calls return the stored binary without touching the extractor.
    pub fn extract(
        &mut self,
        node_id: u64,
        extractor: &dyn BinaryExtractor,
        cache: &KernelBinaryCache,
    ) -> GlueResult<Arc<KernelBinary>> {
        if let Some(binary) = &self.binary {
            return Ok(Arc::clone(binary));
        }
        let binary = cache.get_or_extract(node_id, &self.container, extractor)?;
        self.binary = Some(Arc::clone(&binary));
        Ok(binary)
    }
}
