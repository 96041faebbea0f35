use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::abi::GuidInfo;
use crate::device::DeviceClass;
use crate::error::{GlueError, GlueResult};
use crate::identifier::{name_hash56, OperationIdentifier};
use crate::loader::PluginLibrary;
use crate::shape::ShapeOrigin;

use super::record::CapabilityRecord;

/// Macro-operations exported by the complex-capability library, split by whether they exist for
/// functional coverage or as performance rewrites. Consulted before the primary registry.
#[derive(Debug, Default)]
pub struct ComplexCapabilityIndex {
    functional: [HashSet<String>; DeviceClass::COUNT],
    performance: [HashSet<String>; DeviceClass::COUNT],
    records: [HashMap<String, CapabilityRecord>; DeviceClass::COUNT],
}

impl ComplexCapabilityIndex {
    pub(crate) fn load(
        &mut self,
        library: &Arc<PluginLibrary>,
        device: DeviceClass,
        library_version: u64,
    ) -> GlueResult<()> {
        let entries = library.entry_points();
        let missing = [
            ("GetShapeInference", entries.shape_inference.is_none()),
            ("GetSupportedDataLayouts", entries.supported_layouts.is_none()),
            (
                "GetFunctionalComplexGuids",
                entries.functional_complex_guids.is_none(),
            ),
            (
                "GetPerformanceComplexGuids",
                entries.performance_complex_guids.is_none(),
            ),
        ];
        if let Some((entry_point, _)) = missing.iter().find(|(_, absent)| *absent) {
            return Err(GlueError::load_failure(
                library.name(),
                format!("missing entry point {entry_point}"),
            ));
        }

        let functional = library.functional_complex_guids(device)?.unwrap_or_default();
        let performance = library.performance_complex_guids(device)?.unwrap_or_default();
        for (kind, guids) in [("functional", &functional), ("performance", &performance)] {
            if guids.is_empty() {
                tracing::warn!(%device, kind, "complex library reports no identifiers");
            }
        }

        for info in &functional {
            self.functional[device.index()].insert(info.name());
            self.upsert(library, device, library_version, info);
        }
        for info in &performance {
            self.performance[device.index()].insert(info.name());
            self.upsert(library, device, library_version, info);
        }
        Ok(())
    }

    /// A dynamic-shape record is never replaced; a static one is overwritten.
    fn upsert(
        &mut self,
        library: &Arc<PluginLibrary>,
        device: DeviceClass,
        library_version: u64,
        info: &GuidInfo,
    ) {
        let name = info.name();
        let records = &mut self.records[device.index()];
        if records
            .get(&name)
            .is_some_and(CapabilityRecord::is_dynamic_shape)
        {
            return;
        }
        let identifier = OperationIdentifier::from_guid_info(info)
            .with_hash(name_hash56(name.as_bytes()))
            .with_origin(ShapeOrigin::ComplexPlugin);
        let mut record = CapabilityRecord::from_library(library, identifier, library_version, None);
        record.instantiate = None;
        record.suggested_manipulation = None;
        tracing::trace!(%device, identifier = %name, "complex identifier registered");
        records.insert(name, record);
    }

    pub fn is_supported(&self, name: &str, device: DeviceClass) -> bool {
        self.is_functional(name, device) || self.is_performance(name, device)
    }

    pub fn is_functional(&self, name: &str, device: DeviceClass) -> bool {
        self.functional[device.index()].contains(name)
    }

    pub fn is_performance(&self, name: &str, device: DeviceClass) -> bool {
        self.performance[device.index()].contains(name)
    }

    pub fn record(&self, name: &str, device: DeviceClass) -> Option<&CapabilityRecord> {
        self.records[device.index()].get(name)
    }

    pub fn dynamic_record(&self, name: &str, device: DeviceClass) -> Option<&CapabilityRecord> {
        self.record(name, device)
            .filter(|record| record.is_dynamic_shape())
    }

    pub fn records(&self, device: DeviceClass) -> impl Iterator<Item = &CapabilityRecord> {
        self.records[device.index()].values()
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }
}
