use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::abi::{GetShapeInferenceFn, GlueCodeReturn};
use crate::device::DeviceClass;
use crate::error::{GlueError, GlueResult};
use crate::identifier::OperationIdentifier;
use crate::loader::PluginLibrary;

use super::io::{call_plugin_shape_inference, SifOutputs, SifParams, SmfOutputs, SmfParams};
use super::key::ShapeFunctionKey;

/// Compiled-in shape-inference routine.
pub type CoreInferenceFn = fn(DeviceClass, &SifParams, &mut SifOutputs) -> GlueCodeReturn;
/// Compiled-in shape-manipulation routine.
pub type CoreManipulationFn = fn(&SmfParams<'_>, &mut SmfOutputs);

/// A plug-in shape-inference entry point together with the library that owns it.
#[derive(Clone)]
pub struct PluginShapeFunction {
    pub entry: GetShapeInferenceFn,
    pub library: Arc<PluginLibrary>,
}

#[derive(Clone)]
pub enum ShapeFunction {
    Inference(CoreInferenceFn),
    Manipulation(CoreManipulationFn),
    Plugin(PluginShapeFunction),
}

impl ShapeFunction {
    pub fn plugin(entry: GetShapeInferenceFn, library: Arc<PluginLibrary>) -> Self {
        ShapeFunction::Plugin(PluginShapeFunction { entry, library })
    }

    /// Address of the callable, used to tell re-registrations from replacements.
    pub fn address(&self) -> usize {
        match self {
            ShapeFunction::Inference(func) => *func as usize,
            ShapeFunction::Manipulation(func) => *func as usize,
            ShapeFunction::Plugin(plugin) => plugin.entry as usize,
        }
    }

    pub fn is_inference(&self) -> bool {
        !matches!(self, ShapeFunction::Manipulation(_))
    }
}

impl PartialEq for ShapeFunction {
    fn eq(&self, other: &Self) -> bool {
        self.is_inference() == other.is_inference() && self.address() == other.address()
    }
}

impl fmt::Debug for ShapeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            ShapeFunction::Inference(_) => "Inference",
            ShapeFunction::Manipulation(_) => "Manipulation",
            ShapeFunction::Plugin(_) => "Plugin",
        };
        write!(f, "{kind}({:#x})", self.address())
    }
}

#[derive(Clone, Debug)]
pub struct ShapeFunctionRecord {
    pub function: ShapeFunction,
    pub version: u64,
    pub name: String,
    pub identifier: Option<OperationIdentifier>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Inserted,
    Unchanged,
    Replaced,
}

/// Recorded when a key is re-registered with a different function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShapeFunctionOverride {
    pub key: ShapeFunctionKey,
    pub previous: String,
    pub replacement: String,
}

/// Table of every callable shape function, keyed by origin-tagged id.
#[derive(Debug, Default)]
pub struct ShapeFunctionRegistry {
    entries: HashMap<ShapeFunctionKey, ShapeFunctionRecord>,
    overrides: Vec<ShapeFunctionOverride>,
}

impl ShapeFunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the compiled-in routines.
    pub fn with_core_functions() -> Self {
        let mut registry = Self::new();
        super::builtin::register_core_functions(&mut registry);
        registry
    }

    pub fn register(
        &mut self,
        key: ShapeFunctionKey,
        function: ShapeFunction,
        name: impl Into<String>,
        version: u64,
    ) -> GlueResult<RegistrationOutcome> {
        self.register_record(
            key,
            ShapeFunctionRecord {
                function,
                version,
                name: name.into(),
                identifier: None,
            },
        )
    }

    pub fn register_record(
        &mut self,
        key: ShapeFunctionKey,
        record: ShapeFunctionRecord,
    ) -> GlueResult<RegistrationOutcome> {
        if !key.is_valid() {
            return Err(GlueError::contract(format!(
                "cannot register shape function {} under the invalid key",
                record.name
            )));
        }
        match self.entries.get_mut(&key) {
            Some(existing) if existing.function == record.function => {
                Ok(RegistrationOutcome::Unchanged)
            }
            Some(existing) => {
                tracing::warn!(
                    key = %key,
                    previous = %existing.name,
                    replacement = %record.name,
                    "shape function replaced"
                );
                self.overrides.push(ShapeFunctionOverride {
                    key,
                    previous: existing.name.clone(),
                    replacement: record.name.clone(),
                });
                *existing = record;
                Ok(RegistrationOutcome::Replaced)
            }
            None => {
                tracing::trace!(
                    key = %key,
                    name = %record.name,
                    version = record.version,
                    "shape function registered"
                );
                self.entries.insert(key, record);
                Ok(RegistrationOutcome::Inserted)
            }
        }
    }

    pub fn get(&self, key: ShapeFunctionKey) -> Option<&ShapeFunction> {
        self.entries.get(&key).map(|record| &record.function)
    }

    pub fn record(&self, key: ShapeFunctionKey) -> Option<&ShapeFunctionRecord> {
        self.entries.get(&key)
    }

    pub fn get_version(&self, key: ShapeFunctionKey) -> Option<u64> {
        self.entries.get(&key).map(|record| record.version)
    }

    pub fn name(&self, key: ShapeFunctionKey) -> Option<&str> {
        self.entries.get(&key).map(|record| record.name.as_str())
    }

    pub fn contains(&self, key: ShapeFunctionKey) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered keys in ascending order.
    pub fn keys(&self) -> Vec<ShapeFunctionKey> {
        let mut keys: Vec<_> = self.entries.keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn diagnostics(&self) -> &[ShapeFunctionOverride] {
        &self.overrides
    }

    /// Checks a persisted `(key, version)` pair against the live table.
    pub fn check_binding(&self, key: ShapeFunctionKey, recorded: u64) -> GlueResult<()> {
        let live = self
            .get_version(key)
            .ok_or(GlueError::MissingShapeFunction { key })?;
        if live != recorded {
            return Err(GlueError::VersionMismatch {
                key,
                recorded,
                live,
            });
        }
        Ok(())
    }

    pub fn invoke_inference(
        &self,
        key: ShapeFunctionKey,
        device: DeviceClass,
        params: &SifParams,
        outputs: &mut SifOutputs,
    ) -> GlueResult<()> {
        let record = self
            .entries
            .get(&key)
            .ok_or(GlueError::MissingShapeFunction { key })?;
        let code = match &record.function {
            ShapeFunction::Inference(func) => func(device, params, outputs),
            ShapeFunction::Plugin(plugin) => {
                let identifier = record
                    .identifier
                    .clone()
                    .unwrap_or_else(|| OperationIdentifier::new(&record.name));
                call_plugin_shape_inference(plugin.entry, device, &identifier, params, outputs)
            }
            ShapeFunction::Manipulation(_) => {
                return Err(GlueError::contract(format!(
                    "shape function {key} is a manipulation routine"
                )))
            }
        };
        GlueError::from_code(code, &record.name, device)
    }

    pub fn invoke_manipulation(
        &self,
        key: ShapeFunctionKey,
        params: &SmfParams<'_>,
        outputs: &mut SmfOutputs,
    ) -> GlueResult<()> {
        match self.get(key) {
            Some(ShapeFunction::Manipulation(func)) => {
                func(params, outputs);
                Ok(())
            }
            Some(_) => Err(GlueError::contract(format!(
                "shape function {key} is not a manipulation routine"
            ))),
            None => Err(GlueError::MissingShapeFunction { key }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::ShapeOrigin;

    fn first(_: DeviceClass, _: &SifParams, _: &mut SifOutputs) -> GlueCodeReturn {
        GlueCodeReturn::SUCCESS
    }

    fn second(_: DeviceClass, _: &SifParams, _: &mut SifOutputs) -> GlueCodeReturn {
        GlueCodeReturn::FAILED
    }

    #[test]
    fn re_registration_is_a_no_op_and_replacement_is_recorded() {
        let key = ShapeFunctionKey::new(ShapeOrigin::FirstPartyPlugin, 9);
        let mut registry = ShapeFunctionRegistry::new();

        let outcome = registry
            .register(key, ShapeFunction::Inference(first), "first", 1)
            .unwrap_or_else(|err| panic!("unexpected error: {err}"));
        assert_eq!(outcome, RegistrationOutcome::Inserted);

        let outcome = registry
            .register(key, ShapeFunction::Inference(first), "first-again", 2)
            .unwrap_or_else(|err| panic!("unexpected error: {err}"));
        assert_eq!(outcome, RegistrationOutcome::Unchanged);
        assert_eq!(registry.get_version(key), Some(1));
        assert!(registry.diagnostics().is_empty());

        let outcome = registry
            .register(key, ShapeFunction::Inference(second), "second", 3)
            .unwrap_or_else(|err| panic!("unexpected error: {err}"));
        assert_eq!(outcome, RegistrationOutcome::Replaced);
        assert_eq!(registry.get_version(key), Some(3));
        assert_eq!(registry.name(key), Some("second"));
        assert_eq!(registry.diagnostics().len(), 1);
        assert_eq!(registry.diagnostics()[0].previous, "first");
    }

    #[test]
    fn invalid_key_is_rejected() {
        let mut registry = ShapeFunctionRegistry::new();
        let err = registry
            .register(
                ShapeFunctionKey::INVALID,
                ShapeFunction::Inference(first),
                "first",
                1,
            )
            .expect_err("invalid key should be rejected");
        assert!(matches!(err, GlueError::Contract { .. }));
    }

    #[test]
    fn failing_routine_surfaces_as_unsupported() {
        let key = ShapeFunctionKey::new(ShapeOrigin::CoreInference, 99);
        let mut registry = ShapeFunctionRegistry::new();
        registry
            .register(key, ShapeFunction::Inference(second), "second", 1)
            .unwrap_or_else(|err| panic!("unexpected error: {err}"));
        let mut outputs = SifOutputs::new(1);
        let err = registry
            .invoke_inference(key, DeviceClass::Gaudi2, &SifParams::default(), &mut outputs)
            .expect_err("failing routine should error");
        assert_eq!(err.raw_code(), Some(GlueCodeReturn::FAILED));
    }
}
