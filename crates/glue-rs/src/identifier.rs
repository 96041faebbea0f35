use std::fmt;

use serde::{Deserialize, Serialize};

use crate::abi::{
    GuidInfo, UniqueShapeInferenceHash, KERNEL_SUPPORTS_64BIT, KERNEL_SUPPORTS_DYNAMIC_SHAPES,
};
use crate::shape::{ShapeFunctionKey, ShapeOrigin};

const FNV1A_OFFSET: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

/// Substring marking identifiers produced by the kernel fuser.
pub const FUSED_KERNEL_MARKER: &str = "fused_kernel";

/// FNV-1a over `bytes`, truncated to the 56 bits available in a shape-function key.
pub fn name_hash56(bytes: &[u8]) -> u64 {
    let mut hash = FNV1A_OFFSET;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV1A_PRIME);
    }
    hash & UniqueShapeInferenceHash::HASH_MASK
}

/// Symbolic name of an operation plus what its provider declared about it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationIdentifier {
    name: String,
    hash: Option<u64>,
    origin: Option<ShapeOrigin>,
    pub supports_dynamic_shapes: bool,
    pub supports_64bit: bool,
}

impl OperationIdentifier {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hash: None,
            origin: None,
            supports_dynamic_shapes: false,
            supports_64bit: false,
        }
    }

    /// Reads an entry reported by a plug-in's enumeration entry point. A zero hash means the
    /// plug-in left hashing to the compiler. The shared-object byte is reserved for the compiler,
    /// so the origin is left unset until the registry assigns one.
    pub fn from_guid_info(info: &GuidInfo) -> Self {
        let hash = info.name_hash.hash_value();
        Self {
            name: info.name(),
            hash: (hash != 0).then_some(hash),
            origin: None,
            supports_dynamic_shapes: info.supports_dynamic_shapes(),
            supports_64bit: info.supports_64bit(),
        }
    }

    pub fn with_hash(mut self, hash: u64) -> Self {
        self.hash = Some(hash & UniqueShapeInferenceHash::HASH_MASK);
        self
    }

    pub fn with_origin(mut self, origin: ShapeOrigin) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn with_dynamic_shapes(mut self, supported: bool) -> Self {
        self.supports_dynamic_shapes = supported;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hash supplied by the provider, if any.
    pub fn provided_hash(&self) -> Option<u64> {
        self.hash
    }

    /// Provider hash, or the name hash when the provider did not supply one.
    pub fn hash(&self) -> u64 {
        self.hash.unwrap_or_else(|| name_hash56(self.name.as_bytes()))
    }

    pub fn origin(&self) -> Option<ShapeOrigin> {
        self.origin
    }

    pub fn is_fused(&self) -> bool {
        is_fused_name(&self.name)
    }

    /// Key under which this identifier's shape-inference routine is published.
    pub fn shape_function_key(&self) -> Option<ShapeFunctionKey> {
        let origin = self.origin?;
        Some(ShapeFunctionKey::new(origin, self.hash()))
    }

    pub fn kernel_properties(&self) -> u32 {
        let mut properties = 0;
        if self.supports_dynamic_shapes {
            properties |= KERNEL_SUPPORTS_DYNAMIC_SHAPES;
        }
        if self.supports_64bit {
            properties |= KERNEL_SUPPORTS_64BIT;
        }
        properties
    }

    pub fn to_guid_info(&self) -> GuidInfo {
        let tag = self.origin.map(ShapeOrigin::tag).unwrap_or(0);
        GuidInfo::new(
            &self.name,
            UniqueShapeInferenceHash::new(self.hash.unwrap_or(0), tag),
            self.kernel_properties(),
        )
    }
}

impl fmt::Display for OperationIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

pub fn is_fused_name(name: &str) -> bool {
    name.contains(FUSED_KERNEL_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_hash_fits_in_56_bits() {
        let hash = name_hash56(b"relu_fwd_f32");
        assert_ne!(hash, 0);
        assert_eq!(hash >> 56, 0);
        assert_eq!(hash, name_hash56(b"relu_fwd_f32"));
        assert_ne!(hash, name_hash56(b"relu_bwd_f32"));
    }

    #[test]
    fn guid_info_round_trip_keeps_flags_and_origin() {
        let id = OperationIdentifier::new("add_f32")
            .with_hash(77)
            .with_origin(ShapeOrigin::FirstPartyPlugin)
            .with_dynamic_shapes(true);
        let back = OperationIdentifier::from_guid_info(&id.to_guid_info())
            .with_origin(ShapeOrigin::FirstPartyPlugin);
        assert_eq!(back, id);
        assert_eq!(
            back.shape_function_key(),
            Some(ShapeFunctionKey::new(ShapeOrigin::FirstPartyPlugin, 77))
        );
    }

    #[test]
    fn fused_identifiers_are_recognised_by_marker() {
        assert!(OperationIdentifier::new("fused_kernel_12_f32").is_fused());
        assert!(!OperationIdentifier::new("add_f32").is_fused());
    }
}
