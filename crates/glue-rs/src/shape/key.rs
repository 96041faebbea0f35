use std::fmt;

use serde::{Deserialize, Serialize};

use crate::abi::UniqueShapeInferenceHash;

/// Namespace of a shape-function id. Each namespace numbers its functions independently; the tag
/// occupies the top byte of a [`ShapeFunctionKey`] so ids from different namespaces never collide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeOrigin {
    CoreManipulation,
    CoreInference,
    FirstPartyPlugin,
    FuserPlugin,
    ComplexPlugin,
}

impl ShapeOrigin {
    pub const ALL: [ShapeOrigin; 5] = [
        ShapeOrigin::CoreManipulation,
        ShapeOrigin::CoreInference,
        ShapeOrigin::FirstPartyPlugin,
        ShapeOrigin::FuserPlugin,
        ShapeOrigin::ComplexPlugin,
    ];

    pub fn tag(self) -> u8 {
        match self {
            ShapeOrigin::CoreManipulation => 0,
            ShapeOrigin::CoreInference => 1,
            ShapeOrigin::FirstPartyPlugin => 2,
            ShapeOrigin::FuserPlugin => 3,
            ShapeOrigin::ComplexPlugin => 4,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|origin| origin.tag() == tag)
    }

    /// Routines compiled into this crate rather than supplied by a plug-in.
    pub fn is_core(self) -> bool {
        matches!(
            self,
            ShapeOrigin::CoreManipulation | ShapeOrigin::CoreInference
        )
    }
}

impl fmt::Display for ShapeOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ShapeOrigin::CoreManipulation => "core-smf",
            ShapeOrigin::CoreInference => "core-sif",
            ShapeOrigin::FirstPartyPlugin => "plugin",
            ShapeOrigin::FuserPlugin => "fuser",
            ShapeOrigin::ComplexPlugin => "complex",
        };
        f.write_str(label)
    }
}

/// 8-bit origin tag over a 56-bit function id. This is the exact value persisted in artifacts.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShapeFunctionKey(u64);

impl ShapeFunctionKey {
    /// Marks a sub-operation without a shape function (static shape).
    pub const INVALID: ShapeFunctionKey = ShapeFunctionKey(u64::MAX);

    pub fn new(origin: ShapeOrigin, id: u64) -> Self {
        Self(UniqueShapeInferenceHash::new(id, origin.tag()).0)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn id(self) -> u64 {
        UniqueShapeInferenceHash(self.0).hash_value()
    }

    /// `None` for [`Self::INVALID`] and for tags outside the known namespaces.
    pub fn origin(self) -> Option<ShapeOrigin> {
        if !self.is_valid() {
            return None;
        }
        ShapeOrigin::from_tag(UniqueShapeInferenceHash(self.0).shared_object_id())
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Debug for ShapeFunctionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShapeFunctionKey({self})")
    }
}

impl fmt::Display for ShapeFunctionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.origin() {
            Some(origin) => write!(f, "{origin}:{:#x}", self.id()),
            None if !self.is_valid() => f.write_str("invalid"),
            None => write!(f, "unknown:{:#x}", self.0),
        }
    }
}
