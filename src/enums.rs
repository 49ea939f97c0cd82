use std::fmt;

/// How the supplied frame identifiers relate to the acquisition order.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum FrameOrdering {
    /// No order guarantee: every frame's position is resolved and sorted.
    #[default]
    Unordered,
    /// The source protocol already delivers frames in acquisition order, only
    /// the direction is unknown. Only the first and middle frames are resolved.
    ProtocolOrdered,
}

/// Whether the destination buffer should live in shareable memory.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SharingMode {
    #[default]
    Private,
    /// Use a shared mapping when the environment allows it, otherwise fall
    /// back to a private allocation.
    Preferred,
    /// Fail with a capability error when shared memory cannot be provided.
    Required,
}

/// Scheduler request classes, highest precedence first.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RequestClass {
    Interaction,
    Thumbnail,
    #[default]
    Prefetch,
    Compute,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    #[default]
    Idle,
    Loading,
    Loaded,
    Cancelled,
    Decached,
}

/// Element type of the destination buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    U8,
    I16,
    U16,
    F32,
}

impl ElementType {
    /// Width of one element in bytes.
    pub fn width(self) -> usize {
        match self {
            ElementType::U8 => 1,
            ElementType::I16 | ElementType::U16 => 2,
            ElementType::F32 => 4,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(self, ElementType::I16 | ElementType::F32)
    }

    pub fn is_integer(self) -> bool {
        !matches!(self, ElementType::F32)
    }

    /// Representable value range.
    pub fn range(self) -> (f64, f64) {
        match self {
            ElementType::U8 => (u8::MIN as f64, u8::MAX as f64),
            ElementType::I16 => (i16::MIN as f64, i16::MAX as f64),
            ElementType::U16 => (u16::MIN as f64, u16::MAX as f64),
            ElementType::F32 => (f32::MIN as f64, f32::MAX as f64),
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementType::U8 => "u8",
            ElementType::I16 => "i16",
            ElementType::U16 => "u16",
            ElementType::F32 => "f32",
        };
        f.write_str(name)
    }
}

/// Origin of a frame's scaling parameters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ScalingSource {
    /// Plain modality rescale (slope/intercept).
    #[default]
    Modality,
    /// Rescale followed by a quantitative factor, e.g. PET SUV body weight.
    Quantitative,
}
