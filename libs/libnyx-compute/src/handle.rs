//! Opaque driver object identifiers
//!
//! Every driver-level object (context, queue, program, kernel, device memory)
//! is named by a tagged 64-bit id. Ids are unique for the life of the
//! process, so two ids compare equal iff they name the same driver object.
//! Cache keys are built from these ids, never from driver addresses.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global object ID counter
static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

const TAG_SHIFT: u32 = 56;
const COUNTER_MASK: u64 = (1 << TAG_SHIFT) - 1;

/// Kinds of driver objects
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Context = 1,
    Queue = 2,
    Program = 3,
    Kernel = 4,
    Memory = 5,
}

impl ObjectKind {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Context),
            2 => Some(Self::Queue),
            3 => Some(Self::Program),
            4 => Some(Self::Kernel),
            5 => Some(Self::Memory),
            _ => None,
        }
    }
}

/// Tagged object identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Allocate a fresh id of the given kind
    pub fn new(kind: ObjectKind) -> Self {
        let counter = NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed) & COUNTER_MASK;
        Self(counter | ((kind as u64) << TAG_SHIFT))
    }

    /// Kind encoded in the id
    pub fn kind(&self) -> Option<ObjectKind> {
        ObjectKind::from_tag((self.0 >> TAG_SHIFT) as u8)
    }

    /// Raw id value
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Some(kind) => write!(f, "{:?}#{}", kind, self.0 & COUNTER_MASK),
            None => write!(f, "Object#{:#x}", self.0),
        }
    }
}

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident => $kind:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(ObjectId);

        impl $name {
            /// Allocate a fresh id
            pub fn next() -> Self {
                Self(ObjectId::new(ObjectKind::$kind))
            }

            /// Untyped id
            pub fn object(&self) -> ObjectId {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(&self.0, f)
            }
        }

        impl From<$name> for DriverObject {
            fn from(id: $name) -> Self {
                DriverObject::$kind(id)
            }
        }
    };
}

typed_id!(
    /// Execution context
    ContextId => Context
);
typed_id!(
    /// Command queue
    QueueId => Queue
);
typed_id!(
    /// Program object (one per context)
    ProgramId => Program
);
typed_id!(
    /// Kernel object (one per compiled program)
    KernelId => Kernel
);
typed_id!(
    /// Device memory object
    MemId => Memory
);

/// Any driver object, for release
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverObject {
    Context(ContextId),
    Queue(QueueId),
    Program(ProgramId),
    Kernel(KernelId),
    Memory(MemId),
}

impl DriverObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Context(_) => ObjectKind::Context,
            Self::Queue(_) => ObjectKind::Queue,
            Self::Program(_) => ObjectKind::Program,
            Self::Kernel(_) => ObjectKind::Kernel,
            Self::Memory(_) => ObjectKind::Memory,
        }
    }
}
