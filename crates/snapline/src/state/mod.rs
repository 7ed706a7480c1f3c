//! Packed state blocks: per-type offset tables, typed field handles and
//! views that read and write those fields straight out of pool memory.

mod layout;
mod registry;
mod value;
mod view;

pub use layout::{Field, FieldDecl, FieldEntry, OffsetTable, OffsetTableBuilder};
pub use registry::{Networked, RegisteredType, TypeId, TypeRegistry, TypeRegistryBuilder};
pub use value::{FieldKind, FieldValue};
pub use view::{StateView, StateViewMut};
