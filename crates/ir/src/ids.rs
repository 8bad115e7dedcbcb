//! Lightweight identifiers for the entities that make up the IR.
//!
//! Values and blocks are owned by the function that defines them, and buffers
//! by the module's allocation table. Everything else refers to them through
//! these index-based handles rather than through shared pointers.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

macro_rules! make_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u32);

        impl $name {
            /// Creates the identifier with the provided raw `index`.
            #[must_use]
            pub const fn new(index: u32) -> Self {
                Self(index)
            }

            /// Gets the raw index of the identifier.
            #[must_use]
            pub const fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl From<usize> for $name {
            #[allow(clippy::cast_possible_truncation)] // Tables never approach u32::MAX
            fn from(value: usize) -> Self {
                Self(value as u32)
            }
        }

        impl From<$name> for usize {
            fn from(value: $name) -> Self {
                value.index()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}{}", $prefix, self.0)
            }
        }
    };
}

make_id!(
    /// Identifies an SSA value within the value table of its function.
    ValueId,
    "%"
);

make_id!(
    /// Identifies a block within its function.
    ///
    /// Block identifiers are unique across the whole function, including the
    /// blocks of nested regions.
    BlockId,
    "^bb"
);

make_id!(
    /// Identifies a buffer in the module's allocation table.
    BufferId,
    "#"
);

make_id!(
    /// Identifies an otherwise unknown quantity introduced where differing
    /// affine offsets meet at a control-flow merge point.
    SymbolId,
    "s"
);

#[cfg(test)]
mod test {
    use crate::ids::{BufferId, ValueId};

    #[test]
    fn ids_render_with_their_prefix() {
        assert_eq!(ValueId::new(3).to_string(), "%3");
        assert_eq!(BufferId::from(1usize).to_string(), "#1");
    }

    #[test]
    fn ids_serialize_transparently() -> anyhow::Result<()> {
        let encoded = serde_json::to_string(&ValueId::new(7))?;
        assert_eq!(encoded, "7");
        assert_eq!(serde_json::from_str::<ValueId>(&encoded)?, ValueId::new(7));

        Ok(())
    }
}
