pub mod guard;
pub mod path;

pub use guard::{EntryKind, EntryMeta, FileAccessGuard, OpenedFile};
pub use path::{PathResolver, is_within};
