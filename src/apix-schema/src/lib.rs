mod defaulting;
mod format;
pub mod metaschema;
mod path;
mod pruning;
mod structural;
mod validation;

pub use self::defaulting::apply_defaults;
pub use self::path::FieldPath;
pub use self::pruning::prune;
pub use self::structural::*;
pub use self::validation::*;
