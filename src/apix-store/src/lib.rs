mod kv;
mod resource;
pub mod scale;
mod selector;

pub use self::kv::*;
pub use self::resource::ResourceStore;
pub use self::selector::FieldSelector;
pub use self::selector::LabelSelector;
