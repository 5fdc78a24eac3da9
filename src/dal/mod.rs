pub mod collection;
pub mod model;
pub mod record;

pub use collection::{Collection, Field, FieldType};
pub use model::Model;
pub use record::{Record, RecordSet};
