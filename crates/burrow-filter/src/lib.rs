mod path;
mod pattern;
mod projection;

pub use path::FieldPath;
pub use pattern::{FilterPattern, FilterSet, InvalidFilterSyntax};
pub use projection::project_request;
