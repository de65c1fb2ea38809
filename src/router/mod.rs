//! Router-side grouping: window collection, clustering, staging decisions,
//! and group dispatch.

pub mod collection;
pub mod cost;
pub mod dispatcher;
pub mod grouping;
pub mod schema;

pub use collection::{CollectionManager, PlanCollection};
pub use cost::{HardwareConfig, LoadProfile};
pub use dispatcher::Grouper;
pub use grouping::GroupingConfig;
pub use schema::ColumnSizes;
