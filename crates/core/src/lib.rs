pub mod error;
pub mod field_value;
pub mod hlc;
pub mod ids;
pub mod mutation;
pub mod row;
pub mod schema;

pub use error::CoreError;
pub use field_value::FieldValue;
pub use hlc::Hlc;
pub use ids::*;
pub use mutation::{Mutation, MutationKind, MutationPayload};
pub use row::{ORDER_FIELD, Row};
pub use schema::{EntityKind, OnDelete, OrderScope, Placement, Relationship};
