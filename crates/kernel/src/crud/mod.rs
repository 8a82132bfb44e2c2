//! Record mutations, validation, custom fields, calendar and audit.

pub mod audit;
pub mod calendar;
pub mod custom_fields;
pub mod payload;
pub mod service;
pub mod validation;
pub mod write;

pub use audit::AuditAction;
pub use calendar::{CalendarEvent, CalendarRequest, CalendarService};
pub use custom_fields::{
    CustomFieldDefinition, CustomFieldInput, CustomFieldService, CustomFieldType,
};
pub use payload::FormPayload;
pub use service::{CrudService, MutationResponse};
pub use validation::{PgUniqueChecker, Rule, UniqueChecker, ValidationErrors, Validator};
