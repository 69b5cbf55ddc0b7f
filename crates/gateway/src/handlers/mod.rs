//! API handlers module

pub mod health;
pub mod items;
pub mod maintenance;
pub mod search;
pub mod settings;

use kgrag_common::errors::{AppError, Result};
use validator::Validate;

/// Run derive-based validation, reporting the first offending field.
pub(crate) fn validate_request<T: Validate>(request: &T) -> Result<()> {
    request.validate().map_err(|e| {
        let field = e.field_errors().keys().next().map(|k| k.to_string());
        AppError::Validation {
            message: e.to_string(),
            field,
        }
    })
}
