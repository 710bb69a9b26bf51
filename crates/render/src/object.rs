//! Object rendering: substitute resolved parameters into a raw payload.

use keel_core::model::ParameterScalar;
use keel_core::{Document, PathError, RenderError};
use serde_json::Value as Json;

use crate::params::ResolvedParameter;

pub fn render_object(raw: &Json, params: &[ResolvedParameter]) -> Result<Document, RenderError> {
    let mut doc = Document::from_json(raw.clone()).map_err(RenderError::InvalidPayload)?;
    for p in params {
        for path in &p.field_paths {
            let res: Result<(), PathError> = match &p.value {
                ParameterScalar::String(s) => doc.set_string(path, s),
                ParameterScalar::Number(n) => doc.set_number(path, n.clone()),
            };
            res.map_err(|source| RenderError::SetParameterFailed { name: p.name.clone(), source })?;
        }
    }
    Ok(doc)
}

/// Traits render without parameter substitution.
pub fn render_trait(raw: &Json) -> Result<Document, RenderError> { render_object(raw, &[]) }
