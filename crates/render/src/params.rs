//! Parameter resolution: match supplied values against a component's declared parameters.

use keel_core::model::{ComponentParameter, ParameterScalar, ParameterValue};
use keel_core::RenderError;
use rustc_hash::FxHashMap;

/// A supplied value bound to the field paths its declaration targets.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedParameter {
    pub name: String,
    pub value: ParameterScalar,
    pub field_paths: Vec<String>,
}

pub fn resolve_parameters(declared: &[ComponentParameter], supplied: &[ParameterValue]) -> Result<Vec<ResolvedParameter>, RenderError> {
    let index: FxHashMap<&str, &ComponentParameter> = declared.iter().map(|p| (p.name.as_str(), p)).collect();

    let mut out = Vec::with_capacity(supplied.len());
    for v in supplied {
        let decl = index.get(v.name.as_str()).ok_or_else(|| RenderError::UnsupportedParameter(v.name.clone()))?;
        out.push(ResolvedParameter { name: v.name.clone(), value: v.value.clone(), field_paths: decl.field_paths.clone() });
    }

    for p in declared.iter().filter(|p| p.required) {
        if !supplied.iter().any(|v| v.name == p.name) {
            return Err(RenderError::MissingRequiredParameter(p.name.clone()));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(name: &str, required: bool, paths: &[&str]) -> ComponentParameter {
        ComponentParameter { name: name.into(), field_paths: paths.iter().map(|s| s.to_string()).collect(), required, description: None }
    }

    fn val(name: &str, v: &str) -> ParameterValue {
        ParameterValue { name: name.into(), value: ParameterScalar::String(v.into()) }
    }

    #[test]
    fn supplied_and_declared_carry_field_paths() {
        let declared = vec![decl("image", true, &["spec.containers[0].image"]), decl("port", false, &["spec.port"])];
        let got = resolve_parameters(&declared, &[val("image", "nginx")]).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].field_paths, vec!["spec.containers[0].image".to_string()]);
    }

    #[test]
    fn unsupported_parameter_is_named() {
        let err = resolve_parameters(&[decl("image", false, &[])], &[val("tag", "x")]).unwrap_err();
        assert!(matches!(err, RenderError::UnsupportedParameter(ref n) if n == "tag"));
    }

    #[test]
    fn missing_required_parameter_is_named() {
        let err = resolve_parameters(&[decl("image", true, &[])], &[]).unwrap_err();
        assert!(matches!(err, RenderError::MissingRequiredParameter(ref n) if n == "image"));
    }

    #[test]
    fn optional_and_missing_is_omitted() {
        assert!(resolve_parameters(&[decl("image", false, &["spec.image"])], &[]).unwrap().is_empty());
    }
}
