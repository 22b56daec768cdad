//! The `template` driver: render a template file with typed variables,
//! then converge like a file.

use std::fs;

use anyhow::Context;

use crate::drivers::file;
use crate::fsutil;
use crate::types::{ApplyResult, DriverError, FileAction, TemplateSpec, TemplateVar, ValueTag};

pub fn apply(spec: &TemplateSpec, action: FileAction) -> Result<ApplyResult, DriverError> {
    match action {
        FileAction::Create => create(spec, false),
        FileAction::CreateIfMissing => create(spec, true),
        FileAction::Delete => file::delete(&spec.path, FileAction::Delete),
        FileAction::Touch => Err(DriverError::UnknownAction {
            kind: "template",
            action: "touch".to_string(),
        }),
    }
}

fn create(spec: &TemplateSpec, only_if_missing: bool) -> Result<ApplyResult, DriverError> {
    let action = if only_if_missing {
        FileAction::CreateIfMissing
    } else {
        FileAction::Create
    };
    if only_if_missing && spec.path.exists() {
        return Ok(ApplyResult::up_to_date(action.as_str()));
    }

    let rendered = render(spec)?;

    let mut changed = false;
    let desired_mode = fsutil::parse_mode(&spec.mode)?;
    let diverged = match fs::read(&spec.path) {
        Ok(current) => current != rendered.as_bytes(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => true,
        Err(err) => {
            return Err(DriverError::Other(anyhow::Error::new(err).context(format!(
                "failed to read {}",
                spec.path.display()
            ))));
        }
    };

    if diverged {
        fsutil::atomic_write(&spec.path, rendered.as_bytes(), desired_mode, 0)?;
        changed = true;
    } else {
        changed |= fsutil::apply_mode(&spec.path, desired_mode)?;
    }
    changed |= fsutil::apply_ownership(
        &spec.path,
        spec.owner.as_deref(),
        spec.group.as_deref(),
    )?;

    if changed {
        Ok(ApplyResult::updated(action.as_str()))
    } else {
        Ok(ApplyResult::up_to_date(action.as_str()))
    }
}

fn render(spec: &TemplateSpec) -> Result<String, DriverError> {
    let template = match fs::read_to_string(&spec.source) {
        Ok(template) => template,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(DriverError::NotFound(format!(
                "template source {}",
                spec.source.display()
            )));
        }
        Err(err) => {
            return Err(DriverError::Other(anyhow::Error::new(err).context(format!(
                "failed to read template {}",
                spec.source.display()
            ))));
        }
    };

    let mut context = tera::Context::new();
    for var in &spec.variables {
        context.insert(var.name.as_str(), &revive(var)?);
    }

    tera::Tera::one_off(&template, &context, false).map_err(|err| {
        DriverError::Other(anyhow::anyhow!(
            "failed to render {}: {err}",
            spec.source.display()
        ))
    })
}

/// Convert a wire literal back into the value its type tag declares.
fn revive(var: &TemplateVar) -> Result<serde_json::Value, DriverError> {
    use serde_json::Value;

    let value = match var.tag {
        ValueTag::String => Value::String(var.literal.clone()),
        ValueTag::Integer => {
            let n: i64 = var.literal.trim().parse().with_context(|| {
                format!("variable {} is not an integer: {:?}", var.name, var.literal)
            })?;
            Value::from(n)
        }
        ValueTag::Float => {
            let f: f64 = var.literal.trim().parse().with_context(|| {
                format!("variable {} is not a float: {:?}", var.name, var.literal)
            })?;
            Value::from(f)
        }
        ValueTag::Boolean => Value::Bool(var.literal.trim() == "true"),
        ValueTag::Nil => Value::Null,
        // Array literals are JSON-encoded on the wire.
        ValueTag::Array => serde_json::from_str(&var.literal).with_context(|| {
            format!("variable {} is not a JSON array: {:?}", var.name, var.literal)
        })?,
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn spec(dir: &std::path::Path, template: &str, variables: Vec<TemplateVar>) -> TemplateSpec {
        let source = dir.join("config.tera");
        fs::write(&source, template).expect("write template");
        TemplateSpec {
            path: dir.join("config"),
            source,
            mode: String::new(),
            owner: None,
            group: None,
            variables,
            action: FileAction::Create,
        }
    }

    fn var(name: &str, literal: &str, tag: ValueTag) -> TemplateVar {
        TemplateVar {
            name: name.to_string(),
            literal: literal.to_string(),
            tag,
        }
    }

    #[test]
    fn renders_typed_variables() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = spec(
            dir.path(),
            "port={{ port }} debug={{ debug }} ratio={{ ratio }} name={{ name }}\n\
             {% for h in hosts %}host={{ h }}\n{% endfor %}",
            vec![
                var("port", "8080", ValueTag::Integer),
                var("debug", "false", ValueTag::Boolean),
                var("ratio", "0.5", ValueTag::Float),
                var("name", "api", ValueTag::String),
                var("hosts", "[\"a\",\"b\"]", ValueTag::Array),
            ],
        );

        let result = apply(&spec, FileAction::Create).expect("apply");
        assert!(result.was_updated);

        let rendered = fs::read_to_string(&spec.path).expect("read");
        assert!(rendered.contains("port=8080"));
        assert!(rendered.contains("debug=false"));
        assert!(rendered.contains("ratio=0.5"));
        assert!(rendered.contains("name=api"));
        assert!(rendered.contains("host=a"));
        assert!(rendered.contains("host=b"));
    }

    #[test]
    fn second_apply_is_quiet() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = spec(
            dir.path(),
            "value={{ v }}",
            vec![var("v", "1", ValueTag::Integer)],
        );

        assert!(apply(&spec, FileAction::Create).expect("apply").was_updated);
        assert!(!apply(&spec, FileAction::Create).expect("apply").was_updated);
    }

    #[test]
    fn changed_variable_rewrites() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut spec = spec(
            dir.path(),
            "value={{ v }}",
            vec![var("v", "1", ValueTag::Integer)],
        );
        apply(&spec, FileAction::Create).expect("apply");

        spec.variables = vec![var("v", "2", ValueTag::Integer)];
        assert!(apply(&spec, FileAction::Create).expect("apply").was_updated);
        assert_eq!(fs::read_to_string(&spec.path).expect("read"), "value=2");
    }

    #[test]
    fn missing_source_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = TemplateSpec {
            path: dir.path().join("out"),
            source: PathBuf::from(dir.path().join("absent.tera")),
            mode: String::new(),
            owner: None,
            group: None,
            variables: Vec::new(),
            action: FileAction::Create,
        };
        assert!(matches!(
            apply(&spec, FileAction::Create),
            Err(DriverError::NotFound(_))
        ));
    }

    #[test]
    fn bad_integer_literal_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = spec(
            dir.path(),
            "{{ v }}",
            vec![var("v", "not-a-number", ValueTag::Integer)],
        );
        assert!(apply(&spec, FileAction::Create).is_err());
    }

    #[test]
    fn nil_variables_are_falsy_in_conditionals() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = spec(
            dir.path(),
            "{% if v %}set{% else %}unset{% endif %}",
            vec![var("v", "", ValueTag::Nil)],
        );
        apply(&spec, FileAction::Create).expect("apply");
        assert_eq!(fs::read_to_string(&spec.path).expect("read"), "unset");
    }
}
