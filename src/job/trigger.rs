//! Inbound webhook events and their validation.
//!
//! Validation collects every field error instead of stopping at the first,
//! so a caller sees the whole list in one 400 response.

use serde_json::{Map, Value};

use crate::error::FieldError;
use crate::job::{Job, RuntimeKind, WorkloadStep};
use crate::runtime::ResourceLimits;
use crate::sandbox::InputRef;

const MAX_SOURCE_LEN: usize = 128;
const MAX_KEY_LEN: usize = 256;

/// Per-job limit overrides, in the units callers write them in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LimitOverrides {
    pub wall_clock_secs: Option<u64>,
    pub memory_mb: Option<u64>,
    pub cpu_secs: Option<u64>,
}

impl LimitOverrides {
    /// Apply on top of `defaults`, never exceeding `max`.
    pub fn resolve(&self, defaults: &ResourceLimits, max: &ResourceLimits) -> ResourceLimits {
        let mut limits = defaults.clone();
        if let Some(secs) = self.wall_clock_secs {
            limits.wall_clock_ms = secs.saturating_mul(1000);
        }
        if let Some(mb) = self.memory_mb {
            limits.memory_bytes = Some(mb.saturating_mul(1024 * 1024));
        }
        if let Some(secs) = self.cpu_secs {
            limits.cpu_secs = Some(secs);
        }
        limits.clamp_to(max)
    }
}

/// A validated trigger event, ready to become a [`Job`].
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    pub source: String,
    pub idempotency_key: String,
    pub job_kind: RuntimeKind,
    pub input_ref: InputRef,
    pub steps: Vec<WorkloadStep>,
    pub limits: LimitOverrides,
    pub raw: Map<String, Value>,
}

impl TriggerEvent {
    /// Validate a raw JSON body.
    pub fn parse(body: &Value) -> Result<Self, Vec<FieldError>> {
        let Some(obj) = body.as_object() else {
            return Err(vec![FieldError::new(
                "body",
                "model_type",
                "request body must be a JSON object",
            )]);
        };

        let mut errors = Vec::new();

        let source = required_string(obj, "source", MAX_SOURCE_LEN, &mut errors);
        let idempotency_key = required_string(obj, "idempotency_key", MAX_KEY_LEN, &mut errors);

        let job_kind = required_string(obj, "job_kind", 32, &mut errors).and_then(|raw| {
            match raw.parse::<RuntimeKind>() {
                Ok(kind) => Some(kind),
                Err(_) => {
                    errors.push(FieldError::new(
                        "job_kind",
                        "enum",
                        "job_kind must be one of JVM, Node, Python, Mixed",
                    ));
                    None
                }
            }
        });

        let input_ref = required_string(obj, "input_ref", 1024, &mut errors).and_then(|raw| {
            match raw.parse::<InputRef>() {
                Ok(input) => Some(input),
                Err(msg) => {
                    errors.push(FieldError::new("input_ref", "string_pattern", msg));
                    None
                }
            }
        });

        let args = optional_string_array(obj, "args", &mut errors);
        let steps = parse_steps(obj, &mut errors);
        let limits = parse_limits(obj, &mut errors);

        if let Some(payload) = obj.get("payload") {
            if !payload.is_object() {
                errors.push(FieldError::new(
                    "payload",
                    "dict_type",
                    "payload must be an object",
                ));
            }
        }

        let steps = match (job_kind, steps) {
            (Some(RuntimeKind::Mixed), Some(steps)) if !steps.is_empty() => {
                if args.is_some() {
                    errors.push(FieldError::new(
                        "args",
                        "value_error",
                        "args is not allowed for Mixed jobs, set args per step",
                    ));
                }
                steps
            }
            (Some(RuntimeKind::Mixed), _) => {
                errors.push(FieldError::new(
                    "steps",
                    "missing",
                    "steps is required for Mixed jobs",
                ));
                Vec::new()
            }
            (Some(kind), None) => vec![WorkloadStep::new(kind, args.unwrap_or_default())],
            (Some(_), Some(_)) => {
                errors.push(FieldError::new(
                    "steps",
                    "value_error",
                    "steps is only allowed for Mixed jobs",
                ));
                Vec::new()
            }
            (None, _) => Vec::new(),
        };

        match (source, idempotency_key, job_kind, input_ref) {
            (Some(source), Some(idempotency_key), Some(job_kind), Some(input_ref))
                if errors.is_empty() =>
            {
                Ok(Self {
                    source,
                    idempotency_key,
                    job_kind,
                    input_ref,
                    steps,
                    limits,
                    raw: obj.clone(),
                })
            }
            _ => Err(errors),
        }
    }

    pub fn into_job(self, defaults: &ResourceLimits, max: &ResourceLimits) -> Job {
        let limits = self.limits.resolve(defaults, max);
        Job::new(
            self.source,
            self.idempotency_key,
            self.job_kind,
            self.input_ref.to_string(),
            self.steps,
            limits,
            self.raw,
        )
    }
}

fn required_string(
    obj: &Map<String, Value>,
    field: &str,
    max_len: usize,
    errors: &mut Vec<FieldError>,
) -> Option<String> {
    match obj.get(field) {
        None | Some(Value::Null) => {
            errors.push(FieldError::new(field, "missing", format!("{} is required", field)));
            None
        }
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                errors.push(FieldError::new(
                    field,
                    "string_too_short",
                    format!("{} cannot be empty", field),
                ));
                None
            } else if trimmed.len() > max_len {
                errors.push(FieldError::new(
                    field,
                    "string_too_long",
                    format!("{} exceeds maximum length", field),
                ));
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Some(_) => {
            errors.push(FieldError::new(
                field,
                "string_type",
                format!("{} must be a string", field),
            ));
            None
        }
    }
}

fn string_array(value: &Value) -> Option<Vec<String>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect()
}

fn optional_string_array(
    obj: &Map<String, Value>,
    field: &str,
    errors: &mut Vec<FieldError>,
) -> Option<Vec<String>> {
    let value = obj.get(field)?;
    match string_array(value) {
        Some(items) => Some(items),
        None => {
            errors.push(FieldError::new(
                field,
                "list_type",
                format!("{} must be a list of strings", field),
            ));
            None
        }
    }
}

fn parse_steps(obj: &Map<String, Value>, errors: &mut Vec<FieldError>) -> Option<Vec<WorkloadStep>> {
    let value = obj.get("steps")?;
    let Some(items) = value.as_array() else {
        errors.push(FieldError::new("steps", "list_type", "steps must be a list"));
        return None;
    };

    let mut steps = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let field = format!("steps[{}]", i);
        let runtime = item
            .get("runtime")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<RuntimeKind>().ok());
        match runtime {
            Some(RuntimeKind::Mixed) => errors.push(FieldError::new(
                &field,
                "value_error",
                "a step cannot itself be Mixed",
            )),
            Some(kind) => {
                let args = match item.get("args") {
                    None => Vec::new(),
                    Some(v) => match string_array(v) {
                        Some(args) => args,
                        None => {
                            errors.push(FieldError::new(
                                &field,
                                "list_type",
                                "step args must be a list of strings",
                            ));
                            Vec::new()
                        }
                    },
                };
                steps.push(WorkloadStep::new(kind, args));
            }
            None => errors.push(FieldError::new(
                &field,
                "enum",
                "step runtime must be one of JVM, Node, Python",
            )),
        }
    }
    Some(steps)
}

fn parse_limits(obj: &Map<String, Value>, errors: &mut Vec<FieldError>) -> LimitOverrides {
    let mut limits = LimitOverrides::default();
    let Some(value) = obj.get("limits") else {
        return limits;
    };
    let Some(map) = value.as_object() else {
        errors.push(FieldError::new("limits", "dict_type", "limits must be an object"));
        return limits;
    };

    let mut positive = |name: &str| -> Option<u64> {
        let v = map.get(name)?;
        match v.as_u64() {
            Some(n) if n > 0 => Some(n),
            Some(_) => {
                errors.push(FieldError::new(
                    name,
                    "greater_than",
                    format!("{} must be greater than 0", name),
                ));
                None
            }
            None => {
                errors.push(FieldError::new(
                    name,
                    "int_parsing",
                    format!("{} must be an integer", name),
                ));
                None
            }
        }
    };

    limits.wall_clock_secs = positive("wall_clock_secs");
    limits.memory_mb = positive("memory_mb");
    limits.cpu_secs = positive("cpu_secs");
    limits
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(errors: &[FieldError]) -> Vec<&str> {
        errors.iter().map(|e| e.field.as_str()).collect()
    }

    #[test]
    fn accepts_minimal_event() {
        let event = TriggerEvent::parse(&json!({
            "source": "ci",
            "idempotency_key": "abc",
            "job_kind": "Python",
            "input_ref": "gs://bucket/x"
        }))
        .unwrap();

        assert_eq!(event.source, "ci");
        assert_eq!(event.job_kind, RuntimeKind::Python);
        assert_eq!(event.input_ref.bucket, "bucket");
        assert_eq!(event.steps, vec![WorkloadStep::new(RuntimeKind::Python, vec![])]);
    }

    #[test]
    fn reports_every_missing_field() {
        let errors = TriggerEvent::parse(&json!({})).unwrap_err();
        assert_eq!(
            fields(&errors),
            vec!["source", "idempotency_key", "job_kind", "input_ref"]
        );
        assert!(errors.iter().all(|e| e.kind == "missing"));
    }

    #[test]
    fn rejects_non_object_body() {
        let errors = TriggerEvent::parse(&json!(["source"])).unwrap_err();
        assert_eq!(fields(&errors), vec!["body"]);
    }

    #[test]
    fn rejects_blank_strings_and_bad_kinds() {
        let errors = TriggerEvent::parse(&json!({
            "source": "   ",
            "idempotency_key": "k",
            "job_kind": "ruby",
            "input_ref": "http://bucket/x"
        }))
        .unwrap_err();
        assert_eq!(fields(&errors), vec!["source", "job_kind", "input_ref"]);
        assert_eq!(errors[0].kind, "string_too_short");
    }

    #[test]
    fn mixed_requires_steps() {
        let errors = TriggerEvent::parse(&json!({
            "source": "ci",
            "idempotency_key": "k",
            "job_kind": "Mixed",
            "input_ref": "gs://bucket"
        }))
        .unwrap_err();
        assert_eq!(fields(&errors), vec!["steps"]);
    }

    #[test]
    fn mixed_keeps_declared_step_order() {
        let event = TriggerEvent::parse(&json!({
            "source": "ci",
            "idempotency_key": "k",
            "job_kind": "Mixed",
            "input_ref": "gs://bucket/suite",
            "steps": [
                {"runtime": "Node", "args": ["build.js"]},
                {"runtime": "JVM"},
                {"runtime": "Python", "args": ["report.py", "--all"]}
            ]
        }))
        .unwrap();
        let kinds: Vec<RuntimeKind> = event.steps.iter().map(|s| s.runtime).collect();
        assert_eq!(
            kinds,
            vec![RuntimeKind::Node, RuntimeKind::Jvm, RuntimeKind::Python]
        );
        assert_eq!(event.steps[2].args, vec!["report.py", "--all"]);
    }

    #[test]
    fn steps_rejected_for_single_runtime_jobs() {
        let errors = TriggerEvent::parse(&json!({
            "source": "ci",
            "idempotency_key": "k",
            "job_kind": "Node",
            "input_ref": "gs://bucket",
            "steps": [{"runtime": "Node"}]
        }))
        .unwrap_err();
        assert_eq!(fields(&errors), vec!["steps"]);
    }

    #[test]
    fn limit_overrides_are_clamped() {
        let event = TriggerEvent::parse(&json!({
            "source": "ci",
            "idempotency_key": "k",
            "job_kind": "JVM",
            "input_ref": "gs://bucket",
            "limits": {"wall_clock_secs": 999999, "memory_mb": 512}
        }))
        .unwrap();

        let defaults = ResourceLimits::default();
        let max = ResourceLimits {
            wall_clock_ms: 60_000,
            memory_bytes: Some(1024 * 1024 * 1024),
            cpu_secs: None,
        };
        let job = event.into_job(&defaults, &max);
        assert_eq!(job.limits.wall_clock_ms, 60_000);
        assert_eq!(job.limits.memory_bytes, Some(512 * 1024 * 1024));
    }

    #[test]
    fn zero_limits_are_rejected() {
        let errors = TriggerEvent::parse(&json!({
            "source": "ci",
            "idempotency_key": "k",
            "job_kind": "JVM",
            "input_ref": "gs://bucket",
            "limits": {"wall_clock_secs": 0, "memory_mb": "lots"}
        }))
        .unwrap_err();
        assert_eq!(fields(&errors), vec!["wall_clock_secs", "memory_mb"]);
        assert_eq!(errors[0].kind, "greater_than");
        assert_eq!(errors[1].kind, "int_parsing");
    }

    #[test]
    fn raw_event_is_kept_on_the_job() {
        let body = json!({
            "source": "ci",
            "idempotency_key": "k",
            "job_kind": "Python",
            "input_ref": "gs://bucket",
            "payload": {"ticket": "QE-42"}
        });
        let job = TriggerEvent::parse(&body)
            .unwrap()
            .into_job(&ResourceLimits::default(), &ResourceLimits::default());
        assert_eq!(job.payload["payload"]["ticket"], "QE-42");
        assert_eq!(job.input_ref, "gs://bucket");
    }
}
