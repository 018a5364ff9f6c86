//! Attribute validation run before a job is enqueued

use crate::job::Job;
use serde_json::Value;

/// Outcome of validating a job: an ordered list of error messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    errors: Vec<String>,
}

impl ValidationReport {
    /// A report with no errors
    pub fn valid() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn push(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    pub fn extend(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
    }

    pub fn into_errors(self) -> Vec<String> {
        self.errors
    }
}

/// Validator capability
///
/// Closures `Fn(&Job) -> ValidationReport` are validators too.
pub trait Validator: Send + Sync {
    fn validate(&self, job: &Job) -> ValidationReport;
}

impl<F> Validator for F
where
    F: Fn(&Job) -> ValidationReport + Send + Sync,
{
    fn validate(&self, job: &Job) -> ValidationReport {
        self(job)
    }
}

/// Presence validation: each listed field must hold a non-blank value.
#[derive(Debug, Clone)]
pub struct RequiredFields {
    fields: Vec<String>,
}

impl RequiredFields {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        Some(Value::Bool(b)) => !b,
        Some(Value::Number(_)) => false,
    }
}

/// "user_name" -> "User name"
fn humanize(field: &str) -> String {
    let spaced = field.replace('_', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => spaced,
    }
}

impl Validator for RequiredFields {
    fn validate(&self, job: &Job) -> ValidationReport {
        let mut report = ValidationReport::valid();
        for field in &self.fields {
            if is_blank(job.get_raw(field)) {
                report.push(format!("{} can't be blank", humanize(field)));
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::JobSchema;
    use serde_json::json;
    use std::sync::Arc;

    fn schema() -> Arc<JobSchema> {
        Arc::new(
            JobSchema::builder("SimpleJob")
                .fields(["attr", "user_name"])
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_required_fields_reports_blank_values_in_order() {
        let job = Job::new(schema());
        let report = RequiredFields::new(["attr", "user_name"]).validate(&job);

        assert!(!report.is_valid());
        assert_eq!(
            report.errors(),
            &["Attr can't be blank".to_string(), "User name can't be blank".to_string()]
        );
    }

    #[test]
    fn test_required_fields_accepts_present_values() {
        let mut job = Job::new(schema());
        job.set("attr", "foo").unwrap();
        job.set("user_name", 0).unwrap();

        assert!(RequiredFields::new(["attr", "user_name"]).validate(&job).is_valid());
    }

    #[test]
    fn test_whitespace_and_empty_collections_are_blank() {
        assert!(is_blank(Some(&json!("   "))));
        assert!(is_blank(Some(&json!([]))));
        assert!(is_blank(Some(&json!({}))));
        assert!(!is_blank(Some(&json!(["x"]))));
        assert!(!is_blank(Some(&json!(0))));
    }

    #[test]
    fn test_closure_validator() {
        let validator = |job: &Job| {
            let mut report = ValidationReport::valid();
            if job.get::<String>("attr").ok().flatten().as_deref() == Some("forbidden") {
                report.push("Attr is reserved");
            }
            report
        };

        let mut job = Job::new(schema());
        assert!(validator.validate(&job).is_valid());

        job.set("attr", "forbidden").unwrap();
        assert_eq!(validator.validate(&job).into_errors(), vec!["Attr is reserved"]);
    }
}
