use crate::model::{FieldViolation, TelemetryReport};

/// Checks the minimum shape needed to resolve a device: a non-empty
/// identifier and both coordinates present. Zero is a valid coordinate.
pub fn validate(report: &TelemetryReport) -> Result<(), Vec<FieldViolation>> {
    let mut violations = Vec::new();

    if report.identifier.is_empty() {
        violations.push(FieldViolation {
            field: "identificador",
            message: "identifier is required",
        });
    }

    if report.latitude.is_none() {
        violations.push(FieldViolation {
            field: "latitud",
            message: "latitude is required",
        });
    }

    if report.longitude.is_none() {
        violations.push(FieldViolation {
            field: "longitud",
            message: "longitude is required",
        });
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

/// Renders violations as `field: message` pairs joined by `", "`.
pub fn describe(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(|v| format!("{}: {}", v.field, v.message))
        .collect::<Vec<_>>()
        .join(", ")
}
