//! WFS exception taxonomy.
//!
//! Every failure that reaches a client is one of these codes, rendered as an
//! OGC `ServiceExceptionReport` with HTTP status 200.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    UnknownService,
    InvalidRequest,
    InvalidService,
    VersionNegotiationFailed,
    MissingParameter,
    InvalidParameterValue,
    MalformedJsonQuery,
    NoGeometryField,
    NotImplemented,
    UnknownError,
}

impl ExceptionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExceptionCode::UnknownService => "UnknownService",
            ExceptionCode::InvalidRequest => "InvalidRequest",
            ExceptionCode::InvalidService => "InvalidService",
            ExceptionCode::VersionNegotiationFailed => "VersionNegotiationFailed",
            ExceptionCode::MissingParameter => "MissingParameter",
            ExceptionCode::InvalidParameterValue => "InvalidParameterValue",
            ExceptionCode::MalformedJsonQuery => "MalformedJSONQuery",
            ExceptionCode::NoGeometryField => "NoGeometryField",
            ExceptionCode::NotImplemented => "NotImplemented",
            ExceptionCode::UnknownError => "UnknownError",
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol-level failure: `{code, locator, text}`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code} [{locator}]: {text}")]
pub struct WfsException {
    pub code: ExceptionCode,
    pub locator: String,
    pub text: String,
}

impl WfsException {
    fn new(code: ExceptionCode, locator: impl Into<String>, text: String) -> Self {
        Self {
            code,
            locator: locator.into(),
            text,
        }
    }

    pub fn unknown_service(service_id: &str) -> Self {
        Self::new(
            ExceptionCode::UnknownService,
            "",
            format!("No available WFS service with id '{}'.", service_id),
        )
    }

    pub fn invalid_request(value: &str) -> Self {
        Self::new(
            ExceptionCode::InvalidRequest,
            "request",
            format!("'{}' is an invalid request.", value),
        )
    }

    pub fn invalid_service(value: &str) -> Self {
        Self::new(
            ExceptionCode::InvalidService,
            "service",
            format!("'{}' is an invalid service.", value),
        )
    }

    pub fn version_negotiation_failed(value: &str) -> Self {
        Self::new(
            ExceptionCode::VersionNegotiationFailed,
            "version",
            format!("'{}' is an invalid version number.", value),
        )
    }

    pub fn missing_parameter(locator: &str) -> Self {
        Self::new(
            ExceptionCode::MissingParameter,
            locator,
            format!("Missing required '{}' parameter.", locator),
        )
    }

    pub fn invalid_parameter_value(locator: &str, value: &str) -> Self {
        Self::new(
            ExceptionCode::InvalidParameterValue,
            locator,
            format!("Invalid value '{}' in parameter '{}'.", value, locator),
        )
    }

    pub fn malformed_json_query() -> Self {
        Self::new(
            ExceptionCode::MalformedJsonQuery,
            "query",
            "The JSON query defined for this feature type is malformed.".to_string(),
        )
    }

    pub fn no_geometry_field() -> Self {
        Self::new(
            ExceptionCode::NoGeometryField,
            "feature",
            "The feature does not reference at least one geometry field.".to_string(),
        )
    }

    pub fn not_implemented_parameter(locator: &str) -> Self {
        Self::new(
            ExceptionCode::NotImplemented,
            locator,
            format!("The parameter '{}' is not implemented.", locator),
        )
    }

    /// GML rendering of raw-SQL feature types.
    pub fn not_implemented_output_format(typename: &str) -> Self {
        Self::new(
            ExceptionCode::NotImplemented,
            "outputformat",
            format!(
                "XML output is not implemented for the SQL feature type '{}'.",
                typename
            ),
        )
    }

    pub fn unknown_error() -> Self {
        Self::new(
            ExceptionCode::UnknownError,
            "",
            "Something went wrong.".to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texts_follow_protocol_wording() {
        let e = WfsException::invalid_parameter_value("bbox", "1,2");
        assert_eq!(e.code, ExceptionCode::InvalidParameterValue);
        assert_eq!(e.locator, "bbox");
        assert_eq!(e.text, "Invalid value '1,2' in parameter 'bbox'.");

        let e = WfsException::missing_parameter("typename");
        assert_eq!(e.text, "Missing required 'typename' parameter.");
        assert_eq!(ExceptionCode::MalformedJsonQuery.as_str(), "MalformedJSONQuery");
    }
}
