//! Request payload parsing and field validation.
//!
//! Handlers accept either JSON objects or urlencoded forms. [`Payload`]
//! normalizes both into a JSON object, and [`FormReader`] pulls typed fields
//! out of it while collecting every field error before the handler responds.
use axum::{
    body::Bytes,
    extract::{FromRequest, Request},
    http::header::CONTENT_TYPE,
};
use chrono_tz::Tz;
use regex::Regex;
use serde_json::{Map, Value};

use crate::api::error::{ApiError, FieldErrors, NON_FIELD_ERRORS};

pub const REQUIRED: &str = "This field is required.";
pub const NULL: &str = "This field may not be null.";
pub const NOT_A_STRING: &str = "Not a valid string.";
pub const BLANK: &str = "This field may not be blank.";
pub const INVALID_EMAIL: &str = "Enter a valid email address.";

const EMAIL_MAX_LENGTH: usize = 254;

/// Request body as a JSON object, whatever the wire format was.
#[derive(Debug, Default)]
pub struct Payload(pub Map<String, Value>);

impl<S> FromRequest<S> for Payload
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|err| ApiError::Parse(err.body_text()))?;
        parse_payload(content_type.as_deref(), &bytes)
    }
}

/// Media type without parameters, lowercased.
fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn parse_payload(content_type: Option<&str>, bytes: &[u8]) -> Result<Payload, ApiError> {
    let Some(content_type) = content_type else {
        if bytes.is_empty() {
            return Ok(Payload::default());
        }
        return Err(ApiError::UnsupportedMediaType(String::new()));
    };

    match media_type(content_type).as_str() {
        "application/json" => {
            if bytes.iter().all(u8::is_ascii_whitespace) {
                return Ok(Payload::default());
            }
            let value: Value =
                serde_json::from_slice(bytes).map_err(|err| ApiError::Parse(err.to_string()))?;
            match value {
                Value::Object(map) => Ok(Payload(map)),
                other => Err(ApiError::non_field(format!(
                    "Invalid data. Expected a dictionary, but got {}.",
                    kind_name(&other)
                ))),
            }
        }
        "application/x-www-form-urlencoded" => {
            // Repeated keys keep the last value.
            let map = url::form_urlencoded::parse(bytes)
                .map(|(key, value)| (key.into_owned(), Value::String(value.into_owned())))
                .collect();
            Ok(Payload(map))
        }
        _ => Err(ApiError::UnsupportedMediaType(content_type.to_string())),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "NoneType",
        Value::Bool(_) => "bool",
        Value::Number(number) if number.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

/// Shape of a character field.
#[derive(Clone, Copy, Debug)]
pub struct CharField {
    required: bool,
    allow_blank: bool,
    trim: bool,
    max_length: Option<usize>,
}

impl CharField {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            required: true,
            allow_blank: false,
            trim: true,
            max_length: None,
        }
    }

    /// Passwords keep surrounding whitespace.
    #[must_use]
    pub const fn password() -> Self {
        Self {
            required: true,
            allow_blank: false,
            trim: false,
            max_length: None,
        }
    }

    #[must_use]
    pub const fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Blank input yields `Some("")` instead of an error.
    #[must_use]
    pub const fn allow_blank(mut self) -> Self {
        self.allow_blank = true;
        self
    }

    #[must_use]
    pub const fn max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }
}

impl Default for CharField {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads fields from a [`Payload`], accumulating errors per field.
pub struct FormReader<'a> {
    data: &'a Map<String, Value>,
    errors: FieldErrors,
}

impl<'a> FormReader<'a> {
    #[must_use]
    pub fn new(payload: &'a Payload) -> Self {
        Self {
            data: &payload.0,
            errors: FieldErrors::new(),
        }
    }

    pub fn add_error(&mut self, field: &str, message: impl Into<String>) {
        self.errors
            .entry(field.to_string())
            .or_default()
            .push(message.into());
    }

    pub fn add_non_field_error(&mut self, message: impl Into<String>) {
        self.add_error(NON_FIELD_ERRORS, message);
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// `Some` only when the field is present and valid.
    pub fn char(&mut self, name: &str, field: CharField) -> Option<String> {
        let raw = match self.data.get(name) {
            None => {
                if field.required {
                    self.add_error(name, REQUIRED);
                }
                return None;
            }
            Some(Value::Null) => {
                self.add_error(name, NULL);
                return None;
            }
            Some(Value::String(value)) => value.clone(),
            Some(Value::Number(value)) => value.to_string(),
            Some(_) => {
                self.add_error(name, NOT_A_STRING);
                return None;
            }
        };

        let value = if field.trim {
            raw.trim().to_string()
        } else {
            raw
        };
        if value.is_empty() {
            if field.allow_blank {
                return Some(value);
            }
            self.add_error(name, BLANK);
            return None;
        }
        if let Some(max) = field.max_length {
            if value.chars().count() > max {
                self.add_error(
                    name,
                    format!("Ensure this field has no more than {max} characters."),
                );
                return None;
            }
        }
        Some(value)
    }

    pub fn password(&mut self, name: &str) -> Option<String> {
        self.char(name, CharField::password())
    }

    /// Trimmed, syntactically valid e-mail address. Not lowercased.
    pub fn email(&mut self, name: &str, field: CharField) -> Option<String> {
        let value = self.char(name, field.max_length(EMAIL_MAX_LENGTH))?;
        if value.is_empty() || valid_email(&value) {
            Some(value)
        } else {
            self.add_error(name, INVALID_EMAIL);
            None
        }
    }

    /// IANA timezone name.
    pub fn timezone(&mut self, name: &str, field: CharField) -> Option<String> {
        let value = self.char(name, field)?;
        match value.parse::<Tz>() {
            Ok(tz) => Some(tz.name().to_string()),
            Err(_) => {
                self.add_error(name, format!("\"{value}\" is not a valid choice."));
                None
            }
        }
    }

    /// Ok when no field failed.
    /// # Errors
    /// Returns every collected field error as [`ApiError::Validation`].
    pub fn finish(self) -> Result<(), ApiError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ApiError::Validation(self.errors))
        }
    }
}

/// E-mail syntax check: dot-atom local part, at least two domain labels,
/// or a bracketed IP literal.
pub fn valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.rsplit_once('@') else {
        return false;
    };
    let local_ok = Regex::new(r"(?i)^[-!#$%&'*+/=?^_`{}|~0-9A-Z]+(\.[-!#$%&'*+/=?^_`{}|~0-9A-Z]+)*$")
        .is_ok_and(|re| re.is_match(local));
    if !local_ok {
        return false;
    }
    if domain.starts_with('[') && domain.ends_with(']') {
        return domain[1..domain.len() - 1]
            .parse::<std::net::IpAddr>()
            .is_ok();
    }
    let domain_ok =
        Regex::new(r"(?i)^(?:[A-Z0-9](?:[A-Z0-9-]{0,61}[A-Z0-9])?\.)+[A-Z0-9-]{2,63}$")
            .is_ok_and(|re| re.is_match(domain));
    domain_ok && !domain.ends_with('-')
}
