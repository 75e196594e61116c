use identity_kernel_core::{IdentifyRequest, MISSING_IDENTIFIERS_MESSAGE};

use crate::ApiError;

const MAX_EMAIL_LEN: usize = 254;
const MIN_PHONE_DIGITS: usize = 10;
const MAX_PHONE_DIGITS: usize = 15;

/// Normalize and validate an inbound identify request.
///
/// Empty strings count as absent. The returned request carries only the
/// identifiers that passed validation.
///
/// # Errors
/// Returns [`ApiError::InvalidInput`] when neither identifier is present and
/// [`ApiError::Validation`] when a present identifier is malformed.
pub fn identify_request(request: &IdentifyRequest) -> Result<IdentifyRequest, ApiError> {
    let email = non_empty(request.email.as_deref());
    let phone_number = non_empty(request.phone_number.as_deref());

    if email.is_none() && phone_number.is_none() {
        return Err(ApiError::InvalidInput(MISSING_IDENTIFIERS_MESSAGE.to_string()));
    }
    if let Some(email) = email {
        self::email(email)?;
    }
    if let Some(phone_number) = phone_number {
        self::phone_number(phone_number)?;
    }

    Ok(IdentifyRequest::new(email, phone_number))
}

/// # Errors
/// Returns [`ApiError::Validation`] when `value` is not a plausible address.
pub fn email(value: &str) -> Result<(), ApiError> {
    let invalid = |message: &str| ApiError::Validation {
        field: "email",
        message: message.to_string(),
    };

    if value.len() > MAX_EMAIL_LEN {
        return Err(invalid("must be at most 254 characters"));
    }
    if value.chars().any(char::is_whitespace) {
        return Err(invalid("must not contain whitespace"));
    }
    let Some((local, domain)) = value.split_once('@') else {
        return Err(invalid("must contain '@'"));
    };
    if domain.contains('@') {
        return Err(invalid("must contain exactly one '@'"));
    }
    if local.is_empty() {
        return Err(invalid("local part must not be empty"));
    }
    if !domain.contains('.') || domain.split('.').any(str::is_empty) {
        return Err(invalid("domain must contain a dot-separated name"));
    }
    Ok(())
}

/// # Errors
/// Returns [`ApiError::Validation`] unless `value` is 10-15 ASCII digits.
pub fn phone_number(value: &str) -> Result<(), ApiError> {
    if !value.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(ApiError::Validation {
            field: "phoneNumber",
            message: "must contain digits only".to_string(),
        });
    }
    if !(MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&value.len()) {
        return Err(ApiError::Validation {
            field: "phoneNumber",
            message: format!("must be {MIN_PHONE_DIGITS}-{MAX_PHONE_DIGITS} digits long"),
        });
    }
    Ok(())
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.is_empty())
}
