//! Argument validation and normalisation shared by the tool handlers.
//!
//! Every helper reports failures as `VALIDATION_ERROR` with the offending
//! field name in the error context.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::errors::AppError;

pub const MAX_TEXT_CHARS: usize = 2_048;
pub const MAX_RADIUS_METERS: u32 = 50_000;
pub const MAX_MATRIX_SIDE: usize = 25;
pub const MAX_WAYPOINTS: usize = 25;
pub const MAX_ELEVATION_LOCATIONS: usize = 512;
pub const TRAVEL_MODES: [&str; 4] = ["driving", "walking", "bicycling", "transit"];
pub const AVOID_FEATURES: [&str; 4] = ["tolls", "highways", "ferries", "indoor"];
pub const UNIT_SYSTEMS: [&str; 2] = ["metric", "imperial"];

fn coordinate_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*([-+]?\d{1,3}(?:\.\d+)?)\s*,\s*([-+]?\d{1,3}(?:\.\d+)?)\s*$")
            .expect("valid coordinate regex")
    })
}

fn language_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z]{2,3}(?:-[A-Za-z0-9]{2,8})*$").expect("valid language regex")
    })
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_/.]*$").expect("valid identifier regex"))
}

fn mac_address_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[0-9A-Fa-f]{2}(?:[:-][0-9A-Fa-f]{2}){5}$").expect("valid mac regex")
    })
}

fn html_tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<[^>]*>").expect("valid html tag regex"))
}

fn whitespace_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\s+").expect("valid whitespace regex"))
}

/// Trims `value` and rejects blank or oversized text.
pub fn required_text(field: &str, value: &str) -> Result<String, AppError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::invalid_field(
            field,
            format!("{field} must not be empty"),
        ));
    }
    if trimmed.chars().count() > MAX_TEXT_CHARS {
        return Err(AppError::invalid_field(
            field,
            format!("{field} must be at most {MAX_TEXT_CHARS} characters"),
        ));
    }
    Ok(trimmed.to_string())
}

/// Like [`required_text`], but blank input counts as absent.
pub fn optional_text(field: &str, value: Option<String>) -> Result<Option<String>, AppError> {
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => required_text(field, text).map(Some),
    }
}

pub fn validate_latitude(field: &str, latitude: f64) -> Result<f64, AppError> {
    if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
        return Err(AppError::invalid_field(
            field,
            format!("{field} must be between -90 and 90"),
        ));
    }
    Ok(latitude)
}

pub fn validate_longitude(field: &str, longitude: f64) -> Result<f64, AppError> {
    if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
        return Err(AppError::invalid_field(
            field,
            format!("{field} must be between -180 and 180"),
        ));
    }
    Ok(longitude)
}

pub fn format_lat_lng(latitude: f64, longitude: f64) -> String {
    format!("{latitude},{longitude}")
}

/// Parses `"lat,lng"` and returns it in canonical form.
pub fn normalize_coordinates(field: &str, value: &str) -> Result<String, AppError> {
    let captures = coordinate_pattern().captures(value).ok_or_else(|| {
        AppError::invalid_field(field, format!("{field} must be formatted as \"lat,lng\""))
    })?;

    let parse = |index: usize| {
        captures
            .get(index)
            .and_then(|digits| digits.as_str().parse::<f64>().ok())
            .ok_or_else(|| AppError::invalid_field(field, format!("{field} is not numeric")))
    };
    let latitude = validate_latitude(field, parse(1)?)?;
    let longitude = validate_longitude(field, parse(2)?)?;

    Ok(format_lat_lng(latitude, longitude))
}

pub fn is_coordinate_pair(value: &str) -> bool {
    coordinate_pattern().is_match(value)
}

/// Accepts either an address or a `"lat,lng"` pair. Coordinates are
/// range-checked, addresses are only trimmed.
pub fn normalize_place_reference(field: &str, value: &str) -> Result<String, AppError> {
    if is_coordinate_pair(value) {
        return normalize_coordinates(field, value);
    }
    let text = required_text(field, value)?;
    if text.contains('|') {
        return Err(AppError::invalid_field(
            field,
            format!("{field} must not contain '|'"),
        ));
    }
    Ok(text)
}

/// Normalises every entry and joins them with `|`, the upstream list separator.
pub fn join_place_references(
    field: &str,
    values: &[String],
    max: usize,
) -> Result<String, AppError> {
    check_list_len(field, values.len(), max)?;
    let normalized = values
        .iter()
        .map(|value| normalize_place_reference(field, value))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(normalized.join("|"))
}

pub fn join_coordinates(field: &str, values: &[String], max: usize) -> Result<String, AppError> {
    check_list_len(field, values.len(), max)?;
    let normalized = values
        .iter()
        .map(|value| normalize_coordinates(field, value))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(normalized.join("|"))
}

fn check_list_len(field: &str, len: usize, max: usize) -> Result<(), AppError> {
    if len == 0 {
        return Err(AppError::invalid_field(
            field,
            format!("{field} must contain at least one entry"),
        ));
    }
    if len > max {
        return Err(AppError::invalid_field(
            field,
            format!("{field} must contain at most {max} entries"),
        ));
    }
    Ok(())
}

pub fn normalize_radius(radius: Option<u32>) -> Result<Option<u32>, AppError> {
    match radius {
        None => Ok(None),
        Some(meters) if (1..=MAX_RADIUS_METERS).contains(&meters) => Ok(Some(meters)),
        Some(_) => Err(AppError::invalid_field(
            "radius",
            format!("radius must be between 1 and {MAX_RADIUS_METERS} meters"),
        )),
    }
}

fn one_of(
    field: &str,
    value: Option<String>,
    allowed: &[&'static str],
) -> Result<Option<&'static str>, AppError> {
    let Some(value) = value else {
        return Ok(None);
    };

    let normalized = value.trim().to_ascii_lowercase();
    allowed
        .iter()
        .copied()
        .find(|candidate| *candidate == normalized)
        .map(Some)
        .ok_or_else(|| {
            AppError::invalid_field(
                field,
                format!("{field} must be one of: {}", allowed.join(", ")),
            )
        })
}

pub fn normalize_travel_mode(mode: Option<String>) -> Result<Option<&'static str>, AppError> {
    one_of("mode", mode, &TRAVEL_MODES)
}

pub fn normalize_units(units: Option<String>) -> Result<Option<&'static str>, AppError> {
    one_of("units", units, &UNIT_SYSTEMS)
}

/// Returns the features joined with `|`, deduplicated in request order.
pub fn normalize_avoid(avoid: Option<Vec<String>>) -> Result<Option<String>, AppError> {
    let Some(features) = avoid.filter(|features| !features.is_empty()) else {
        return Ok(None);
    };

    let mut selected: Vec<&'static str> = Vec::new();
    for feature in features {
        if let Some(feature) = one_of("avoid", Some(feature), &AVOID_FEATURES)? {
            if !selected.contains(&feature) {
                selected.push(feature);
            }
        }
    }
    Ok(Some(selected.join("|")))
}

/// Accepts `now`, unix seconds, or an RFC 3339 timestamp; returns the
/// upstream form (`now` or unix seconds).
pub fn normalize_departure_time(value: Option<String>) -> Result<Option<String>, AppError> {
    let Some(value) = value.map(|value| value.trim().to_string()) else {
        return Ok(None);
    };

    if value.eq_ignore_ascii_case("now") {
        return Ok(Some("now".to_string()));
    }
    if let Ok(seconds) = value.parse::<i64>() {
        if seconds < 0 {
            return Err(AppError::invalid_field(
                "departure_time",
                "departure_time must not be negative",
            ));
        }
        return Ok(Some(seconds.to_string()));
    }

    DateTime::parse_from_rfc3339(&value)
        .map(|at| Some(at.timestamp().to_string()))
        .map_err(|_| {
            AppError::invalid_field(
                "departure_time",
                "departure_time must be \"now\", unix seconds, or an RFC 3339 timestamp",
            )
        })
}

pub fn normalize_timestamp(timestamp: Option<i64>, now: DateTime<Utc>) -> Result<i64, AppError> {
    match timestamp {
        None => Ok(now.timestamp()),
        Some(seconds) if seconds >= 0 => Ok(seconds),
        Some(_) => Err(AppError::invalid_field(
            "timestamp",
            "timestamp must not be negative",
        )),
    }
}

pub fn normalize_language(language: Option<String>) -> Result<Option<String>, AppError> {
    let Some(language) = language.map(|value| value.trim().to_string()) else {
        return Ok(None);
    };
    if !language_pattern().is_match(&language) {
        return Err(AppError::invalid_field(
            "language",
            "language must be a language code such as \"en\" or \"pt-BR\"",
        ));
    }
    Ok(Some(language))
}

pub fn normalize_region(region: Option<String>) -> Result<Option<String>, AppError> {
    let Some(region) = region.map(|value| value.trim().to_ascii_lowercase()) else {
        return Ok(None);
    };
    if region.len() != 2 || !region.chars().all(|character| character.is_ascii_alphabetic()) {
        return Err(AppError::invalid_field(
            "region",
            "region must be a two-letter country code",
        ));
    }
    Ok(Some(region))
}

/// Place types and field names share the same lowercase identifier syntax.
pub fn normalize_identifier(field: &str, value: Option<String>) -> Result<Option<String>, AppError> {
    let Some(value) = value.map(|value| value.trim().to_ascii_lowercase()) else {
        return Ok(None);
    };
    if !identifier_pattern().is_match(&value) {
        return Err(AppError::invalid_field(
            field,
            format!("{field} must be a lowercase identifier such as \"restaurant\""),
        ));
    }
    Ok(Some(value))
}

pub fn join_identifiers(
    field: &str,
    values: Option<Vec<String>>,
) -> Result<Option<String>, AppError> {
    let Some(values) = values.filter(|values| !values.is_empty()) else {
        return Ok(None);
    };
    let normalized = values
        .into_iter()
        .map(|value| {
            normalize_identifier(field, Some(value))?
                .ok_or_else(|| AppError::invalid_field(field, format!("{field} is empty")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(normalized.join(",")))
}

/// Canonical form is lowercase with `:` separators.
pub fn normalize_mac_address(value: &str) -> Result<String, AppError> {
    let trimmed = value.trim();
    if !mac_address_pattern().is_match(trimmed) {
        return Err(AppError::invalid_field(
            "wifi_access_points",
            format!("\"{trimmed}\" is not a MAC address"),
        ));
    }
    Ok(trimmed.replace('-', ":").to_ascii_lowercase())
}

/// Removes markup from upstream instruction text.
pub fn strip_html(value: &str) -> String {
    let without_tags = html_tag_pattern().replace_all(value, " ");
    let decoded = without_tags
        .replace("&nbsp;", " ")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&");
    whitespace_pattern()
        .replace_all(decoded.trim(), " ")
        .into_owned()
}
