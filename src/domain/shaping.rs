//! Reduces upstream payloads to the fields a model actually needs.
//!
//! Missing upstream fields are omitted rather than reported; the upstream
//! shapes are loose and vary by endpoint version.

use chrono::{DateTime, FixedOffset};
use serde_json::{json, Map, Value};

use crate::domain::utils::strip_html;

pub const MAX_REVIEWS: usize = 5;

fn array<'a>(payload: &'a Value, field: &str) -> impl Iterator<Item = &'a Value> {
    payload
        .get(field)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

/// Copies the listed fields that are present and not null.
fn pick(source: &Value, fields: &[&str]) -> Map<String, Value> {
    fields
        .iter()
        .filter_map(|field| {
            source
                .get(*field)
                .filter(|value| !value.is_null())
                .map(|value| (field.to_string(), value.clone()))
        })
        .collect()
}

fn location(result: &Value) -> Value {
    result
        .pointer("/geometry/location")
        .cloned()
        .unwrap_or(Value::Null)
}

fn status(payload: &Value) -> Value {
    payload.get("status").cloned().unwrap_or(Value::Null)
}

pub fn geocode(payload: &Value) -> Value {
    let results = array(payload, "results")
        .map(|result| {
            let mut shaped = pick(result, &["formatted_address", "place_id", "types"]);
            shaped.insert("location".to_string(), location(result));
            Value::Object(shaped)
        })
        .collect::<Vec<_>>();

    json!({ "status": status(payload), "results": results })
}

fn place_summary(result: &Value) -> Value {
    let mut shaped = pick(
        result,
        &[
            "name",
            "place_id",
            "formatted_address",
            "vicinity",
            "rating",
            "user_ratings_total",
            "price_level",
            "business_status",
            "types",
        ],
    );
    shaped.insert("location".to_string(), location(result));
    if let Some(open_now) = result.pointer("/opening_hours/open_now") {
        shaped.insert("open_now".to_string(), open_now.clone());
    }
    Value::Object(shaped)
}

pub fn places(payload: &Value) -> Value {
    let mut shaped = Map::new();
    shaped.insert("status".to_string(), status(payload));
    shaped.insert(
        "places".to_string(),
        Value::Array(array(payload, "results").map(place_summary).collect()),
    );
    if let Some(token) = payload.get("next_page_token") {
        shaped.insert("next_page_token".to_string(), token.clone());
    }
    Value::Object(shaped)
}

pub fn find_place(payload: &Value) -> Value {
    json!({
        "status": status(payload),
        "candidates": array(payload, "candidates").map(place_summary).collect::<Vec<_>>(),
    })
}

pub fn place_details(payload: &Value) -> Value {
    let Some(result) = payload.get("result") else {
        return json!({ "status": status(payload), "place": Value::Null });
    };

    let mut place = pick(
        result,
        &[
            "name",
            "place_id",
            "formatted_address",
            "formatted_phone_number",
            "international_phone_number",
            "website",
            "url",
            "rating",
            "user_ratings_total",
            "price_level",
            "business_status",
            "types",
        ],
    );
    place.insert("location".to_string(), location(result));
    if let Some(hours) = result.pointer("/opening_hours/weekday_text") {
        place.insert("opening_hours".to_string(), hours.clone());
    }

    let reviews = array(result, "reviews")
        .take(MAX_REVIEWS)
        .map(|review| {
            Value::Object(pick(
                review,
                &["author_name", "rating", "relative_time_description", "text", "time"],
            ))
        })
        .collect::<Vec<_>>();
    if !reviews.is_empty() {
        place.insert("reviews".to_string(), Value::Array(reviews));
    }

    json!({ "status": status(payload), "place": place })
}

pub fn autocomplete(payload: &Value) -> Value {
    let predictions = array(payload, "predictions")
        .map(|prediction| {
            let mut shaped = pick(prediction, &["description", "place_id", "types"]);
            if let Some(main_text) = prediction.pointer("/structured_formatting/main_text") {
                shaped.insert("main_text".to_string(), main_text.clone());
            }
            if let Some(secondary) = prediction.pointer("/structured_formatting/secondary_text") {
                shaped.insert("secondary_text".to_string(), secondary.clone());
            }
            Value::Object(shaped)
        })
        .collect::<Vec<_>>();

    json!({ "status": status(payload), "predictions": predictions })
}

fn text_of(value: &Value, pointer: &str) -> Value {
    value.pointer(pointer).cloned().unwrap_or(Value::Null)
}

fn step(step: &Value) -> Value {
    let instructions = step
        .get("html_instructions")
        .and_then(Value::as_str)
        .map(strip_html)
        .unwrap_or_default();

    let mut shaped = Map::new();
    shaped.insert("instructions".to_string(), Value::String(instructions));
    shaped.insert("distance".to_string(), text_of(step, "/distance/text"));
    shaped.insert("duration".to_string(), text_of(step, "/duration/text"));
    if let Some(mode) = step.get("travel_mode") {
        shaped.insert("travel_mode".to_string(), mode.clone());
    }
    Value::Object(shaped)
}

pub fn directions(payload: &Value) -> Value {
    let routes = array(payload, "routes")
        .map(|route| {
            let legs = array(route, "legs")
                .map(|leg| {
                    json!({
                        "start_address": text_of(leg, "/start_address"),
                        "end_address": text_of(leg, "/end_address"),
                        "distance": leg.get("distance").cloned().unwrap_or(Value::Null),
                        "duration": leg.get("duration").cloned().unwrap_or(Value::Null),
                        "steps": array(leg, "steps").map(step).collect::<Vec<_>>(),
                    })
                })
                .collect::<Vec<_>>();

            let mut shaped = pick(route, &["summary", "warnings", "copyrights"]);
            shaped.insert("legs".to_string(), Value::Array(legs));
            Value::Object(shaped)
        })
        .collect::<Vec<_>>();

    json!({ "status": status(payload), "routes": routes })
}

pub fn distance_matrix(payload: &Value) -> Value {
    let origins = array(payload, "origin_addresses").cloned().collect::<Vec<_>>();
    let destinations = array(payload, "destination_addresses")
        .cloned()
        .collect::<Vec<_>>();

    let rows = array(payload, "rows")
        .enumerate()
        .map(|(row_index, row)| {
            let elements = array(row, "elements")
                .enumerate()
                .map(|(column, element)| {
                    let mut shaped = pick(element, &["status", "distance", "duration"]);
                    if let Some(in_traffic) = element.get("duration_in_traffic") {
                        shaped.insert("duration_in_traffic".to_string(), in_traffic.clone());
                    }
                    shaped.insert(
                        "destination".to_string(),
                        destinations.get(column).cloned().unwrap_or(Value::Null),
                    );
                    Value::Object(shaped)
                })
                .collect::<Vec<_>>();
            json!({
                "origin": origins.get(row_index).cloned().unwrap_or(Value::Null),
                "elements": elements,
            })
        })
        .collect::<Vec<_>>();

    json!({
        "status": status(payload),
        "origin_addresses": origins,
        "destination_addresses": destinations,
        "rows": rows,
    })
}

pub fn elevation(payload: &Value) -> Value {
    let results = array(payload, "results")
        .map(|result| Value::Object(pick(result, &["elevation", "location", "resolution"])))
        .collect::<Vec<_>>();

    json!({ "status": status(payload), "results": results })
}

/// Adds the wall-clock time at the location for the requested instant.
pub fn timezone(payload: &Value, timestamp: i64) -> Value {
    let mut shaped = pick(
        payload,
        &["status", "timeZoneId", "timeZoneName", "rawOffset", "dstOffset"],
    );

    let raw = payload.get("rawOffset").and_then(Value::as_i64);
    let dst = payload.get("dstOffset").and_then(Value::as_i64);
    let local = raw
        .zip(dst)
        .and_then(|(raw, dst)| raw.checked_add(dst))
        .and_then(|offset| local_time(timestamp, offset));
    if let Some(local_time) = local {
        shaped.insert("local_time".to_string(), Value::String(local_time));
    }
    shaped.insert("timestamp".to_string(), json!(timestamp));

    Value::Object(shaped)
}

pub fn local_time(timestamp: i64, offset_seconds: i64) -> Option<String> {
    let offset = FixedOffset::east_opt(i32::try_from(offset_seconds).ok()?)?;
    let instant = DateTime::from_timestamp(timestamp, 0)?;
    Some(instant.with_timezone(&offset).to_rfc3339())
}

pub fn geolocation(payload: &Value) -> Value {
    let mut shaped = Map::new();
    shaped.insert("location".to_string(), text_of(payload, "/location"));
    shaped.insert("accuracy_meters".to_string(), text_of(payload, "/accuracy"));
    Value::Object(shaped)
}
