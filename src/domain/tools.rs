//! Mapping tools exposed via Model Context Protocol
//!
//! Each tool turns its validated arguments into an [`UpstreamRequest`], runs it
//! through the shared [`RequestPipeline`] and shapes the upstream payload into
//! a compact result.

use chrono::Utc;
use rust_mcp_sdk::{
    macros,
    schema::{CallToolRequestParams, CallToolResult, ContentBlock, TextContent, Tool},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::domain::{
    shaping,
    utils::{
        format_lat_lng, join_coordinates, join_identifiers, join_place_references,
        normalize_avoid, normalize_coordinates, normalize_departure_time, normalize_identifier,
        normalize_language, normalize_mac_address, normalize_place_reference, normalize_radius,
        normalize_region, normalize_timestamp, normalize_travel_mode, normalize_units,
        optional_text, required_text, validate_latitude, validate_longitude,
        MAX_ELEVATION_LOCATIONS, MAX_MATRIX_SIDE, MAX_WAYPOINTS,
    },
};
use crate::{
    errors::{AppError, INVALID_REQUEST, TOOL_NOT_FOUND},
    maps_client::{Endpoint, RequestPipeline, UpstreamRequest},
};

const DEFAULT_FIND_PLACE_FIELDS: &str =
    "place_id,name,formatted_address,geometry,types,business_status,rating,opening_hours";

#[macros::mcp_tool(
    name = "maps_geocode",
    description = "Convert an address into geographic coordinates"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct GeocodeTool {
    /// Address or place name to geocode
    pub address: String,
    /// Result language, e.g. "en"
    pub language: Option<String>,
    /// Two-letter region bias, e.g. "de"
    pub region: Option<String>,
}

#[macros::mcp_tool(
    name = "maps_reverse_geocode",
    description = "Convert coordinates into a human-readable address"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct ReverseGeocodeTool {
    pub latitude: f64,
    pub longitude: f64,
    pub language: Option<String>,
    /// Restrict results to one address type, e.g. "street_address"
    pub result_type: Option<String>,
}

#[macros::mcp_tool(
    name = "maps_search_places",
    description = "Search for places by free-text query"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct SearchPlacesTool {
    pub query: String,
    /// Bias point as "lat,lng"
    pub location: Option<String>,
    /// Bias radius in meters (1-50000), requires location
    pub radius: Option<u32>,
    /// Place type filter, e.g. "restaurant"
    pub place_type: Option<String>,
    pub open_now: Option<bool>,
    pub language: Option<String>,
}

#[macros::mcp_tool(
    name = "maps_search_nearby",
    description = "Find places of interest around a location"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct SearchNearbyTool {
    /// Center point as "lat,lng"
    pub location: String,
    /// Search radius in meters (1-50000)
    pub radius: u32,
    pub keyword: Option<String>,
    pub place_type: Option<String>,
    pub open_now: Option<bool>,
    pub language: Option<String>,
}

#[macros::mcp_tool(
    name = "maps_find_place",
    description = "Find the best-matching place for a text query"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct FindPlaceTool {
    /// Name, address or phone number of the place
    pub input: String,
    /// Place fields to return
    pub fields: Option<Vec<String>>,
    /// Bias point as "lat,lng"
    pub location: Option<String>,
    pub language: Option<String>,
}

#[macros::mcp_tool(
    name = "maps_place_details",
    description = "Get detailed information about a place"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct PlaceDetailsTool {
    pub place_id: String,
    /// Place fields to return
    pub fields: Option<Vec<String>>,
    pub language: Option<String>,
}

#[macros::mcp_tool(
    name = "maps_place_autocomplete",
    description = "Suggest places for partially typed input"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct PlaceAutocompleteTool {
    pub input: String,
    /// Bias point as "lat,lng"
    pub location: Option<String>,
    /// Bias radius in meters (1-50000), requires location
    pub radius: Option<u32>,
    pub language: Option<String>,
}

#[macros::mcp_tool(
    name = "maps_directions",
    description = "Get directions between two places"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct DirectionsTool {
    /// Address or "lat,lng"
    pub origin: String,
    /// Address or "lat,lng"
    pub destination: String,
    /// driving, walking, bicycling or transit
    pub mode: Option<String>,
    /// Intermediate stops, addresses or "lat,lng"
    pub waypoints: Option<Vec<String>>,
    /// Any of tolls, highways, ferries, indoor
    pub avoid: Option<Vec<String>>,
    /// "now", unix seconds or RFC 3339 timestamp
    pub departure_time: Option<String>,
    pub alternatives: Option<bool>,
    /// metric or imperial
    pub units: Option<String>,
    pub language: Option<String>,
}

#[macros::mcp_tool(
    name = "maps_distance_matrix",
    description = "Compute travel distance and time between many origins and destinations"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct DistanceMatrixTool {
    pub origins: Vec<String>,
    pub destinations: Vec<String>,
    pub mode: Option<String>,
    pub avoid: Option<Vec<String>>,
    pub departure_time: Option<String>,
    pub units: Option<String>,
    pub language: Option<String>,
}

#[macros::mcp_tool(
    name = "maps_elevation",
    description = "Get elevation for one or more locations"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct ElevationTool {
    /// Points as "lat,lng"
    pub locations: Vec<String>,
}

#[macros::mcp_tool(
    name = "maps_timezone",
    description = "Get the time zone and local time for a location"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct TimezoneTool {
    /// Point as "lat,lng"
    pub location: String,
    /// Unix seconds, defaults to now
    pub timestamp: Option<i64>,
    pub language: Option<String>,
}

#[macros::mcp_tool(
    name = "maps_geolocate",
    description = "Estimate the device location from IP address and nearby Wi-Fi access points"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct GeolocateTool {
    /// Fall back to IP geolocation, defaults to true
    pub consider_ip: Option<bool>,
    /// MAC addresses of visible access points (at least two)
    pub wifi_access_points: Option<Vec<String>>,
}

pub fn build_tools_list() -> Vec<Tool> {
    vec![
        GeocodeTool::tool(),
        ReverseGeocodeTool::tool(),
        SearchPlacesTool::tool(),
        SearchNearbyTool::tool(),
        FindPlaceTool::tool(),
        PlaceDetailsTool::tool(),
        PlaceAutocompleteTool::tool(),
        DirectionsTool::tool(),
        DistanceMatrixTool::tool(),
        ElevationTool::tool(),
        TimezoneTool::tool(),
        GeolocateTool::tool(),
    ]
}

/// Argument validation and result shaping for one tool.
trait MapsTool: DeserializeOwned {
    fn upstream_request(self) -> Result<UpstreamRequest, AppError>;

    fn shape(request: &UpstreamRequest, payload: &Value) -> Value;
}

impl MapsTool for GeocodeTool {
    fn upstream_request(self) -> Result<UpstreamRequest, AppError> {
        Ok(UpstreamRequest::get(Endpoint::Geocode)
            .param("address", required_text("address", &self.address)?)
            .param_opt("language", normalize_language(self.language)?)
            .param_opt("region", normalize_region(self.region)?))
    }

    fn shape(_: &UpstreamRequest, payload: &Value) -> Value {
        shaping::geocode(payload)
    }
}

impl MapsTool for ReverseGeocodeTool {
    fn upstream_request(self) -> Result<UpstreamRequest, AppError> {
        let latitude = validate_latitude("latitude", self.latitude)?;
        let longitude = validate_longitude("longitude", self.longitude)?;

        Ok(UpstreamRequest::get(Endpoint::Geocode)
            .param("latlng", format_lat_lng(latitude, longitude))
            .param_opt("language", normalize_language(self.language)?)
            .param_opt(
                "result_type",
                normalize_identifier("result_type", self.result_type)?,
            ))
    }

    fn shape(_: &UpstreamRequest, payload: &Value) -> Value {
        shaping::geocode(payload)
    }
}

/// A radius only makes sense together with a bias point.
fn location_bias(
    location: Option<String>,
    radius: Option<u32>,
) -> Result<(Option<String>, Option<u32>), AppError> {
    let location = optional_text("location", location)?
        .map(|location| normalize_coordinates("location", &location))
        .transpose()?;
    let radius = normalize_radius(radius)?;
    if radius.is_some() && location.is_none() {
        return Err(AppError::invalid_field(
            "radius",
            "radius requires location",
        ));
    }
    Ok((location, radius))
}

impl MapsTool for SearchPlacesTool {
    fn upstream_request(self) -> Result<UpstreamRequest, AppError> {
        let (location, radius) = location_bias(self.location, self.radius)?;

        Ok(UpstreamRequest::get(Endpoint::PlaceTextSearch)
            .param("query", required_text("query", &self.query)?)
            .param_opt("location", location)
            .param_opt("radius", radius)
            .param_opt("type", normalize_identifier("place_type", self.place_type)?)
            .param_opt("opennow", self.open_now.filter(|open| *open))
            .param_opt("language", normalize_language(self.language)?))
    }

    fn shape(_: &UpstreamRequest, payload: &Value) -> Value {
        shaping::places(payload)
    }
}

impl MapsTool for SearchNearbyTool {
    fn upstream_request(self) -> Result<UpstreamRequest, AppError> {
        Ok(UpstreamRequest::get(Endpoint::PlaceNearbySearch)
            .param("location", normalize_coordinates("location", &self.location)?)
            .param_opt("radius", normalize_radius(Some(self.radius))?)
            .param_opt("keyword", optional_text("keyword", self.keyword)?)
            .param_opt("type", normalize_identifier("place_type", self.place_type)?)
            .param_opt("opennow", self.open_now.filter(|open| *open))
            .param_opt("language", normalize_language(self.language)?))
    }

    fn shape(_: &UpstreamRequest, payload: &Value) -> Value {
        shaping::places(payload)
    }
}

impl MapsTool for FindPlaceTool {
    fn upstream_request(self) -> Result<UpstreamRequest, AppError> {
        let fields = join_identifiers("fields", self.fields)?
            .unwrap_or_else(|| DEFAULT_FIND_PLACE_FIELDS.to_string());
        let location_bias = optional_text("location", self.location)?
            .map(|location| normalize_coordinates("location", &location))
            .transpose()?
            .map(|point| format!("point:{point}"));

        Ok(UpstreamRequest::get(Endpoint::FindPlace)
            .param("input", required_text("input", &self.input)?)
            .param("inputtype", "textquery")
            .param("fields", fields)
            .param_opt("locationbias", location_bias)
            .param_opt("language", normalize_language(self.language)?))
    }

    fn shape(_: &UpstreamRequest, payload: &Value) -> Value {
        shaping::find_place(payload)
    }
}

impl MapsTool for PlaceDetailsTool {
    fn upstream_request(self) -> Result<UpstreamRequest, AppError> {
        Ok(UpstreamRequest::get(Endpoint::PlaceDetails)
            .param("place_id", required_text("place_id", &self.place_id)?)
            .param_opt("fields", join_identifiers("fields", self.fields)?)
            .param_opt("language", normalize_language(self.language)?))
    }

    fn shape(_: &UpstreamRequest, payload: &Value) -> Value {
        shaping::place_details(payload)
    }
}

impl MapsTool for PlaceAutocompleteTool {
    fn upstream_request(self) -> Result<UpstreamRequest, AppError> {
        let (location, radius) = location_bias(self.location, self.radius)?;

        Ok(UpstreamRequest::get(Endpoint::PlaceAutocomplete)
            .param("input", required_text("input", &self.input)?)
            .param_opt("location", location)
            .param_opt("radius", radius)
            .param_opt("language", normalize_language(self.language)?))
    }

    fn shape(_: &UpstreamRequest, payload: &Value) -> Value {
        shaping::autocomplete(payload)
    }
}

impl MapsTool for DirectionsTool {
    fn upstream_request(self) -> Result<UpstreamRequest, AppError> {
        let waypoints = match self.waypoints.filter(|waypoints| !waypoints.is_empty()) {
            Some(waypoints) => Some(join_place_references("waypoints", &waypoints, MAX_WAYPOINTS)?),
            None => None,
        };

        Ok(UpstreamRequest::get(Endpoint::Directions)
            .param("origin", normalize_place_reference("origin", &self.origin)?)
            .param(
                "destination",
                normalize_place_reference("destination", &self.destination)?,
            )
            .param_opt("mode", normalize_travel_mode(self.mode)?)
            .param_opt("waypoints", waypoints)
            .param_opt("avoid", normalize_avoid(self.avoid)?)
            .param_opt("departure_time", normalize_departure_time(self.departure_time)?)
            .param_opt("alternatives", self.alternatives)
            .param_opt("units", normalize_units(self.units)?)
            .param_opt("language", normalize_language(self.language)?))
    }

    fn shape(_: &UpstreamRequest, payload: &Value) -> Value {
        shaping::directions(payload)
    }
}

impl MapsTool for DistanceMatrixTool {
    fn upstream_request(self) -> Result<UpstreamRequest, AppError> {
        Ok(UpstreamRequest::get(Endpoint::DistanceMatrix)
            .param(
                "origins",
                join_place_references("origins", &self.origins, MAX_MATRIX_SIDE)?,
            )
            .param(
                "destinations",
                join_place_references("destinations", &self.destinations, MAX_MATRIX_SIDE)?,
            )
            .param_opt("mode", normalize_travel_mode(self.mode)?)
            .param_opt("avoid", normalize_avoid(self.avoid)?)
            .param_opt("departure_time", normalize_departure_time(self.departure_time)?)
            .param_opt("units", normalize_units(self.units)?)
            .param_opt("language", normalize_language(self.language)?))
    }

    fn shape(_: &UpstreamRequest, payload: &Value) -> Value {
        shaping::distance_matrix(payload)
    }
}

impl MapsTool for ElevationTool {
    fn upstream_request(self) -> Result<UpstreamRequest, AppError> {
        Ok(UpstreamRequest::get(Endpoint::Elevation).param(
            "locations",
            join_coordinates("locations", &self.locations, MAX_ELEVATION_LOCATIONS)?,
        ))
    }

    fn shape(_: &UpstreamRequest, payload: &Value) -> Value {
        shaping::elevation(payload)
    }
}

impl MapsTool for TimezoneTool {
    fn upstream_request(self) -> Result<UpstreamRequest, AppError> {
        Ok(UpstreamRequest::get(Endpoint::Timezone)
            .param("location", normalize_coordinates("location", &self.location)?)
            .param("timestamp", normalize_timestamp(self.timestamp, Utc::now())?)
            .param_opt("language", normalize_language(self.language)?))
    }

    fn shape(request: &UpstreamRequest, payload: &Value) -> Value {
        let timestamp = request
            .params
            .get("timestamp")
            .and_then(Value::as_i64)
            .unwrap_or_default();
        shaping::timezone(payload, timestamp)
    }
}

impl MapsTool for GeolocateTool {
    fn upstream_request(self) -> Result<UpstreamRequest, AppError> {
        let access_points = self
            .wifi_access_points
            .unwrap_or_default()
            .iter()
            .map(|mac| normalize_mac_address(mac).map(|mac| json!({ "macAddress": mac })))
            .collect::<Result<Vec<_>, _>>()?;
        if access_points.len() == 1 {
            return Err(AppError::invalid_field(
                "wifi_access_points",
                "wifi_access_points needs at least two entries",
            ));
        }

        let mut body = json!({ "considerIp": self.consider_ip.unwrap_or(true) });
        if !access_points.is_empty() {
            body["wifiAccessPoints"] = Value::Array(access_points);
        }
        Ok(UpstreamRequest::post(Endpoint::Geolocate, body))
    }

    fn shape(_: &UpstreamRequest, payload: &Value) -> Value {
        shaping::geolocation(payload)
    }
}

async fn run_tool<T: MapsTool>(
    pipeline: &RequestPipeline,
    name: &str,
    arguments: Map<String, Value>,
) -> Result<CallToolResult, AppError> {
    let arguments: T = serde_json::from_value(Value::Object(arguments))
        .map_err(|err| AppError::validation(format!("invalid arguments for {name}: {err}")))?;
    let request = arguments.upstream_request()?;
    let payload = pipeline.execute(name, request.clone()).await?;

    Ok(tool_result(T::shape(&request, &payload)))
}

fn tool_result(shaped: Value) -> CallToolResult {
    let text = serde_json::to_string_pretty(&shaped).unwrap_or_else(|_| shaped.to_string());
    let structured_content = match shaped {
        Value::Object(map) => Some(map),
        other => Some(Map::from_iter([("result".to_string(), other)])),
    };

    CallToolResult {
        content: vec![ContentBlock::from(TextContent::new(text, None, None))],
        is_error: None,
        meta: None,
        structured_content,
    }
}

pub async fn handle_tools_call(
    pipeline: &RequestPipeline,
    params: Option<Value>,
) -> Result<Value, AppError> {
    let tool_call: CallToolRequestParams = params
        .and_then(|params| serde_json::from_value(params).ok())
        .ok_or_else(|| {
            AppError::domain(
                INVALID_REQUEST,
                "tools/call requires params with a tool name",
                None,
            )
        })?;

    let name = tool_call.name.as_str();
    let arguments = tool_call.arguments.unwrap_or_default();
    let result = match name {
        "maps_geocode" => run_tool::<GeocodeTool>(pipeline, name, arguments).await,
        "maps_reverse_geocode" => run_tool::<ReverseGeocodeTool>(pipeline, name, arguments).await,
        "maps_search_places" => run_tool::<SearchPlacesTool>(pipeline, name, arguments).await,
        "maps_search_nearby" => run_tool::<SearchNearbyTool>(pipeline, name, arguments).await,
        "maps_find_place" => run_tool::<FindPlaceTool>(pipeline, name, arguments).await,
        "maps_place_details" => run_tool::<PlaceDetailsTool>(pipeline, name, arguments).await,
        "maps_place_autocomplete" => {
            run_tool::<PlaceAutocompleteTool>(pipeline, name, arguments).await
        }
        "maps_directions" => run_tool::<DirectionsTool>(pipeline, name, arguments).await,
        "maps_distance_matrix" => run_tool::<DistanceMatrixTool>(pipeline, name, arguments).await,
        "maps_elevation" => run_tool::<ElevationTool>(pipeline, name, arguments).await,
        "maps_timezone" => run_tool::<TimezoneTool>(pipeline, name, arguments).await,
        "maps_geolocate" => run_tool::<GeolocateTool>(pipeline, name, arguments).await,
        _ => Err(AppError::domain(
            TOOL_NOT_FOUND,
            format!("unknown tool: {name}"),
            Some(json!({ "name": name })),
        )),
    }?;

    Ok(serde_json::to_value(result).expect("tool result serialization"))
}
