//! Google Places proxy
//!
//! Forwards the narrow set of Places calls the clients use and shapes the
//! responses. Upstream failures are represented in data (`ProxyResponse`
//! carries the upstream status and body verbatim); only transport errors
//! surface as `ChatError`, which the HTTP front translates to a 500.

use std::error::Error as StdError;
use std::io::ErrorKind;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{ChatError, Result};

const PLACES_BASE_URL: &str = "https://places.googleapis.com";
const PHOTO_BASE_URL: &str = "https://maps.googleapis.com";

const SEARCH_FIELD_MASK: &str = "places.id,places.displayName,places.formattedAddress,places.location";
const DETAILS_FIELD_MASK: &str = "id,displayName,formattedAddress,location";

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Connect failures with EADDRNOTAVAIL are retried this many times
const ADDR_RETRY_LIMIT: u32 = 3;

const DEFAULT_NEARBY_RADIUS_M: f64 = 1500.0;
const DEFAULT_SEARCH_RADIUS_M: f64 = 50000.0;
const DEFAULT_SEARCH_LAT: f64 = 37.5665;
const DEFAULT_SEARCH_LNG: f64 = 126.9780;
const DEFAULT_PHOTO_MAX_WIDTH: u32 = 400;

/// Client request for `POST /places/nearby`
#[derive(Debug, Deserialize)]
pub struct NearbySearchRequest {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub radius: Option<f64>,
}

/// Client request for `POST /places/search`
#[derive(Debug, Deserialize)]
pub struct TextSearchRequest {
    pub query: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub radius: Option<f64>,
}

/// A response ready to be relayed to the client
#[derive(Debug)]
pub struct ProxyResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Bytes,
}

impl ProxyResponse {
    fn json(status: StatusCode, body: Vec<u8>) -> Self {
        Self {
            status: status.as_u16(),
            content_type: "application/json".to_string(),
            body: Bytes::from(body),
        }
    }

    /// Pass an upstream error body through with its original status; the
    /// content type is JSON when the body parses as JSON.
    fn passthrough(status: StatusCode, body: Bytes) -> Self {
        let content_type = if serde_json::from_slice::<Value>(&body).is_ok() {
            "application/json"
        } else {
            "text/plain"
        };
        Self {
            status: status.as_u16(),
            content_type: content_type.to_string(),
            body,
        }
    }
}

/// HTTPS client for the upstream Places service
pub struct PlacesClient {
    api_key: String,
    client: reqwest::Client,
    places_base: String,
    photo_base: String,
}

impl PlacesClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        // Redirects are never followed automatically: the photo endpoint
        // follows its single 302 by hand, everything else must not move.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(UPSTREAM_TIMEOUT)
            .timeout(UPSTREAM_TIMEOUT)
            .build()?;
        Ok(Self {
            api_key: api_key.into(),
            client,
            places_base: PLACES_BASE_URL.to_string(),
            photo_base: PHOTO_BASE_URL.to_string(),
        })
    }

    /// Point the client at alternative upstream hosts (used by tests)
    pub fn with_base_urls(mut self, places_base: impl Into<String>, photo_base: impl Into<String>) -> Self {
        self.places_base = places_base.into();
        self.photo_base = photo_base.into();
        self
    }

    /// `POST places:searchNearby` with a circle restriction
    pub async fn nearby_search(&self, req: &NearbySearchRequest) -> Result<ProxyResponse> {
        let body = json!({
            "locationRestriction": {
                "circle": {
                    "center": {
                        "latitude": req.latitude,
                        "longitude": req.longitude,
                    },
                    "radius": req.radius.unwrap_or(DEFAULT_NEARBY_RADIUS_M),
                }
            }
        });
        let url = format!("{}/v1/places:searchNearby", self.places_base);
        let response = self
            .request_places_api(Method::POST, &url, SEARCH_FIELD_MASK, Some(&body))
            .await?;
        self.shape_search_response(response).await
    }

    /// `POST places:searchText` with a circle bias
    pub async fn text_search(&self, req: &TextSearchRequest) -> Result<ProxyResponse> {
        let body = json!({
            "textQuery": req.query,
            "locationBias": {
                "circle": {
                    "center": {
                        "latitude": req.latitude.unwrap_or(DEFAULT_SEARCH_LAT),
                        "longitude": req.longitude.unwrap_or(DEFAULT_SEARCH_LNG),
                    },
                    "radius": req.radius.unwrap_or(DEFAULT_SEARCH_RADIUS_M),
                }
            }
        });
        let url = format!("{}/v1/places:searchText", self.places_base);
        let response = self
            .request_places_api(Method::POST, &url, SEARCH_FIELD_MASK, Some(&body))
            .await?;
        self.shape_search_response(response).await
    }

    /// `GET places/{id}`; the upstream JSON is returned as-is
    pub async fn place_details(&self, place_id: &str) -> Result<ProxyResponse> {
        let url = format!("{}/v1/places/{}", self.places_base, place_id);
        let response = self
            .request_places_api(Method::GET, &url, DETAILS_FIELD_MASK, None)
            .await?;

        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            warn!("Places details returned error status: {}", status);
            return Ok(ProxyResponse::passthrough(status, body));
        }

        let value: Value = serde_json::from_slice(&body)?;
        Ok(ProxyResponse::json(StatusCode::OK, serde_json::to_vec(&value)?))
    }

    /// Classic photo endpoint. Follows exactly one 302 to the CDN host and
    /// streams the body; any other status passes through unchanged.
    pub async fn place_photo(&self, photo_reference: &str, max_width: Option<u32>) -> Result<ProxyResponse> {
        let url = format!(
            "{}/maps/api/place/photo?maxwidth={}&photo_reference={}&key={}",
            self.photo_base,
            max_width.unwrap_or(DEFAULT_PHOTO_MAX_WIDTH),
            photo_reference,
            self.api_key,
        );

        let response = self.send_with_retry(|| self.client.get(&url)).await?;
        let status = response.status();

        if status == StatusCode::FOUND {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| ChatError::protocol("Photo redirect without Location header"))?;
            debug!("Following photo redirect to {}", location);

            let follow = self.send_with_retry(|| self.client.get(&location)).await?;
            let follow_status = follow.status();
            let content_type = response_content_type(&follow, "image/jpeg");
            let body = follow.bytes().await?;
            return Ok(ProxyResponse {
                status: follow_status.as_u16(),
                content_type,
                body,
            });
        }

        let content_type = response_content_type(&response, "image/jpeg");
        let body = response.bytes().await?;
        Ok(ProxyResponse {
            status: status.as_u16(),
            content_type,
            body,
        })
    }

    async fn request_places_api(
        &self,
        method: Method,
        url: &str,
        field_mask: &'static str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response> {
        debug!("Places API request: {} {}", method, url);
        self.send_with_retry(|| {
            let mut request = self
                .client
                .request(method.clone(), url)
                .header("X-Goog-Api-Key", &self.api_key)
                .header("X-Goog-FieldMask", field_mask)
                .header(CONTENT_TYPE, "application/json");
            if let Some(body) = body {
                request = request.json(body);
            }
            request
        })
        .await
    }

    /// Send a request, retrying EADDRNOTAVAIL connect failures with
    /// 100/200/300 ms backoff. Other errors are not retried.
    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let mut attempt = 0u32;
        loop {
            match build().send().await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < ADDR_RETRY_LIMIT && is_addr_not_available(&e) => {
                    attempt += 1;
                    let delay = Duration::from_millis(100 * attempt as u64);
                    warn!(
                        "Upstream connect failed (EADDRNOTAVAIL), retry {}/{} after {:?}",
                        attempt, ADDR_RETRY_LIMIT, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn shape_search_response(&self, response: reqwest::Response) -> Result<ProxyResponse> {
        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            warn!("Places API returned error status: {}", status);
            return Ok(ProxyResponse::passthrough(status, body));
        }

        let value: Value = serde_json::from_slice(&body)?;
        let shaped = project_places(&value);
        Ok(ProxyResponse::json(StatusCode::OK, serde_json::to_vec(&shaped)?))
    }
}

/// Project an upstream search response onto the client shape:
/// `{"places":[{"id","name","addr","loc":{"lat","lng"}}]}`.
fn project_places(value: &Value) -> Value {
    let mut projected = Vec::new();

    if let Some(places) = value.get("places").and_then(Value::as_array) {
        for place in places {
            let id = place
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| {
                    // places/<ID> resource-name form
                    place
                        .get("name")
                        .and_then(Value::as_str)
                        .and_then(|name| name.strip_prefix("places/"))
                        .map(str::to_string)
                })
                .unwrap_or_default();

            let name = place
                .pointer("/displayName/text")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let addr = place
                .get("formattedAddress")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let lat = place
                .pointer("/location/latitude")
                .and_then(Value::as_f64)
                .unwrap_or_default();
            let lng = place
                .pointer("/location/longitude")
                .and_then(Value::as_f64)
                .unwrap_or_default();

            projected.push(json!({
                "id": id,
                "name": name,
                "addr": addr,
                "loc": {
                    "lat": round6(lat),
                    "lng": round6(lng),
                }
            }));
        }
    }

    json!({ "places": projected })
}

fn round6(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

fn response_content_type(response: &reqwest::Response, default: &str) -> String {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(default)
        .to_string()
}

/// Walk the error source chain looking for an EADDRNOTAVAIL I/O error
fn is_addr_not_available(err: &reqwest::Error) -> bool {
    let mut source = err.source();
    while let Some(inner) = source {
        if let Some(io_err) = inner.downcast_ref::<std::io::Error>() {
            if io_err.kind() == ErrorKind::AddrNotAvailable {
                return true;
            }
        }
        source = inner.source();
    }
    false
}
