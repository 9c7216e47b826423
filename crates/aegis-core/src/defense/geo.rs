//! Geospatial helpers for the defense detector
//!
//! Events are grouped on a ~1 km grid (two-decimal degree rounding) and
//! deduplicated by haversine distance.

use serde_json::Value;

use aegis_domain::Envelope;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// A geographic point extracted from an event payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventLocation {
    pub lat: f64,
    pub lon: f64,
}

impl EventLocation {
    /// Great-circle distance in kilometers (haversine).
    pub fn distance_km(&self, other: &EventLocation) -> f64 {
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let dlat = (other.lat - self.lat).to_radians();
        let dlon = (other.lon - self.lon).to_radians();

        let a = (dlat / 2.0).sin().powi(2)
            + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_KM * c
    }

    /// Spatial bucket key, rounded to ~1 km (0.01 degrees).
    pub fn grid_key(&self) -> String {
        format!(
            "{:.2},{:.2}",
            (self.lat * 100.0).round() / 100.0,
            (self.lon * 100.0).round() / 100.0
        )
    }

    /// Square polygon approximating a circle of `radius_km` around the
    /// point, as GeoJSON.
    pub fn square_polygon(&self, radius_km: f64) -> Value {
        let radius_deg = radius_km / 111.0;
        let coords = vec![
            vec![self.lon - radius_deg, self.lat - radius_deg],
            vec![self.lon + radius_deg, self.lat - radius_deg],
            vec![self.lon + radius_deg, self.lat + radius_deg],
            vec![self.lon - radius_deg, self.lat + radius_deg],
            vec![self.lon - radius_deg, self.lat - radius_deg],
        ];
        serde_json::json!({
            "type": "Polygon",
            "coordinates": [coords],
        })
    }
}

fn pair_from(value: &Value, lat_key: &str, lon_key: &str) -> Option<EventLocation> {
    let lat = value.get(lat_key)?.as_f64()?;
    let lon = value.get(lon_key)?.as_f64()?;
    Some(EventLocation { lat, lon })
}

fn location_in(value: &Value) -> Option<EventLocation> {
    pair_from(value, "latitude", "longitude").or_else(|| pair_from(value, "lat", "lon"))
}

/// Pull a location out of an event's details, trying the payload shapes the
/// domain producers actually use: a GeoJSON `geometry` point, a nested
/// `location`/`position` object, or flat coordinate fields.
pub fn extract_location(envelope: &Envelope) -> Option<EventLocation> {
    let details = &envelope.details;

    if let Some(geometry) = details.get("geometry") {
        if geometry.get("type").and_then(|t| t.as_str()) == Some("Point") {
            if let Some(coords) = geometry.get("coordinates").and_then(|c| c.as_array()) {
                if coords.len() >= 2 {
                    if let (Some(lon), Some(lat)) = (coords[0].as_f64(), coords[1].as_f64()) {
                        return Some(EventLocation { lat, lon });
                    }
                }
            }
        }
    }

    for key in ["location", "position"] {
        if let Some(nested) = details.get(key) {
            if let Some(location) = location_in(nested) {
                return Some(location);
            }
        }
    }

    location_in(details)
}
