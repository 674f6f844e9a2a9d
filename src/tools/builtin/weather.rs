//! Weather lookup via the Open-Meteo public API (no key required).

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::tools::{tool_err, tool_ok, Tool};

pub struct WeatherTool {
    http: reqwest::Client,
}

impl WeatherTool {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for WeatherTool {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WeatherArgs {
    location: String,
}

#[async_trait]
impl Tool for WeatherTool {
    fn name(&self) -> &str {
        "weather"
    }

    fn capability(&self) -> String {
        "weather(location) -> {success, location, temperature_c, wind_kmh, conditions_code}\n\
         Current conditions for a named place (Open-Meteo)."
            .to_string()
    }

    fn positional_keys(&self) -> &[&str] {
        &["location"]
    }

    async fn run(&self, args: Value) -> anyhow::Result<Value> {
        let args: WeatherArgs = match serde_json::from_value(args) {
            Ok(a) => a,
            Err(e) => return Ok(tool_err(format!("Invalid arguments: {e}"))),
        };

        let geo: Value = match self
            .http
            .get("https://geocoding-api.open-meteo.com/v1/search")
            .query(&[("name", args.location.as_str()), ("count", "1")])
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(response) => match response.json().await {
                Ok(data) => data,
                Err(e) => return Ok(tool_err(format!("Bad geocoding response: {e}"))),
            },
            Err(e) => return Ok(tool_err(format!("Geocoding failed: {e}"))),
        };

        let Some(hit) = geo["results"].as_array().and_then(|r| r.first()) else {
            return Ok(tool_err(format!("Unknown location '{}'", args.location)));
        };
        let (lat, lon) = (hit["latitude"].clone(), hit["longitude"].clone());
        let resolved = hit["name"].as_str().unwrap_or(&args.location).to_string();

        let weather: Value = match self
            .http
            .get("https://api.open-meteo.com/v1/forecast")
            .query(&[
                ("latitude", lat.to_string()),
                ("longitude", lon.to_string()),
                ("current_weather", "true".to_string()),
            ])
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(response) => match response.json().await {
                Ok(data) => data,
                Err(e) => return Ok(tool_err(format!("Bad forecast response: {e}"))),
            },
            Err(e) => return Ok(tool_err(format!("Forecast failed: {e}"))),
        };

        let current = &weather["current_weather"];
        Ok(tool_ok(json!({
            "location": resolved,
            "temperature_c": current["temperature"],
            "wind_kmh": current["windspeed"],
            "conditions_code": current["weathercode"],
        })))
    }
}
