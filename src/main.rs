use std::sync::Arc;

use anyhow::{Context, Result};
use wxhub_core::{ApiKeyStore, Config};
use wxhub_weather::{
    DataKind, FetchRequest, Location, OrchestratorBuilder, RequestCache, WeatherPayload,
};

#[tokio::main]
async fn main() -> Result<()> {
    wxhub_core::init()?;

    let (config, validation) = Config::load_validated().context("Failed to load configuration")?;
    tracing::debug!("Configuration loaded with {} warning(s)", validation.warnings.len());

    let weather = &config.weather;
    let Some(location) = weather.default_location.as_ref() else {
        println!(
            "No default location configured. Add [weather.default_location] to {}",
            config.config_dir.join("config.toml").display()
        );
        return Ok(());
    };
    let location = Location::new(&location.name, location.latitude, location.longitude);

    let cache = Arc::new(RequestCache::new());
    let cache_path = config.cache_path();
    if weather.cache.persist {
        match cache.load_from(&cache_path) {
            Ok(restored) => tracing::info!("Restored {} cached entries", restored),
            Err(e) => tracing::warn!("Ignoring saved weather cache: {}", e),
        }
    }

    let keys = ApiKeyStore::new(weather);
    let orchestrator = OrchestratorBuilder::from_config(weather, &keys)
        .context("Failed to set up weather providers")?
        .cache(Arc::clone(&cache))
        .build();

    let request = FetchRequest::new(vec![DataKind::Current, DataKind::Forecast])
        .with_enrichment(vec![
            DataKind::Alerts,
            DataKind::Discussion,
            DataKind::AirQuality,
        ])
        .on_enrichment_complete(|kind, result| match result {
            Ok(resolved) => tracing::info!("{} ready from {}", kind, resolved.provider),
            Err(e) => tracing::info!("{} unavailable: {}", kind, e),
        });

    let mut aggregate = match orchestrator.fetch_weather(&location, request).await {
        Ok(aggregate) => aggregate,
        Err(e) => {
            println!("{}", e.user_message());
            return Err(e).context(format!("Weather unavailable for {location}"));
        }
    };

    println!("Weather for {} ({:?})", location, aggregate.availability());
    for resolved in aggregate.resolved() {
        let stale = if resolved.is_stale() { " [last known]" } else { "" };
        println!(
            "  {}: {} via {}{}",
            resolved.kind,
            summarize(&resolved.payload),
            resolved.provider,
            stale
        );
    }
    for (kind, error) in aggregate.failures() {
        println!("  {}: {}", kind, error.user_message());
    }

    for kind in aggregate.pending_kinds() {
        if let Some(pending) = aggregate.take_pending(kind) {
            match pending.wait().await {
                Ok(resolved) => println!("  {}: {}", kind, summarize(&resolved.payload)),
                Err(e) => tracing::debug!("{} skipped: {}", kind, e),
            }
        }
    }

    if weather.cache.persist {
        let saved = cache
            .save_to(&cache_path)
            .with_context(|| format!("Failed to save weather cache to {}", cache_path.display()))?;
        tracing::debug!("Saved {} cached entries", saved);
    }

    Ok(())
}

fn summarize(payload: &WeatherPayload) -> String {
    match payload {
        WeatherPayload::Current(c) => format!("{:.1}°C, {}", c.temperature, c.summary),
        WeatherPayload::Forecast(days) => format!("{} day(s)", days.len()),
        WeatherPayload::Hourly(hours) => format!("{} hour(s)", hours.len()),
        WeatherPayload::Alerts(alerts) if alerts.is_empty() => "no active alerts".to_string(),
        WeatherPayload::Alerts(alerts) => alerts
            .iter()
            .map(|a| a.event.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        WeatherPayload::Discussion(d) => format!("{} chars from {}", d.text.len(), d.office),
        WeatherPayload::AirQuality(aq) => match aq.us_aqi {
            Some(aqi) => format!("US AQI {aqi}"),
            None => "no AQI reported".to_string(),
        },
    }
}
