use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::UpstreamConfig;
use crate::error::ExtractError;
use crate::transform::RawInspection;

const INSPECTIONS_RESOURCE: &str = "/resource/43nn-pn8j.csv";
const FASTFOOD_RESOURCE: &str = "/resource/qgc5-ecnb.csv";

const INSPECTIONS_SELECT: &str = "camis AS id,\
dba AS name,\
boro AS borough,\
cuisine_description AS cuisine,\
inspection_date,\
latitude AS lat,\
longitude AS lng";

/// The two logical datasets consumed from the upstream row service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dataset {
    Inspections,
    FastFood,
}

impl Dataset {
    fn resource(&self) -> &'static str {
        match self {
            Dataset::Inspections => INSPECTIONS_RESOURCE,
            Dataset::FastFood => FASTFOOD_RESOURCE,
        }
    }

    /// Build the query-string parameters for this dataset: a projection,
    /// an optional server-side predicate, a row cap and the app token.
    fn query(&self, config: &UpstreamConfig) -> Vec<(String, String)> {
        let mut params = match self {
            Dataset::Inspections => vec![
                ("$select".to_owned(), INSPECTIONS_SELECT.to_owned()),
                ("$where".to_owned(), where_filter(config.cutoff_years)),
                ("$limit".to_owned(), config.row_limit.to_string()),
            ],
            Dataset::FastFood => vec![
                (
                    "$select".to_owned(),
                    "distinct restaurant AS name".to_owned(),
                ),
                ("$limit".to_owned(), config.row_limit.to_string()),
            ],
        };

        if let Some(token) = &config.app_token {
            params.push(("$$app_token".to_owned(), token.clone()));
        }

        params
    }
}

/// `$where` predicate trimming the inspections payload before it crosses
/// the wire: a date cutoff plus non-null cuisine and coordinates.
pub fn where_filter(cutoff_years: u32) -> String {
    let date_limit = Utc::now() - Duration::days(i64::from(cutoff_years) * 365);
    let not_null = "IS NOT NULL";

    format!(
        "inspection_date > \"{}\" AND cuisine {not_null} AND lat {not_null} AND lng {not_null}",
        date_limit.format("%Y-%m-%dT%H:%M:%S")
    )
}

/// Retry `op` on timeouts only, with a fixed delay between attempts.
/// Transport and status errors are assumed non-transient and surface
/// immediately; `retries` counts total attempts.
pub async fn with_retry<T, F, Fut>(
    op: F,
    retries: u32,
    delay: std::time::Duration,
) -> Result<T, ExtractError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ExtractError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Err(ExtractError::Timeout { .. }) if attempt < retries => {
                warn!(attempt, "upstream request timed out, retrying in {delay:?}");
                tokio::time::sleep(delay).await;
            }
            Err(ExtractError::Timeout { .. }) => {
                return Err(ExtractError::Timeout { attempts: attempt })
            }
            other => return other,
        }
    }
}

fn classify(error: reqwest::Error) -> ExtractError {
    if error.is_timeout() {
        ExtractError::Timeout { attempts: 1 }
    } else {
        ExtractError::Request(error)
    }
}

/// The acquisition capability the pipeline consumes.
#[async_trait]
pub trait Extract: Send + Sync {
    async fn inspections(&self) -> Result<Vec<RawInspection>, ExtractError>;
    async fn fastfood_names(&self) -> Result<HashSet<String>, ExtractError>;
    fn populations(&self) -> Result<HashMap<String, i64>, ExtractError>;
}

/// Extractor backed by the Socrata-style row service plus two local
/// sidecar files (fast-food cache, census populations).
pub struct SocrataExtractor {
    client: reqwest::Client,
    config: UpstreamConfig,
}

impl SocrataExtractor {
    pub fn new(config: UpstreamConfig) -> Result<Self, ExtractError> {
        let client = reqwest::Client::builder()
            .user_agent("tastemap")
            .timeout(config.request_timeout.0)
            .build()?;

        Ok(Self { client, config })
    }

    async fn get_csv(&self, dataset: Dataset) -> Result<String, ExtractError> {
        let url = format!("{}{}", self.config.base_url, dataset.resource());
        let params = dataset.query(&self.config);

        let client = &self.client;
        let url = url.as_str();
        let params = &params;

        with_retry(
            || async move {
                debug!(?dataset, "sending upstream request");
                let response = client.get(url).query(params).send().await.map_err(classify)?;
                let response = response.error_for_status().map_err(ExtractError::Request)?;
                response.text().await.map_err(classify)
            },
            self.config.retries,
            self.config.retry_delay.0,
        )
        .await
    }
}

#[async_trait]
impl Extract for SocrataExtractor {
    async fn inspections(&self) -> Result<Vec<RawInspection>, ExtractError> {
        let body = self.get_csv(Dataset::Inspections).await?;
        let rows = parse_inspections(&body)?;
        info!(rows = rows.len(), "extracted inspection records");
        Ok(rows)
    }

    /// Fast-food names come from the cache file when present; otherwise
    /// from the upstream service, after the inter-call pause (the service
    /// is shared with the inspections call).
    async fn fastfood_names(&self) -> Result<HashSet<String>, ExtractError> {
        let cache = &self.config.fastfood_cache;
        if cache.exists() {
            debug!(path = %cache.display(), "loading fast-food names from cache");
            return read_name_csv(cache);
        }

        tokio::time::sleep(self.config.sleep_between_calls.0).await;
        let body = self.get_csv(Dataset::FastFood).await?;
        let names = parse_names(&body)?;
        write_name_cache(cache, &names)?;
        info!(names = names.len(), "extracted fast-food exclusion names");
        Ok(names)
    }

    /// Borough populations from the cleaned census sidecar. A missing
    /// file means no population data, not an error.
    fn populations(&self) -> Result<HashMap<String, i64>, ExtractError> {
        let path = &self.config.population_csv;
        if !path.exists() {
            info!(
                path = %path.display(),
                "no population data found; boroughs will carry none"
            );
            return Ok(HashMap::new());
        }

        let mut reader = csv::Reader::from_path(path).map_err(|source| sidecar(path, source))?;
        let mut populations = HashMap::new();
        for record in reader.deserialize::<PopulationRow>() {
            let row = record.map_err(|source| sidecar(path, source))?;
            populations.insert(row.borough, row.population);
        }
        Ok(populations)
    }
}

#[derive(Debug, Deserialize)]
struct NameRow {
    name: String,
}

#[derive(Debug, Deserialize)]
struct PopulationRow {
    borough: String,
    population: i64,
}

fn sidecar(path: &Path, source: csv::Error) -> ExtractError {
    ExtractError::Sidecar {
        path: path.display().to_string(),
        source,
    }
}

fn parse_inspections(body: &str) -> Result<Vec<RawInspection>, ExtractError> {
    let mut reader = csv::Reader::from_reader(body.as_bytes());
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        rows.push(record?);
    }
    Ok(rows)
}

fn parse_names(body: &str) -> Result<HashSet<String>, ExtractError> {
    let mut reader = csv::Reader::from_reader(body.as_bytes());
    let mut names = HashSet::new();
    for record in reader.deserialize::<NameRow>() {
        names.insert(record?.name);
    }
    Ok(names)
}

fn read_name_csv(path: &Path) -> Result<HashSet<String>, ExtractError> {
    let mut reader = csv::Reader::from_path(path).map_err(|source| sidecar(path, source))?;
    let mut names = HashSet::new();
    for record in reader.deserialize::<NameRow>() {
        names.insert(record.map_err(|source| sidecar(path, source))?.name);
    }
    Ok(names)
}

fn write_name_cache(path: &Path, names: &HashSet<String>) -> Result<(), ExtractError> {
    let mut writer = csv::Writer::from_path(path).map_err(|source| sidecar(path, source))?;
    writer
        .write_record(["name"])
        .map_err(|source| sidecar(path, source))?;
    for name in names {
        writer
            .write_record([name.as_str()])
            .map_err(|source| sidecar(path, source))?;
    }
    writer
        .flush()
        .map_err(|error| sidecar(path, csv::Error::from(error)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration as StdDuration;

    use crate::config::EnvSecsDuration;

    fn test_config(base_url: String) -> UpstreamConfig {
        UpstreamConfig {
            base_url,
            app_token: None,
            row_limit: 1000,
            cutoff_years: 2,
            request_timeout: EnvSecsDuration(StdDuration::from_secs(1)),
            retries: 2,
            retry_delay: EnvSecsDuration(StdDuration::from_millis(1)),
            sleep_between_calls: EnvSecsDuration(StdDuration::from_millis(1)),
            fastfood_cache: std::env::temp_dir().join(format!(
                "tastemap_fastfood_{}_{}.csv",
                std::process::id(),
                rand_suffix()
            )),
            population_csv: std::env::temp_dir().join(format!(
                "tastemap_population_{}_{}.csv",
                std::process::id(),
                rand_suffix()
            )),
        }
    }

    fn rand_suffix() -> u32 {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        COUNTER.fetch_add(1, Ordering::Relaxed)
    }

    #[test]
    fn test_inspections_query_carries_projection_predicate_and_cap() {
        let config = test_config("https://example.invalid".to_owned());
        let params = Dataset::Inspections.query(&config);

        let select = params.iter().find(|(k, _)| k == "$select").unwrap();
        assert!(select.1.contains("camis AS id"));
        assert!(select.1.contains("longitude AS lng"));

        let predicate = params.iter().find(|(k, _)| k == "$where").unwrap();
        assert!(predicate.1.contains("inspection_date >"));
        assert!(predicate.1.contains("cuisine IS NOT NULL"));

        let limit = params.iter().find(|(k, _)| k == "$limit").unwrap();
        assert_eq!(limit.1, "1000");

        assert!(!params.iter().any(|(k, _)| k == "$$app_token"));
    }

    #[test]
    fn test_app_token_is_appended_when_configured() {
        let mut config = test_config("https://example.invalid".to_owned());
        config.app_token = Some("sekrit".to_owned());

        let params = Dataset::FastFood.query(&config);
        let token = params.iter().find(|(k, _)| k == "$$app_token").unwrap();
        assert_eq!(token.1, "sekrit");
    }

    #[tokio::test]
    async fn test_with_retry_recovers_from_transient_timeouts() {
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;

        let result = with_retry(
            || async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(ExtractError::Timeout { attempts: 1 })
                } else {
                    Ok("payload".to_owned())
                }
            },
            3,
            StdDuration::from_millis(1),
        )
        .await;

        assert_eq!(result.unwrap(), "payload");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_surfaces_exhausted_timeouts() {
        let result: Result<String, _> = with_retry(
            || async { Err(ExtractError::Timeout { attempts: 1 }) },
            3,
            StdDuration::from_millis(1),
        )
        .await;

        assert!(matches!(result, Err(ExtractError::Timeout { attempts: 3 })));
    }

    #[tokio::test]
    async fn test_with_retry_does_not_retry_parse_errors() {
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;

        let result: Result<String, _> = with_retry(
            || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(csv::Error::from(std::io::Error::other("bad payload")).into())
            },
            3,
            StdDuration::from_millis(1),
        )
        .await;

        assert!(matches!(result, Err(ExtractError::Parse(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_inspections_parse_mock_csv_payload() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", INSPECTIONS_RESOURCE)
            .match_query(mockito::Matcher::Any)
            .with_body(
                "id,name,borough,cuisine,inspection_date,lat,lng\n\
                 1,Kabul Kitchen,Queens,Afghan,2024-06-17T00:00:00.000,40.74,-73.89\n\
                 2,Thai Garden,Bronx,Thai,2024-03-09T00:00:00.000,40.84,-73.86\n",
            )
            .create_async()
            .await;

        let extractor = SocrataExtractor::new(test_config(server.url())).unwrap();
        let rows = extractor.inspections().await.unwrap();

        mock.assert_async().await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "Kabul Kitchen");
        assert_eq!(rows[1].cuisine, "Thai");
    }

    #[tokio::test]
    async fn test_server_errors_fail_without_retry() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", INSPECTIONS_RESOURCE)
            .match_query(mockito::Matcher::Any)
            .with_status(500)
            .expect(1)
            .create_async()
            .await;

        let extractor = SocrataExtractor::new(test_config(server.url())).unwrap();
        let result = extractor.inspections().await;

        mock.assert_async().await;
        assert!(matches!(result, Err(ExtractError::Request(_))));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_a_parse_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", INSPECTIONS_RESOURCE)
            .match_query(mockito::Matcher::Any)
            .with_body(
                "id,name,borough,cuisine,inspection_date,lat,lng\n\
                 1,Kabul Kitchen,Queens,Afghan,2024-06-17,not-a-float,-73.89\n",
            )
            .create_async()
            .await;

        let extractor = SocrataExtractor::new(test_config(server.url())).unwrap();
        let result = extractor.inspections().await;

        assert!(matches!(result, Err(ExtractError::Parse(_))));
    }

    #[tokio::test]
    async fn test_fastfood_names_round_trip_through_cache() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", FASTFOOD_RESOURCE)
            .match_query(mockito::Matcher::Any)
            .with_body("name\nBurger Planet\nShake Stack\n")
            .expect(1)
            .create_async()
            .await;

        let config = test_config(server.url());
        let cache = config.fastfood_cache.clone();
        let extractor = SocrataExtractor::new(config).unwrap();

        let names = extractor.fastfood_names().await.unwrap();
        assert!(names.contains("Burger Planet"));
        assert!(cache.exists());

        // Second call is served from the cache; the mock saw one request.
        let cached = extractor.fastfood_names().await.unwrap();
        mock.assert_async().await;
        assert_eq!(cached, names);

        std::fs::remove_file(cache).ok();
    }
}
