use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{NaiveDate, Utc};
use tracing::{error, info};

use crate::config::Config;
use crate::error::PipelineError;
use crate::extract::{Extract, SocrataExtractor};
use crate::store::Store;
use crate::transform;

/// Stat the storage file. Absence is the fresh-build trigger, not an
/// error; any other filesystem failure is fatal and must not be conflated
/// with it.
pub fn probe_storage(path: &Path) -> Result<Option<SystemTime>, io::Error> {
    match std::fs::metadata(path) {
        Ok(metadata) => Ok(Some(metadata.modified()?)),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(error) => {
            error!("could not stat storage file {}: {error}", path.display());
            Err(error)
        }
    }
}

/// What a pipeline run will do, decided once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPlan {
    /// No storage file: build the schema and all three tables from scratch.
    Build,
    /// Storage file older than the update interval: refresh the fact table
    /// and dimension attributes only.
    Update,
    /// Storage file is current: leave everything alone.
    Skip,
}

impl RunPlan {
    pub fn decide(last_modified: Option<SystemTime>, now: SystemTime, interval: Duration) -> Self {
        match last_modified {
            None => RunPlan::Build,
            Some(modified) => {
                // A modification time in the future reads as zero elapsed.
                let since_edit = now.duration_since(modified).unwrap_or_default();
                if since_edit > interval {
                    RunPlan::Update
                } else {
                    RunPlan::Skip
                }
            }
        }
    }
}

/// The orchestrator: owns the store, the extractor and the configuration.
/// `run` consumes the pipeline, so a second run within one process is a
/// compile error rather than a guarded no-op.
pub struct Pipeline {
    store: Store,
    extractor: Arc<dyn Extract>,
    config: Config,
    plan: RunPlan,
}

impl Pipeline {
    pub async fn new(config: Config) -> Result<Self, PipelineError> {
        // The probe must precede the connect: connecting creates the file.
        let last_modified = probe_storage(&config.database_path)?;
        let plan = RunPlan::decide(
            last_modified,
            SystemTime::now(),
            config.update_interval.0,
        );

        let extractor = Arc::new(SocrataExtractor::new(config.upstream.clone())?);
        let store = Store::connect(&config.database_path).await?;

        Ok(Self::assemble(store, extractor, config, plan))
    }

    /// Wire a pipeline from pre-built parts. This is the seam tests use to
    /// inject a stub extractor and an in-memory store.
    pub fn assemble(
        store: Store,
        extractor: Arc<dyn Extract>,
        config: Config,
        plan: RunPlan,
    ) -> Self {
        Self {
            store,
            extractor,
            config,
            plan,
        }
    }

    pub fn plan(&self) -> RunPlan {
        self.plan
    }

    /// Execute the decided plan and hand the store back for serving.
    /// Failures propagate; there are no retries at this level.
    pub async fn run(self) -> Result<Store, PipelineError> {
        match self.plan {
            RunPlan::Build => self.build().await,
            RunPlan::Update => self.update().await,
            RunPlan::Skip => {
                info!("storage is current; skipping refresh");
                Ok(self.store)
            }
        }
    }

    async fn extract_and_transform(
        &self,
    ) -> Result<(Vec<transform::FactRow>, std::collections::HashMap<String, i64>), PipelineError>
    {
        let raw = self.extractor.inspections().await?;
        let fastfood = self.extractor.fastfood_names().await?;
        let populations = self.extractor.populations()?;

        // Dimension ids are recomputed from the constants every run, never
        // read back from storage; the constants are what keep them stable.
        let borough_codes = transform::borough_codes();
        let cuisine_codes = transform::cuisine_codes();

        let cleaned = transform::clean(
            raw,
            &fastfood,
            &transform::CUISINES,
            &transform::BOROUGHS,
        )?;
        let facts = transform::normalize(cleaned, &borough_codes, &cuisine_codes);

        Ok((facts, populations))
    }

    async fn build(self) -> Result<Store, PipelineError> {
        info!("no storage found; running full build");

        let (facts, populations) = self.extract_and_transform().await?;

        let borough_codes = transform::borough_codes();
        let cuisine_codes = transform::cuisine_codes();
        let boroughs = transform::borough_rows(&borough_codes, &populations);
        let cuisines = transform::cuisine_rows(&cuisine_codes);

        // Each load below is transactional on its own, but the trio is
        // not atomic as a unit; a failure mid-sequence is recovered by
        // deleting the storage file and rerunning.
        self.store.create_schema().await?;
        self.store.fresh_boroughs(&boroughs).await?;
        self.store.fresh_cuisines(&cuisines).await?;
        self.store.fresh_restaurants(&facts).await?;

        info!(restaurants = facts.len(), "full build complete");
        Ok(self.store)
    }

    async fn update(self) -> Result<Store, PipelineError> {
        info!("storage is stale; running incremental update");

        let (facts, populations) = self.extract_and_transform().await?;

        let expired = self.store.delete_expired(self.expiry_cutoff()).await?;
        let inserted = self.store.upsert_new(&facts).await?;
        self.store.update_population(&populations).await?;

        info!(expired, inserted, "incremental update complete");
        Ok(self.store)
    }

    fn expiry_cutoff(&self) -> NaiveDate {
        let years = i64::from(self.config.upstream.cutoff_years);
        (Utc::now() - chrono::Duration::days(years * 365)).date_naive()
    }
}
