use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use cutout_core::{
    JobId, JobReport, Pipeline, PipelineConfig, PipelineEvent, Services, SourceInput,
};
use tokio::sync::broadcast;

/// What to process and where to write it.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub inputs: Vec<String>,
    pub out_dir: PathBuf,
    pub config: PipelineConfig,
}

/// Outcome counts for a run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub written: usize,
    pub failed: usize,
}

/// Run the pipeline over every input (no GUI)
pub fn run(options: RunOptions) {
    crate::init_logging(&["cutout=info", "cutout_core=info", "cutout_lib=info"]);
    tracing::info!(inputs = options.inputs.len(), "Starting cutout");

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    let result = rt.block_on(async {
        let services = Services::defaults(&options.config)?;
        process(options, services).await
    });

    match result {
        Ok(summary) if summary.failed == 0 => {
            tracing::info!(written = summary.written, "Done");
        }
        Ok(summary) => {
            tracing::warn!(
                written = summary.written,
                failed = summary.failed,
                "Done with failures"
            );
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!("Run failed: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Submit every input, wait for the batch to drain and write the results.
///
/// Inputs that cannot be read count as failures; they never stop the run.
pub async fn process(options: RunOptions, services: Services) -> anyhow::Result<RunSummary> {
    let RunOptions {
        inputs,
        out_dir,
        config,
    } = options;

    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;

    let pipeline = Pipeline::spawn(config, services)?;
    let reporter = tokio::spawn(log_events(pipeline.events()));

    let mut summary = RunSummary::default();
    let mut names = HashSet::new();
    let mut jobs: Vec<(JobId, String, PathBuf)> = Vec::new();
    for input in &inputs {
        let source = match source_for(input) {
            Ok(source) => source,
            Err(e) => {
                tracing::error!(input = %input, "Skipping: {:#}", e);
                summary.failed += 1;
                continue;
            }
        };
        let job_id = pipeline.submit(source)?;
        let name = unique_name(&mut names, output_stem(input));
        jobs.push((job_id, input.clone(), out_dir.join(name)));
    }

    pipeline.start_batch()?;
    let snapshot = pipeline.drained().await?;
    tracing::info!(
        completed = snapshot.completed,
        failed = snapshot.failed,
        "Batch finished"
    );

    for (job_id, input, path) in jobs {
        match pipeline.collect(job_id).await? {
            Some(JobReport {
                result: Some(output),
                ..
            }) => {
                std::fs::write(&path, &output.bytes)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                tracing::info!(input = %input, output = %path.display(), "Wrote cutout");
                summary.written += 1;
            }
            Some(JobReport {
                error: Some(error), ..
            }) => {
                tracing::error!(input = %input, error = %error, "Background removal failed");
                summary.failed += 1;
            }
            other => {
                tracing::warn!(input = %input, report = ?other, "No result for input");
                summary.failed += 1;
            }
        }
    }

    pipeline.shutdown().await;
    reporter.abort();
    Ok(summary)
}

/// URLs are fetched by the pipeline; anything else is read as a file.
fn source_for(input: &str) -> anyhow::Result<SourceInput> {
    if input.starts_with("http://") || input.starts_with("https://") {
        return Ok(SourceInput::url(input));
    }
    let bytes = std::fs::read(input).with_context(|| format!("Failed to read {}", input))?;
    Ok(SourceInput::from(bytes))
}

/// File stem of an input path or URL, ignoring any query or fragment.
fn output_stem(input: &str) -> String {
    let path = match input.split_once("://") {
        Some((_, rest)) => rest.split(['?', '#']).next().unwrap_or(rest),
        None => input,
    };
    let name = path
        .trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(path);
    Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("image")
        .to_string()
}

/// `<stem>.png`, or `<stem>-<n>.png` when an earlier input took the name.
fn unique_name(taken: &mut HashSet<String>, stem: String) -> String {
    let mut name = format!("{}.png", stem);
    let mut n = 1;
    while !taken.insert(name.clone()) {
        name = format!("{}-{}.png", stem, n);
        n += 1;
    }
    name
}

async fn log_events(mut events: broadcast::Receiver<PipelineEvent>) {
    loop {
        match events.recv().await {
            Ok(PipelineEvent::ModelProgress {
                worker,
                state,
                progress,
            }) => {
                tracing::info!(worker = %worker, state = ?state, progress, "Segmentation model");
            }
            Ok(PipelineEvent::WorkerRespawned { worker, generation }) => {
                tracing::warn!(worker = %worker, generation, "Worker restarted");
            }
            Ok(PipelineEvent::PoolDegraded { stage, live }) => {
                tracing::warn!(stage = %stage, live, "Running with fewer workers");
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Event log fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use async_trait::async_trait;
    use cutout_core::{
        HttpFetcher, LoadProgress, ModelLoader, PngCompositor, SegmentationModel,
        StandardDecoder,
    };
    use image::{GrayImage, Luma, Rgba, RgbaImage};

    #[test]
    fn test_output_stem() {
        assert_eq!(output_stem("photos/cat.jpeg"), "cat");
        assert_eq!(output_stem("https://example.com/img/dog.webp?size=2"), "dog");
        assert_eq!(output_stem("https://example.com/img/dog.webp?next=/a/b.png#x"), "dog");
        assert_eq!(output_stem("https://example.com/"), "example");
    }

    #[test]
    fn test_unique_name_suffixes_clashes() {
        let mut taken = HashSet::new();
        assert_eq!(unique_name(&mut taken, "cat".into()), "cat.png");
        assert_eq!(unique_name(&mut taken, "cat".into()), "cat-1.png");
        assert_eq!(unique_name(&mut taken, "cat".into()), "cat-2.png");
        assert_eq!(unique_name(&mut taken, "cat-1".into()), "cat-1-1.png");
        assert_eq!(unique_name(&mut taken, "dog".into()), "dog.png");
    }

    #[test]
    fn test_source_for_reads_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("a.png");
        std::fs::write(&path, b"bytes").unwrap();

        let source = source_for(path.to_str().unwrap()).unwrap();
        assert_eq!(source, SourceInput::from(b"bytes".to_vec()));
        assert!(source_for(temp_dir.path().join("missing.png").to_str().unwrap()).is_err());
    }

    #[test]
    fn test_source_for_keeps_urls() {
        assert_eq!(
            source_for("https://example.com/a.png").unwrap(),
            SourceInput::url("https://example.com/a.png")
        );
    }

    // ========================================================================
    // Full run
    // ========================================================================

    struct Foreground;

    impl SegmentationModel for Foreground {
        fn infer(&self, raster: &RgbaImage) -> anyhow::Result<GrayImage> {
            Ok(GrayImage::from_pixel(raster.width(), raster.height(), Luma([255])))
        }
    }

    struct InstantLoader;

    #[async_trait]
    impl ModelLoader for InstantLoader {
        async fn load(&self, progress: LoadProgress) -> anyhow::Result<Arc<dyn SegmentationModel>> {
            progress(1.0);
            Ok(Arc::new(Foreground))
        }
    }

    fn create_test_services() -> Services {
        Services {
            fetcher: Arc::new(HttpFetcher::new(std::time::Duration::from_secs(1)).unwrap()),
            decoder: Arc::new(StandardDecoder::new(None)),
            loader: Arc::new(InstantLoader),
            compositor: Arc::new(PngCompositor),
        }
    }

    fn create_test_image(path: &Path, width: u32, height: u32) {
        RgbaImage::from_pixel(width, height, Rgba([1, 2, 3, 255]))
            .save(path)
            .unwrap();
    }

    #[tokio::test]
    async fn test_process_writes_outputs_and_counts_failures() {
        let temp_dir = tempfile::tempdir().unwrap();
        let first = temp_dir.path().join("first.png");
        let second = temp_dir.path().join("second.png");
        let broken = temp_dir.path().join("broken.png");
        create_test_image(&first, 6, 4);
        create_test_image(&second, 3, 3);
        std::fs::write(&broken, b"not a png").unwrap();

        let out_dir = temp_dir.path().join("out");
        let options = RunOptions {
            inputs: vec![
                first.display().to_string(),
                second.display().to_string(),
                broken.display().to_string(),
                temp_dir.path().join("missing.png").display().to_string(),
            ],
            out_dir: out_dir.clone(),
            config: PipelineConfig::default().with_pool_sizes(1, 1, 1),
        };

        let summary = process(options, create_test_services()).await.unwrap();
        assert_eq!(
            summary,
            RunSummary {
                written: 2,
                failed: 2
            }
        );

        let written = image::open(out_dir.join("first.png")).unwrap().into_rgba8();
        assert_eq!(written.dimensions(), (6, 4));
        assert_eq!(written.get_pixel(0, 0), &Rgba([1, 2, 3, 255]));
        assert!(out_dir.join("second.png").exists());
        assert!(!out_dir.join("broken.png").exists());
    }

    #[tokio::test]
    async fn test_process_keeps_inputs_with_the_same_stem() {
        let temp_dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("a")).unwrap();
        std::fs::create_dir_all(temp_dir.path().join("b")).unwrap();
        let first = temp_dir.path().join("a").join("cat.png");
        let second = temp_dir.path().join("b").join("cat.png");
        create_test_image(&first, 6, 4);
        create_test_image(&second, 3, 3);

        let out_dir = temp_dir.path().join("out");
        let options = RunOptions {
            inputs: vec![first.display().to_string(), second.display().to_string()],
            out_dir: out_dir.clone(),
            config: PipelineConfig::default().with_pool_sizes(1, 1, 1),
        };

        let summary = process(options, create_test_services()).await.unwrap();
        assert_eq!(
            summary,
            RunSummary {
                written: 2,
                failed: 0
            }
        );

        let files = std::fs::read_dir(&out_dir).unwrap().count();
        assert_eq!(files, 2);
        let first_out = image::open(out_dir.join("cat.png")).unwrap();
        let second_out = image::open(out_dir.join("cat-1.png")).unwrap();
        assert_eq!((first_out.width(), first_out.height()), (6, 4));
        assert_eq!((second_out.width(), second_out.height()), (3, 3));
    }
}
