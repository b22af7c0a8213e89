use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{error, info, warn};

use docket_core::processor::{
    AddressFactory, DeferredChatModel, DeferredTesseract, GeocodeConfig, GeocodeFactory,
    NominatimGeocoder, Pdf2TextFactory, SummarizeConfig, SummarizeFactory,
};
use docket_core::{
    reshape, ArtifactStore, Jurisdiction, Pipeline, PipelineConfig, PipelineResult,
    ProcessorRegistry, SourceDescriptor, SourceDirectory, Storage,
};

use crate::cli::Cli;

pub async fn run(cli: &Cli) -> Result<()> {
    let sources = discover(cli).await?;
    if sources.is_empty() {
        info!(root = %cli.sources.display(), "no source documents found");
        return Ok(());
    }

    let config = match &cli.pipeline {
        Some(path) => PipelineConfig::from_json_file(path)
            .await
            .with_context(|| format!("Failed to load pipeline from {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    let registry = registry(&config)?;
    let pipeline = Pipeline::new(config, registry, ArtifactStore::new(&cli.artifacts))?;

    let storage = if cli.no_persist {
        None
    } else {
        Some(
            Storage::open(&cli.database)
                .await
                .with_context(|| format!("Failed to open database {}", cli.database))?,
        )
    };

    let mut failed = 0usize;
    for source in &sources {
        match process(&pipeline, storage.as_ref(), source).await {
            Ok(result) => {
                if !cli.quiet {
                    print_result(&result);
                }
            }
            Err(e) => {
                failed += 1;
                error!(source = %source.label(), error = %format!("{e:#}"), "pipeline failed");
            }
        }
    }

    info!(total = sources.len(), failed, "batch finished");
    if failed > 0 {
        bail!("{failed} of {} sources failed", sources.len());
    }
    Ok(())
}

async fn discover(cli: &Cli) -> Result<Vec<SourceDescriptor>> {
    let jurisdiction = Jurisdiction::new(&cli.state_abbrv, &cli.state, &cli.city, &cli.municipal);

    let mut sources = Vec::new();
    for doctype in &cli.doctypes {
        for year in &cli.years {
            let dir = SourceDirectory::new(&cli.sources, jurisdiction.clone(), doctype, year);
            let found = dir
                .descriptors()
                .await
                .with_context(|| format!("Failed to read sources in {}", dir.dir().display()))?;
            info!(doctype, year, count = found.len(), "discovered sources");
            sources.extend(found);
        }
    }
    Ok(sources)
}

/// Builds the processors the pipeline names. OCR tools and the model key are
/// looked up only when a stage actually computes, so cached re-runs need
/// neither.
fn registry(config: &PipelineConfig) -> Result<ProcessorRegistry> {
    let mut registry = ProcessorRegistry::new();

    for spec in &config.stages {
        match spec.processor.as_str() {
            "pdf2text" => {
                registry.register(Pdf2TextFactory::new(Arc::new(DeferredTesseract::new())));
            }
            "address" => registry.register(AddressFactory::new()?),
            "summarize" => {
                let config = SummarizeConfig::default();
                let model = DeferredChatModel::new(config.clone());
                registry.register(SummarizeFactory::new(Arc::new(model), config));
            }
            "geocode" => {
                let geocoder = NominatimGeocoder::new(&GeocodeConfig::default())?;
                registry.register(GeocodeFactory::new(Arc::new(geocoder)));
            }
            // Left for PipelineConfig::validate to reject.
            other => warn!(processor = other, "no built-in processor with this name"),
        }
    }

    Ok(registry)
}

async fn process(
    pipeline: &Pipeline,
    storage: Option<&Storage>,
    source: &SourceDescriptor,
) -> Result<PipelineResult> {
    let run = pipeline.run(source).await?;
    for (stage, tag) in run.soft_errors() {
        warn!(stage, %tag, "soft failure");
    }

    let result = reshape(&run.outputs)?;
    if let Some(storage) = storage {
        let ids = storage.persist(&result).await?;
        info!(source = %source.label(), records = ids.len(), "persisted");
    }
    Ok(result)
}

fn print_result(result: &PipelineResult) {
    println!("{}", result.source.label());
    for record in &result.parsed {
        match record.coords {
            Some(c) => println!("  {} ({:.5}, {:.5})", record.street, c.lat, c.lon),
            None => println!("  {}", record.street),
        }
        if !record.addresses.aliases.is_empty() {
            println!("    aliases: {}", record.addresses.aliases.join(", "));
        }
        for summary in &record.summaries {
            println!(
                "    [page {}] {}: {}",
                summary.page + 1,
                summary.status.as_str(),
                summary.summary
            );
            if !summary.tags.is_empty() {
                println!("      tags: {}", summary.tags.join(", "));
            }
        }
    }
}
