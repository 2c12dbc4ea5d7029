//! Subcommand implementations. Every command prints one JSON document on
//! stdout.

use anyhow::{Context, Result};
use serde::Serialize;

use gearcache_core::{AppConfig, Destination, Manifest, Request};
use gearcache_worker::{CacheWorker, InstallOutcome};

use crate::args::{FetchArgs, InstallArgs};

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn install(args: InstallArgs, config: &AppConfig) -> Result<()> {
    let path = match args.manifest {
        Some(path) => path,
        None => config.require_manifest_path()?.to_path_buf(),
    };
    let manifest = Manifest::load(&path).with_context(|| format!("loading manifest {}", path.display()))?;

    let worker = CacheWorker::open(config).await?;
    let mut outcome = worker.install(manifest).await?;

    if args.activate && matches!(outcome, InstallOutcome::Waiting(_)) {
        outcome = InstallOutcome::Activated(worker.activate_waiting().await?);
    }

    worker.settle().await;
    print_json(&outcome)
}

pub async fn activate(config: &AppConfig) -> Result<()> {
    let worker = CacheWorker::open(config).await?;
    let generation = worker.activate_waiting().await?;
    worker.settle().await;
    print_json(&InstallOutcome::Activated(generation))
}

#[derive(Serialize)]
struct FetchOutput<'a> {
    url: &'a str,
    status: u16,
    source: &'a gearcache_worker::ResponseSource,
    content_type: Option<&'a str>,
    bytes: usize,
}

pub async fn fetch(args: FetchArgs, config: &AppConfig) -> Result<()> {
    let worker = CacheWorker::open(config).await?;
    let url = worker.resolve(&args.url)?;

    let request = match args.navigate {
        true => Request::navigation(url),
        false => Request::get(url, Destination::from(args.destination)),
    };
    let request = request.with_method(args.method);

    let response = worker.handle(&request).await;
    worker.settle().await;
    let response = response?;

    print_json(&FetchOutput {
        url: request.url.as_str(),
        status: response.payload.status,
        source: &response.source,
        content_type: response.payload.content_type(),
        bytes: response.payload.body.len(),
    })
}

pub async fn status(config: &AppConfig) -> Result<()> {
    let worker = CacheWorker::open(config).await?;
    print_json(&worker.status().await?)
}

pub async fn expire(config: &AppConfig) -> Result<()> {
    let worker = CacheWorker::open(config).await?;
    let reports = worker.expire_all().await?;
    print_json(&reports)
}
