use anyhow::{anyhow, Result};
use clap::{Arg, ArgMatches, Command};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vidscribe::config::Config;
use vidscribe::llm::{create_llm, Enricher};
use vidscribe::notify::Notifier;
use vidscribe::processing::{ask_video, submit_video, PipelineServices, VideoPipeline};
use vidscribe::queue::{EnqueueRequest, JobQueue, JobStatus};
use vidscribe::state::{FileVideoRepository, RecordReset, VideoRepository};
use vidscribe::worker::WorkerPool;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let default_filter = if matches.get_flag("verbose") {
        "vidscribe=debug,info"
    } else {
        "vidscribe=info,warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    let config = load_config(matches.get_one::<String>("config").map(PathBuf::from))?;

    match matches.subcommand() {
        Some(("worker", sub)) => run_worker(config, sub).await,
        Some(("enqueue", sub)) => run_enqueue(config, sub).await,
        Some(("status", sub)) => run_status(config, sub).await,
        Some(("ask", sub)) => run_ask(config, sub).await,
        Some(("init-config", sub)) => run_init_config(sub),
        #[cfg(feature = "api")]
        Some(("serve", sub)) => run_serve(config, sub).await,
        _ => Err(anyhow!("unknown command, see --help")),
    }
}

fn cli() -> Command {
    let command = Command::new("vidscribe")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Durable video transcription and summarization pipeline")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file")
                .global(true),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(
            Command::new("worker").about("Process queued videos until interrupted").arg(
                Arg::new("workers")
                    .short('w')
                    .long("workers")
                    .value_name("NUM")
                    .help("Number of concurrent jobs")
                    .value_parser(clap::value_parser!(usize)),
            ),
        )
        .subcommand(
            Command::new("enqueue")
                .about("Submit a video for processing")
                .arg(Arg::new("video-id").value_name("VIDEO_ID").required(true))
                .arg(Arg::new("source-url").value_name("SOURCE_URL").required(true))
                .arg(
                    Arg::new("language")
                        .short('l')
                        .long("language")
                        .value_name("LANGUAGE")
                        .help("Spoken language, name or code")
                        .default_value("english"),
                ),
        )
        .subcommand(
            Command::new("status")
                .about("Show one video or the queue totals")
                .arg(Arg::new("video-id").value_name("VIDEO_ID")),
        )
        .subcommand(
            Command::new("ask")
                .about("Ask a question about a completed video")
                .arg(Arg::new("video-id").value_name("VIDEO_ID").required(true))
                .arg(Arg::new("question").value_name("QUESTION").required(true)),
        )
        .subcommand(
            Command::new("init-config").about("Write a default configuration file").arg(
                Arg::new("output")
                    .value_name("FILE")
                    .default_value("vidscribe.toml"),
            ),
        );

    #[cfg(feature = "api")]
    let command = command.subcommand(
        Command::new("serve")
            .about("Run the HTTP API together with the workers")
            .arg(
                Arg::new("port")
                    .short('p')
                    .long("port")
                    .value_name("PORT")
                    .default_value("8080")
                    .value_parser(clap::value_parser!(u16)),
            ),
    );

    command
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(&path),
        None => Ok(Config::load().unwrap_or_else(|e| {
            warn!("Failed to load config, using defaults: {}", e);
            Config::default()
        })),
    }
}

async fn open_records(config: &Config) -> Result<Arc<dyn VideoRepository>> {
    Ok(Arc::new(FileVideoRepository::open(config.storage.videos_dir()).await?))
}

/// The queue and the video records, with every new run resetting its record
async fn open_stores(config: &Config) -> Result<(Arc<JobQueue>, Arc<dyn VideoRepository>)> {
    let records = open_records(config).await?;
    let queue = JobQueue::open(config.storage.jobs_dir(), config.queue.clone())
        .await?
        .with_run_listener(Arc::new(RecordReset::new(records.clone())));
    Ok((Arc::new(queue), records))
}

/// Everything a worker process needs, wired from the configuration
async fn build_pool(config: &Config) -> Result<(WorkerPool, Arc<VideoPipeline>)> {
    let (queue, records) = open_stores(config).await?;
    let notifier = Arc::new(Notifier::new(config.notifications.channel_capacity));

    let services = PipelineServices::from_config(config, records, notifier)?;
    let pipeline = Arc::new(VideoPipeline::new(services, queue, config));
    Ok((WorkerPool::new(pipeline.clone(), config), pipeline))
}

async fn run_worker(mut config: Config, matches: &ArgMatches) -> Result<()> {
    if let Some(workers) = matches.get_one::<usize>("workers") {
        config.queue.worker_concurrency = *workers;
    }
    config.validate()?;
    info!("{}", config.summary());

    let (pool, _pipeline) = build_pool(&config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = pool.start(shutdown_rx);

    tokio::signal::ctrl_c().await?;
    info!("🛑 Shutdown requested, finishing active attempts");
    let _ = shutdown_tx.send(true);
    futures::future::join_all(handles).await;

    info!("👋 Worker process stopped");
    Ok(())
}

async fn run_enqueue(config: Config, matches: &ArgMatches) -> Result<()> {
    let request = EnqueueRequest::new(
        required(matches, "video-id")?,
        required(matches, "source-url")?,
        required(matches, "language")?,
    );

    let (queue, _records) = open_stores(&config).await?;
    let outcome = submit_video(&queue, request.clone(), config.download.require_https).await?;

    info!("📥 {}: {:?}", request.video_id.trim(), outcome);
    println!("{:?}", outcome);
    Ok(())
}

async fn run_status(config: Config, matches: &ArgMatches) -> Result<()> {
    let (queue, records) = open_stores(&config).await?;

    let Some(video_id) = matches.get_one::<String>("video-id") else {
        let counts = queue.counts().await;
        for status in [JobStatus::Queued, JobStatus::Active, JobStatus::Completed, JobStatus::Failed] {
            println!("{:<10} {}", status, counts.get(&status).copied().unwrap_or(0));
        }
        return Ok(());
    };

    let job = queue.get(video_id).await;
    let record = records.get(video_id).await?;
    if job.is_none() && record.is_none() {
        return Err(anyhow!("unknown video {}", video_id));
    }

    let status = serde_json::json!({ "job": job, "video": record });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn run_ask(config: Config, matches: &ArgMatches) -> Result<()> {
    config.validate()?;
    let video_id = required(matches, "video-id")?;
    let question = required(matches, "question")?;

    let records = open_records(&config).await?;
    let enricher = Enricher::new(create_llm(&config.llm)?, None, config.llm.clone());

    let answer = ask_video(records.as_ref(), &enricher, &video_id, &question).await?;
    println!("{}", answer);
    Ok(())
}

fn run_init_config(matches: &ArgMatches) -> Result<()> {
    let output = required(matches, "output")?;
    let path = Path::new(&output);
    if path.exists() {
        return Err(anyhow!("{} already exists", path.display()));
    }
    Config::default().save(path)
}

#[cfg(feature = "api")]
async fn run_serve(config: Config, matches: &ArgMatches) -> Result<()> {
    use vidscribe::api::{ApiServer, AppState};

    config.validate()?;
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);

    let (pool, pipeline) = build_pool(&config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = pool.start(shutdown_rx);

    let services = pipeline.services();
    let state = AppState {
        queue: pipeline.queue().clone(),
        records: services.records.clone(),
        notifier: services.notifier.clone(),
        enricher: services.enricher.clone(),
        config: Arc::new(config),
    };
    let server = ApiServer::new(state, port).start_background();

    tokio::select! {
        result = server => {
            result??;
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("🛑 Shutdown requested, finishing active attempts");
        }
    }

    let _ = shutdown_tx.send(true);
    futures::future::join_all(handles).await;
    Ok(())
}

fn required(matches: &ArgMatches, name: &str) -> Result<String> {
    matches
        .get_one::<String>(name)
        .cloned()
        .ok_or_else(|| anyhow!("missing argument {}", name))
}
