//! In-process image generation

use anyhow::{Context, Result};
use clap::Args;
use seedalchemy_core::frames::Frame;
use seedalchemy_core::{metadata, Config, ImageRequest, ModelRegistry, OutputStore};
use seedalchemy_engine::{Session, Worker};
use seedalchemy_runtime_diffusion::CandleLoader;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Args, Debug, Default)]
pub struct GenerateArgs {
    /// Text prompt
    #[arg(short, long)]
    pub prompt: Option<String>,

    /// Negative prompt
    #[arg(long)]
    pub negative_prompt: Option<String>,

    /// Full request as JSON; flags given alongside override its fields
    #[arg(long)]
    pub request: Option<PathBuf>,

    /// Registered model name
    #[arg(short, long)]
    pub model: Option<String>,

    /// Scheduler id
    #[arg(long)]
    pub scheduler: Option<String>,

    #[arg(short, long)]
    pub steps: Option<u32>,

    #[arg(long)]
    pub cfg_scale: Option<f64>,

    #[arg(long)]
    pub width: Option<u32>,

    #[arg(long)]
    pub height: Option<u32>,

    #[arg(long)]
    pub seed: Option<u64>,

    /// Number of images
    #[arg(short = 'n', long)]
    pub count: Option<u32>,

    #[arg(long)]
    pub user: Option<String>,

    #[arg(long)]
    pub collection: Option<String>,
}

impl GenerateArgs {
    /// The request file (or the defaults) with the flags applied.
    pub fn into_request(self) -> Result<ImageRequest> {
        let mut req = match &self.request {
            Some(path) => {
                let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
                metadata::parse_metadata(&text)?
            }
            None => ImageRequest::default(),
        };

        match self.prompt {
            Some(prompt) => req.prompt = prompt,
            None if self.request.is_none() => anyhow::bail!("Either --prompt or --request is required"),
            None => {}
        }
        if let Some(v) = self.negative_prompt {
            req.negative_prompt = v;
        }
        if let Some(v) = self.model {
            req.model = v;
        }
        if let Some(v) = self.scheduler {
            req.scheduler = v;
        }
        if let Some(v) = self.steps {
            req.steps = v;
        }
        if let Some(v) = self.cfg_scale {
            req.cfg_scale = v;
        }
        if let Some(v) = self.width {
            req.width = v;
        }
        if let Some(v) = self.height {
            req.height = v;
        }
        if let Some(v) = self.seed {
            req.seed = v;
        }
        if let Some(v) = self.count {
            req.image_count = v;
        }
        if let Some(v) = self.user {
            req.user = v;
        }
        if let Some(v) = self.collection {
            req.collection = v;
        }
        Ok(req)
    }
}

pub async fn execute(args: GenerateArgs) -> Result<()> {
    let req = args.into_request()?;
    let config = Config::load()?;

    println!("Model: {}", req.model);
    println!("Prompt: {}", req.prompt);
    println!("Size: {}x{}, {} steps, seed {}", req.width, req.height, req.steps, req.seed);
    println!();

    let loader = CandleLoader::from_config(&config)?;
    let registry = Arc::new(ModelRegistry::from_config(&config.models)?);
    let store = OutputStore::new(&config.storage.storage_path);
    let mut worker = Worker::new(Arc::new(loader), registry, store.clone());

    let (session, mut frames) = Session::new();
    let printer = tokio::spawn(async move {
        while let Some(bytes) = frames.recv().await {
            match Frame::decode(&bytes) {
                Ok(Frame::Progress { percent, .. }) => {
                    eprint!("\rProgress: {:>3}%", percent);
                    let _ = std::io::stderr().flush();
                }
                Ok(Frame::Error { message, .. }) => eprintln!("\nImage failed: {}", message),
                _ => {}
            }
        }
    });

    let start = std::time::Instant::now();
    let worker_session = Arc::clone(&session);
    let user = req.user.clone();
    let outcome = tokio::task::spawn_blocking(move || worker.generate(&req, Some(&*worker_session))).await??;
    drop(session);
    printer.await?;
    eprintln!();

    println!("Generation completed in {:.2}s", start.elapsed().as_secs_f64());
    for path in &outcome.paths {
        println!("{}", store.image_path(&user, path)?.display());
    }
    for error in &outcome.errors {
        println!("error: {}", error);
    }

    Ok(())
}
