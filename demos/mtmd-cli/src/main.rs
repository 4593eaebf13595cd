//! Describe images and video frames with a multimodal model
//!
//! ```console
//! cargo run -p mtmd-cli --features llama -- \
//!     -m MiniCPM-V-4-Q4_K_M.gguf -p mmproj-model-f16.gguf \
//!     -i photo.jpg "What is in this picture?"
//! ```

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use mtmd_ios::{Role, Session, SessionParams};
use tracing_subscriber::EnvFilter;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the language model (GGUF)
    #[arg(short, long)]
    model: PathBuf,

    /// Path to the multimodal projector (mmproj GGUF)
    #[arg(short = 'p', long)]
    mmproj: PathBuf,

    /// Images to prefill, in order
    #[arg(short, long)]
    image: Vec<PathBuf>,

    /// Video frames to prefill after the images, downscaled before projection
    #[arg(short, long)]
    frame: Vec<PathBuf>,

    /// Optional system prompt
    #[arg(short, long)]
    system: Option<String>,

    /// The question
    #[arg(default_value = "Describe this image in detail.")]
    prompt: String,

    /// Tokens to generate; 0 or less runs until the model stops
    #[arg(short, long, default_value_t = 100)]
    n_predict: i32,

    /// Context size
    #[arg(short = 'c', long, default_value_t = 4096)]
    ctx_size: u32,

    /// Number of threads to use
    #[arg(short, long, default_value_t = 4)]
    threads: i32,

    /// Sampling temperature, 0 for greedy
    #[arg(long, default_value_t = 0.7)]
    temperature: f32,

    /// Sampler seed
    #[arg(long)]
    seed: Option<u64>,

    /// Keep the language model on the CPU
    #[arg(long)]
    cpu: bool,

    /// Keep the projector on the CPU
    #[arg(long)]
    mmproj_cpu: bool,

    /// Skip the warmup evaluation
    #[arg(long)]
    no_warmup: bool,
}

impl Args {
    fn session_params(&self) -> SessionParams {
        let params = SessionParams::default()
            .with_model_path(&self.model)
            .with_mmproj_path(&self.mmproj)
            .with_n_predict(self.n_predict)
            .with_n_ctx(self.ctx_size)
            .with_n_threads(self.threads)
            .with_temperature(self.temperature)
            .with_use_gpu(!self.cpu)
            .with_mmproj_use_gpu(!self.mmproj_cpu)
            .with_warmup(!self.no_warmup);
        match self.seed {
            Some(seed) => params.with_seed(seed),
            None => params,
        }
    }
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut session = Session::new(&args.session_params()).context("Failed to create session")?;

    for image in &args.image {
        session
            .prefill_image(image)
            .with_context(|| format!("Failed to prefill image {}", image.display()))?;
    }
    for frame in &args.frame {
        session
            .prefill_frame(frame)
            .with_context(|| format!("Failed to prefill frame {}", frame.display()))?;
    }
    if let Some(system) = &args.system {
        session
            .prefill_text(system, Role::System)
            .context("Failed to prefill system prompt")?;
    }
    session
        .prefill_text(&args.prompt, Role::User)
        .context("Failed to prefill prompt")?;

    let mut stdout = std::io::stdout().lock();
    for piece in session.tokens() {
        let piece = piece.context("Generation failed")?;
        stdout.write_all(piece.as_bytes())?;
        stdout.flush()?;
    }
    writeln!(stdout)?;

    tracing::info!(n_past = session.n_past(), n_ctx = session.n_ctx(), "done");
    Ok(())
}
