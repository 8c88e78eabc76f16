use std::path::PathBuf;

use candle_core::DType;
use clap::Parser;
use env_logger::Env;
use llama_dispatch::distributed::{init_process_group, ProcessGroupConfig};
use llama_dispatch::generation::GenerateOptions;
use llama_dispatch::inference::{LlamaInference, LoadOptions};
use llama_dispatch::models::llama::ModelArgsOverrides;
use llama_dispatch::placement::{local_devices, DeviceMapSpec};
use snafu::{ResultExt, Whatever};

static DEFAULT_PROMPTS: [&str; 2] = [
    "I believe the meaning of life is",
    "Simply put, the theory of relativity states that",
];

/// Generate text with a LLaMA model that is split over processes and devices.
///
/// Multi-process runs read their rank and the rendezvous address from
/// WORLD_SIZE, WORLD_RANK, MASTER_ADDR and MASTER_PORT.
#[derive(Parser)]
#[command(name = "llama-dispatch", version)]
struct Args {
    /// Model name, e.g. 7B
    model: String,

    /// Maximum number of pieces to generate
    max_len: usize,

    /// Directory with the `<model>_vanilla` checkpoint directories
    #[arg(long, env = "LLAMA_MODELS_ROOT", default_value = "/scratch/llama/models")]
    models_root: PathBuf,

    /// Prompt, can be repeated
    #[arg(long = "prompt")]
    prompts: Vec<String>,

    /// Sampling temperature, 0 picks pieces greedily
    #[arg(long, default_value_t = 0.8)]
    temperature: f64,

    /// Nucleus sampling threshold
    #[arg(long, default_value_t = 0.95)]
    top_p: f64,

    /// Layer placement: auto, cpu or counts per CUDA device (0:16,1:16)
    #[arg(long, default_value = "auto")]
    device_map: DeviceMapSpec,

    /// Run on the CPU
    #[arg(long)]
    cpu: bool,

    /// Parameter data type: f16, bf16 or f32
    #[arg(long, value_parser = parse_dtype)]
    dtype: Option<DType>,

    /// Seed of the sampler
    #[arg(long, default_value_t = 299792458)]
    seed: u64,

    /// Stop generating a sequence when it contains this word, can be repeated
    #[arg(long = "stop-word")]
    stop_words: Vec<String>,

    /// Stop generating a sequence at this piece, can be repeated
    #[arg(long = "stop-id")]
    stop_ids: Vec<u32>,

    /// Number of generation runs
    #[arg(long, default_value_t = 1)]
    iterations: usize,

    /// Print generations and statistics as JSON
    #[arg(long)]
    json: bool,

    /// Maximum sequence length, prompt included
    #[arg(long)]
    max_seq_len: Option<usize>,
}

fn parse_dtype(dtype: &str) -> Result<DType, String> {
    match dtype {
        "f16" => Ok(DType::F16),
        "bf16" => Ok(DType::BF16),
        "f32" => Ok(DType::F32),
        _ => Err(format!("unsupported data type: {dtype}")),
    }
}

#[snafu::report]
fn main() -> Result<(), Whatever> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config =
        ProcessGroupConfig::from_env().whatever_context("Cannot read process group configuration")?;
    let group = init_process_group(&config).whatever_context("Cannot join process group")?;

    let prompts = if args.prompts.is_empty() {
        DEFAULT_PROMPTS.iter().map(|prompt| prompt.to_string()).collect()
    } else {
        args.prompts.clone()
    };

    let mut overrides = ModelArgsOverrides::default().max_batch_size(prompts.len());
    if let Some(max_seq_len) = args.max_seq_len {
        overrides = overrides.max_seq_len(max_seq_len);
    }
    let device_map = if args.cpu {
        DeviceMapSpec::Cpu
    } else {
        args.device_map.clone()
    };
    let mut load_options = LoadOptions::default()
        .device_map(device_map)
        .overrides(overrides)
        .local_devices(local_devices(
            args.cpu,
            config.local_devices.as_deref(),
            config.local_rank,
        ));
    if let Some(dtype) = args.dtype {
        load_options = load_options.dtype(dtype);
    }

    let llama_path = args.models_root.join(format!("{}_vanilla", args.model));
    let mut llama = LlamaInference::new(&llama_path, &args.model, &load_options, group)
        .whatever_context("Cannot load model")?;

    if llama.rank() != 0 {
        return llama.serve().whatever_context("Cannot serve pipeline stage");
    }

    let options = GenerateOptions::default()
        .max_gen_len(args.max_len)
        .temperature(args.temperature)
        .top_p(args.top_p)
        .seed(args.seed)
        .stop_ids(args.stop_ids.clone())
        .stop_words(args.stop_words.clone());
    let result = generate_iterations(&mut llama, &prompts, &options, &args);

    // Other ranks block until rank 0 stops the pipeline, also after a failure.
    match (result, llama.shutdown()) {
        (Ok(()), shutdown) => shutdown.whatever_context("Cannot stop pipeline"),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(shutdown_err)) => {
            log::warn!("Cannot stop pipeline after failed generation: {shutdown_err}");
            Err(err)
        }
    }
}

fn generate_iterations(
    llama: &mut LlamaInference,
    prompts: &[String],
    options: &GenerateOptions,
    args: &Args,
) -> Result<(), Whatever> {
    for _ in 0..args.iterations {
        let (generations, stats) = llama
            .generate(prompts, options)
            .whatever_context("Cannot generate")?;
        if args.json {
            let output = serde_json::json!({
                "generations": generations,
                "stats": stats,
            });
            println!("{output}");
        } else {
            for generation in &generations {
                println!("{generation}");
            }
            println!(
                "Generated {} pieces in {:.2}s ({:.2} pieces/s)",
                stats.toks, stats.total_seconds, stats.tokens_per_second
            );
        }
    }

    Ok(())
}
