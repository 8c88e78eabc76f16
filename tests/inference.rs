use std::fs;
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use llama_dispatch::checkpoint::CheckpointLayoutError;
use llama_dispatch::distributed::{init_process_group, LocalGroup, ProcessGroupConfig};
use llama_dispatch::generation::{GenerateOptions, GenerationStats};
use llama_dispatch::inference::{InferenceError, LlamaInference, LoadOptions};
use llama_dispatch::placement::DeviceMapSpec;
use snafu::{report, ResultExt, Whatever};

mod common;
use common::{random_parameters, Naming, TinyCheckpoint, MODEL, N_PIECES};

const PROMPTS: [&str; 2] = ["the meaning of life", "hello"];

fn load_options() -> LoadOptions {
    LoadOptions::default().device_map(DeviceMapSpec::Cpu)
}

fn greedy() -> GenerateOptions {
    GenerateOptions::default().temperature(0.).max_gen_len(4)
}

fn generate_local(
    checkpoint: &TinyCheckpoint,
    options: &GenerateOptions,
) -> Result<(Vec<String>, GenerationStats), Whatever> {
    let mut llama = LlamaInference::new(
        checkpoint.llama_path(),
        MODEL,
        &load_options(),
        Box::new(LocalGroup),
    )
    .whatever_context("Cannot load model")?;
    llama
        .generate(&PROMPTS[..1], options)
        .whatever_context("Cannot generate")
}

#[test]
#[report]
fn single_process_generation() -> Result<(), Whatever> {
    let checkpoint = TinyCheckpoint::new(true);
    let (texts, stats) = generate_local(&checkpoint, &greedy())?;

    assert_eq!(texts.len(), 1);
    assert!(texts[0].starts_with(PROMPTS[0]));
    assert_eq!(stats.prompt_tokens, vec![5]);
    assert!(stats.num_generated_tokens[0] <= 4);
    assert_eq!(stats.toks, stats.num_generated_tokens[0]);
    assert!(stats.total_seconds > 0.);

    Ok(())
}

#[test]
#[report]
fn greedy_generation_is_deterministic() -> Result<(), Whatever> {
    let checkpoint = TinyCheckpoint::new(false);
    let (first, _) = generate_local(&checkpoint, &greedy())?;
    let (second, _) = generate_local(&checkpoint, &greedy())?;
    assert_eq!(first, second);

    Ok(())
}

#[test]
#[report]
fn stop_ids_covering_vocabulary_generate_nothing() -> Result<(), Whatever> {
    let checkpoint = TinyCheckpoint::new(true);
    let options = greedy().stop_ids((0..N_PIECES as u32).collect());
    let (texts, stats) = generate_local(&checkpoint, &options)?;

    assert_eq!(texts, vec![PROMPTS[0]]);
    assert_eq!(stats.num_generated_tokens, vec![0]);
    assert_eq!(stats.toks, 0);

    Ok(())
}

#[test]
#[report]
fn hugging_face_checkpoint_matches_original_layout() -> Result<(), Whatever> {
    let parameters = random_parameters(true);
    let meta = TinyCheckpoint::write(&parameters, Naming::Meta);
    let hf = TinyCheckpoint::write(&parameters, Naming::HuggingFace);
    let options = greedy().max_gen_len(6);

    let (expected, _) = generate_local(&meta, &options)?;
    let (texts, stats) = generate_local(&hf, &options)?;

    assert!(texts[0].starts_with(PROMPTS[0]));
    assert_eq!(stats.prompt_tokens, vec![5]);
    assert_eq!(texts, expected);

    Ok(())
}

#[test]
fn missing_tokenizer_is_reported() {
    let checkpoint = TinyCheckpoint::new(true);
    fs::remove_file(checkpoint.llama_path().join("tokenizer.json")).unwrap();

    let result = LlamaInference::new(
        checkpoint.llama_path(),
        MODEL,
        &load_options(),
        Box::new(LocalGroup),
    );
    match result {
        Err(InferenceError::Layout {
            source: CheckpointLayoutError::TokenizerMissing { .. },
        }) => (),
        Err(err) => panic!("unexpected error: {err}"),
        Ok(_) => panic!("model without tokenizer was loaded"),
    }
}

#[test]
fn missing_model_is_reported() {
    let checkpoint = TinyCheckpoint::new(true);
    let result = LlamaInference::new(
        checkpoint.llama_path(),
        "absent",
        &load_options(),
        Box::new(LocalGroup),
    );
    assert!(matches!(
        result,
        Err(InferenceError::Layout {
            source: CheckpointLayoutError::ModelDirMissing { .. }
        })
    ));
}

#[test]
#[report]
fn two_rank_pipeline_matches_single_process() -> Result<(), Whatever> {
    let checkpoint = TinyCheckpoint::new(true);
    let options = greedy().max_gen_len(6);
    let mut llama = LlamaInference::new(
        checkpoint.llama_path(),
        MODEL,
        &load_options(),
        Box::new(LocalGroup),
    )
    .whatever_context("Cannot load model")?;
    let (expected, _) = llama
        .generate(&PROMPTS[..1], &options)
        .whatever_context("Cannot generate")?;

    let port = TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .whatever_context("Cannot find free port")?
        .port();
    let llama_path = checkpoint.llama_path().to_path_buf();

    let handles: Vec<_> = (0..2)
        .map(|rank| {
            let llama_path = llama_path.clone();
            let options = options.clone();
            thread::spawn(move || -> Option<Vec<String>> {
                let config = ProcessGroupConfig::default()
                    .world_size(2)
                    .rank(rank)
                    .master_addr("127.0.0.1")
                    .master_port(port)
                    .timeout(Duration::from_secs(60));
                let group = init_process_group(&config).expect("Cannot join process group");
                let mut llama = LlamaInference::new(&llama_path, MODEL, &load_options(), group)
                    .expect("Cannot load model");
                if rank == 0 {
                    let (texts, _) = llama
                        .generate(&PROMPTS[..1], &options)
                        .expect("Cannot generate");
                    // The cache must be reset between runs.
                    let (again, _) = llama
                        .generate(&PROMPTS[..1], &options)
                        .expect("Cannot generate");
                    assert_eq!(texts, again);
                    llama.shutdown().expect("Cannot stop pipeline");
                    Some(texts)
                } else {
                    llama.serve().expect("Cannot serve");
                    None
                }
            })
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.join().expect("Rank panicked"));
    }
    assert_eq!(results[0].as_ref(), Some(&expected));
    assert_eq!(results[1], None);

    Ok(())
}

#[test]
#[report]
fn shutdown_after_failed_generation_stops_other_ranks() -> Result<(), Whatever> {
    let checkpoint = TinyCheckpoint::new(true);
    let port = TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .whatever_context("Cannot find free port")?
        .port();
    let llama_path = checkpoint.llama_path().to_path_buf();

    let handles: Vec<_> = (0..2)
        .map(|rank| {
            let llama_path = llama_path.clone();
            thread::spawn(move || {
                let config = ProcessGroupConfig::default()
                    .world_size(2)
                    .rank(rank)
                    .master_addr("127.0.0.1")
                    .master_port(port)
                    .timeout(Duration::from_secs(60));
                let group = init_process_group(&config).expect("Cannot join process group");
                let mut llama = LlamaInference::new(&llama_path, MODEL, &load_options(), group)
                    .expect("Cannot load model");
                if rank == 0 {
                    let no_prompts: [&str; 0] = [];
                    assert!(matches!(
                        llama.generate(&no_prompts, &greedy()),
                        Err(InferenceError::Generate { .. })
                    ));
                    llama.shutdown().expect("Cannot stop pipeline");
                } else {
                    llama.serve().expect("Cannot serve");
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Rank panicked");
    }

    Ok(())
}
