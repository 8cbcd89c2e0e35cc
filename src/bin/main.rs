use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use half::f16;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use inference_session::config::{Endpoint, LogLevel, SessionConfig};
use inference_session::types::{
    BatchInferenceRequest, BatchInferenceResult, ChatRequest, ElementType, InferenceResult,
    ModelKind, NamedTensor, Usage,
};
use inference_session::vision::{
    bytes_to_f16, compare_f16, f16_to_bytes, nchw_to_nhwc, nhwc_to_nchw, Similarity,
};
use inference_session::{enable_tracer, setup_logging, FnSink, LogConfig, Session};

/// Drive an inference engine over its session protocol
#[derive(Parser)]
#[command(name = "inference-session", version)]
struct Cli {
    /// JSON session configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Engine endpoint: a socket path or host:port
    #[arg(long, global = true, env = "INFERENCE_ENDPOINT")]
    endpoint: Option<Endpoint>,

    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Append a JSON line per frame sent or received to this file
    #[arg(long, global = true)]
    trace_frames: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send one chat request and print the reply
    Chat {
        #[arg(long)]
        model: ModelKind,

        #[arg(long)]
        model_path: PathBuf,

        #[arg(long, default_value_t = 4096)]
        ctx_len: u32,

        /// Print chunks as they arrive
        #[arg(long)]
        stream: bool,

        prompt: String,
    },

    /// Run convolutional model regression cases against golden outputs
    TensorCheck {
        #[arg(long, default_value = ".")]
        model_root_path: PathBuf,

        #[arg(short, long, default_value = "test_results.json")]
        output: PathBuf,

        #[arg(required = true)]
        configs: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => SessionConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(endpoint) = cli.endpoint {
        config.endpoint = endpoint;
    }
    if let Some(level) = cli.log_level {
        config.monitoring.log_level = level;
    }

    setup_logging(LogConfig {
        level: config.monitoring.log_level.into(),
        ..Default::default()
    })
    .map_err(|e| anyhow!(e))?;

    if let Some(path) = &cli.trace_frames {
        enable_tracer(path).with_context(|| format!("opening trace file {}", path.display()))?;
    }

    match cli.command {
        Command::Chat {
            model,
            model_path,
            ctx_len,
            stream,
            prompt,
        } => chat(config, model, &model_path, ctx_len, stream, prompt).await,
        Command::TensorCheck {
            model_root_path,
            output,
            configs,
        } => tensor_check(config, &model_root_path, &output, &configs).await,
    }
}

async fn chat(
    config: SessionConfig,
    model: ModelKind,
    model_path: &Path,
    ctx_len: u32,
    stream: bool,
    prompt: String,
) -> Result<()> {
    let mut session = Session::builder()
        .with_config(config)
        .with_sink(FnSink(|chunk: &inference_session::types::ChatChunk| {
            if let Some(content) = chunk.content() {
                print!("{}", content);
                let _ = std::io::stdout().flush();
            }
        }))
        .build()?;

    info!(endpoint = %session.config().endpoint, "Connecting");
    session.init(model, model_path, ctx_len).await?;

    let result = session.run(ChatRequest::user(prompt), stream).await;
    let usage = match result {
        Ok(InferenceResult::ChatStream(sequence)) => {
            println!();
            if let Some(reason) = sequence.finish_reason() {
                info!(finish_reason = %reason, chunks = sequence.len(), "Stream finished");
            }
            sequence.usage()
        }
        Ok(InferenceResult::Chat(result)) => {
            println!("{}", result.text().unwrap_or_default());
            Some(result.usage)
        }
        Ok(InferenceResult::BatchInference(_)) => None,
        Err(e) => {
            let _ = session.terminate().await;
            return Err(e.into());
        }
    };

    if let Some(Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    }) = usage
    {
        eprintln!(
            "usage: prompt={} completion={} total={}",
            prompt_tokens, completion_tokens, total_tokens
        );
    }
    eprintln!("{}", serde_json::to_string_pretty(&session.metrics())?);

    session.terminate().await?;
    Ok(())
}

#[derive(Deserialize)]
struct CheckFile {
    #[serde(default)]
    include: Vec<PathBuf>,
    #[serde(default)]
    cases: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct CheckCase {
    model_id: i32,
    inputs: Vec<CheckInput>,
    golden: Vec<Golden>,
}

#[derive(Deserialize)]
struct CheckInput {
    #[serde(rename = "type")]
    kind: String,
    data_type: String,
    shape: Vec<i64>,
    pixel_file: PathBuf,
}

#[derive(Deserialize)]
struct Golden {
    file: PathBuf,
    shape: Vec<i64>,
}

#[derive(Serialize)]
struct OutputReport {
    output_index: usize,
    #[serde(flatten)]
    similarity: Similarity,
}

#[derive(Serialize)]
struct CaseReport {
    index: usize,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Vec<OutputReport>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct Report {
    cases: Vec<CaseReport>,
}

/// A case together with the directory its relative paths start from
struct PendingCase {
    dir: PathBuf,
    case: serde_json::Value,
}

/// Expand a config file, includes first; unreadable files and repeated
/// includes are reported and skipped
fn collect_cases(path: &Path, seen: &mut HashSet<PathBuf>, cases: &mut Vec<PendingCase>) {
    let canonical = match path.canonicalize() {
        Ok(canonical) => canonical,
        Err(e) => {
            error!("resolving {}: {}", path.display(), e);
            return;
        }
    };
    if !seen.insert(canonical) {
        error!("{} is included more than once, skipping", path.display());
        return;
    }

    let parsed = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))
        .and_then(|text| {
            serde_json::from_str::<CheckFile>(&text)
                .with_context(|| format!("parsing {}", path.display()))
        });
    let file = match parsed {
        Ok(file) => file,
        Err(e) => {
            error!("{:#}", e);
            return;
        }
    };

    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    for include in &file.include {
        collect_cases(&dir.join(include), seen, cases);
    }
    cases.extend(file.cases.into_iter().map(|case| PendingCase {
        dir: dir.clone(),
        case,
    }));
}

fn model_file(model: ModelKind) -> Result<&'static str> {
    match model {
        ModelKind::ResNet50 => Ok("int8_resnet50_sim_b1.pbnn"),
        ModelKind::RepVgg => Ok("int8_repvgg_b1_sim_b1.pbnn"),
        ModelKind::YoloV8s => Ok("yolov8s.pbnn"),
        other => bail!("{} is not a tensor regression model", other),
    }
}

async fn tensor_check(
    config: SessionConfig,
    model_root: &Path,
    output: &Path,
    configs: &[PathBuf],
) -> Result<()> {
    let mut cases = Vec::new();
    let mut seen = HashSet::new();
    for path in configs {
        collect_cases(path, &mut seen, &mut cases);
    }

    let mut report = Report { cases: Vec::new() };
    for (index, pending) in cases.into_iter().enumerate() {
        let name = pending
            .case
            .get("name")
            .and_then(|n| n.as_str())
            .unwrap_or("Unnamed")
            .to_string();
        info!(index, name = %name, "Running case");

        let (result, error) = match run_case(&config, model_root, &pending).await {
            Ok(outputs) => (Some(outputs), None),
            Err(e) => {
                warn!(index, name = %name, "Case failed: {:#}", e);
                (None, Some(format!("{:#}", e)))
            }
        };
        report.cases.push(CaseReport {
            index,
            name,
            result,
            error,
        });
    }

    let json = serde_json::to_string_pretty(&report)?;
    std::fs::write(output, json + "\n")
        .with_context(|| format!("writing {}", output.display()))?;
    println!("Test results written to {}", output.display());
    Ok(())
}

async fn run_case(
    config: &SessionConfig,
    model_root: &Path,
    pending: &PendingCase,
) -> Result<Vec<OutputReport>> {
    let case: CheckCase = serde_json::from_value(pending.case.clone())?;
    let model = ModelKind::from_id(case.model_id)?;
    let model_path = model_root.join(model_file(model)?);

    let mut request = BatchInferenceRequest::new(
        pending
            .case
            .get("name")
            .and_then(|n| n.as_str())
            .unwrap_or("Unnamed"),
    );
    for (i, input) in case.inputs.iter().enumerate() {
        request = request.with_tensor(load_input(&pending.dir, i, input)?);
    }

    let mut session = Session::new(config.clone())?;
    session.init(model, &model_path, 1).await?;
    let result = session.run(request, false).await;
    if let Err(e) = session.terminate().await {
        warn!("Terminate failed: {}", e);
    }
    let result = result?
        .into_batch()
        .ok_or_else(|| anyhow!("engine returned a non-batch result"))?;

    case.golden
        .iter()
        .enumerate()
        .map(|(i, golden)| verify_output(&pending.dir, &result, i, golden))
        .collect()
}

/// Read an NCHW input file and reorder it to the NHWC layout the engine takes
fn load_input(dir: &Path, index: usize, input: &CheckInput) -> Result<NamedTensor> {
    if input.kind != "pixel" {
        bail!("unsupported input type '{}'", input.kind);
    }
    let element_type: ElementType = input.data_type.parse()?;
    let path = dir.join(&input.pixel_file);
    let raw = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;

    let data = match element_type {
        ElementType::Float16 => {
            let values = bytes_to_f16(&raw)?;
            f16_to_bytes(&nchw_to_nhwc(&values, &input.shape)?)
        }
        ElementType::Uint8 => nchw_to_nhwc(&raw, &input.shape)?,
        other => bail!("unsupported input data type {}", other.as_str()),
    };
    Ok(NamedTensor::new(
        format!("input{}", index),
        data,
        input.shape.clone(),
        element_type,
    ))
}

fn verify_output(
    dir: &Path,
    result: &BatchInferenceResult,
    index: usize,
    golden: &Golden,
) -> Result<OutputReport> {
    let tensor = result
        .tensors
        .get(index)
        .ok_or_else(|| anyhow!("engine returned no output {}", index))?;
    if tensor.shape != golden.shape {
        bail!(
            "output {} has shape {:?}, golden shape is {:?}",
            index,
            tensor.shape,
            golden.shape
        );
    }
    if tensor.element_type != ElementType::Float16 {
        bail!(
            "output {} is {}, only float16 outputs can be verified",
            index,
            tensor.element_type.as_str()
        );
    }

    let nchw: Vec<f16> = nhwc_to_nchw(&bytes_to_f16(&tensor.data)?, &tensor.shape)?;
    let path = dir.join(&golden.file);
    let reference = bytes_to_f16(
        &std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?,
    )?;
    let similarity = compare_f16(&reference, &nchw)?;
    Ok(OutputReport {
        output_index: index,
        similarity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, name: &str, body: serde_json::Value) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body.to_string()).unwrap();
        path
    }

    #[test]
    fn test_collect_cases_follows_includes() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "resnet.json",
            serde_json::json!({ "cases": [{ "name": "resnet" }] }),
        );
        let root = write_config(
            dir.path(),
            "all.json",
            serde_json::json!({
                "include": ["resnet.json", "missing.json"],
                "cases": [{ "name": "yolo" }]
            }),
        );

        let mut cases = Vec::new();
        collect_cases(&root, &mut HashSet::new(), &mut cases);
        let names: Vec<_> = cases.iter().map(|c| c.case["name"].clone()).collect();
        assert_eq!(names, vec!["resnet", "yolo"]);
    }

    #[test]
    fn test_collect_cases_stops_on_include_cycle() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "b.json",
            serde_json::json!({ "include": ["a.json"], "cases": [{ "name": "b" }] }),
        );
        let a = write_config(
            dir.path(),
            "a.json",
            serde_json::json!({ "include": ["a.json", "b.json"], "cases": [{ "name": "a" }] }),
        );

        let mut cases = Vec::new();
        let mut seen = HashSet::new();
        collect_cases(&a, &mut seen, &mut cases);
        let names: Vec<_> = cases.iter().map(|c| c.case["name"].clone()).collect();
        assert_eq!(names, vec!["b", "a"]);

        // Listing the same file again on the command line adds nothing
        collect_cases(&a, &mut seen, &mut cases);
        assert_eq!(cases.len(), 2);
    }
}
