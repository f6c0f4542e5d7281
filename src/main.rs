use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use texture_forge::{
    EngineConfig, NodeCatalog, Session,
    gpu::{GpuContext, WgpuBackend},
    params::codec,
    shader::ShaderRegistry,
};

const USAGE: &str = "usage:
  texture-forge --list-nodes [--config <engine.json>]
  texture-forge --check-shaders [--shader-dir <dir>]
  texture-forge --bake-node <Type> --output <file> [--size <W>x<H>] [--param <name>=<json>]...
                [--config <engine.json>] [--env <equirect.hdr>]";

#[derive(Debug, Clone, PartialEq)]
enum Command {
    ListNodes,
    CheckShaders,
    BakeNode { node_type: String },
}

#[derive(Debug, Default, Clone)]
struct Cli {
    command: Option<Command>,
    config: Option<PathBuf>,
    shader_dir: Option<PathBuf>,
    output: Option<PathBuf>,
    size: Option<(u32, u32)>,
    environment: Option<PathBuf>,
    params: Vec<(String, String)>,
}

fn parse_size(text: &str) -> Result<(u32, u32)> {
    let (w, h) = text
        .split_once(['x', 'X'])
        .ok_or_else(|| anyhow!("invalid size '{text}', expected <W>x<H>"))?;
    let w: u32 = w.trim().parse().with_context(|| format!("invalid width in '{text}'"))?;
    let h: u32 = h.trim().parse().with_context(|| format!("invalid height in '{text}'"))?;
    if w == 0 || h == 0 {
        bail!("size must be non-zero, got {text}");
    }
    Ok((w, h))
}

fn parse_cli(args: &[String]) -> Result<Cli> {
    let mut cli = Cli::default();
    let mut i = 0;
    let value = |i: usize, flag: &str| -> Result<String> {
        args.get(i + 1)
            .cloned()
            .ok_or_else(|| anyhow!("missing value for {flag}"))
    };
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--list-nodes" => {
                cli.command = Some(Command::ListNodes);
                i += 1;
            }
            "--check-shaders" => {
                cli.command = Some(Command::CheckShaders);
                i += 1;
            }
            "--bake-node" => {
                cli.command = Some(Command::BakeNode {
                    node_type: value(i, flag)?,
                });
                i += 2;
            }
            "--config" => {
                cli.config = Some(PathBuf::from(value(i, flag)?));
                i += 2;
            }
            "--shader-dir" => {
                cli.shader_dir = Some(PathBuf::from(value(i, flag)?));
                i += 2;
            }
            "--output" | "-o" => {
                cli.output = Some(PathBuf::from(value(i, flag)?));
                i += 2;
            }
            "--size" => {
                cli.size = Some(parse_size(&value(i, flag)?)?);
                i += 2;
            }
            "--env" => {
                cli.environment = Some(PathBuf::from(value(i, flag)?));
                i += 2;
            }
            "--param" => {
                let raw = value(i, flag)?;
                let (name, json) = raw
                    .split_once('=')
                    .ok_or_else(|| anyhow!("invalid --param '{raw}', expected <name>=<json>"))?;
                cli.params.push((name.to_string(), json.to_string()));
                i += 2;
            }
            other => bail!("unknown argument: {other}\n{USAGE}"),
        }
    }
    Ok(cli)
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(dir) = &cli.shader_dir {
        config.shader_dir = Some(dir.clone());
    }
    if let Some(env) = &cli.environment {
        config.environment_map = Some(env.clone());
    }
    Ok(config)
}

fn list_nodes(config: &EngineConfig) -> Result<()> {
    let catalog = match &config.node_types {
        Some(path) => NodeCatalog::load(path)?,
        None => NodeCatalog::builtin()?,
    };
    for (index, node) in catalog.iter().enumerate() {
        println!(
            "{:<20} {:<10} inputs={} params={} ({} bytes){}",
            node.name,
            node.category.as_deref().unwrap_or("-"),
            node.inputs.len(),
            node.params.len(),
            catalog.compute_node_parameters_size(index),
            if node.cubemap { " cubemap" } else { "" }
        );
    }
    Ok(())
}

fn check_shaders(config: &EngineConfig) -> Result<()> {
    let mut registry: ShaderRegistry<()> = ShaderRegistry::with_builtin();
    if let Some(dir) = &config.shader_dir {
        let count = registry.load_dir(dir)?;
        log::info!("loaded {count} shader(s) from {}", dir.display());
    }
    let mut failed = 0;
    for (id, result) in registry.check_all() {
        match result {
            Ok(()) => println!("ok      {id}"),
            Err(err) => {
                failed += 1;
                println!("FAILED  {id}\n{err:#}");
            }
        }
    }
    if failed > 0 {
        bail!("{failed} shader(s) failed validation");
    }
    Ok(())
}

fn bake_node(cli: &Cli, config: &EngineConfig, node_type: &str) -> Result<()> {
    let output = cli
        .output
        .as_ref()
        .ok_or_else(|| anyhow!("--bake-node requires --output <file>"))?;
    let [bw, bh] = config.batch_resolution;
    let (width, height) = cli.size.unwrap_or((bw, bh));

    let gpu = GpuContext::headless(config.power_preference)?;
    let backend = WgpuBackend::new(gpu)?;
    let mut session = Session::with_backend(backend, config)?;
    let node = session.add_node(node_type)?;
    for (name, raw) in &cli.params {
        let json: serde_json::Value = serde_json::from_str(raw)
            .or_else(|_| serde_json::to_value(raw))
            .with_context(|| format!("invalid value for --param {name}"))?;
        session.edit_parameters(node, |block| {
            let def = block
                .layout()
                .field(name)
                .map(|f| f.def.clone())
                .ok_or_else(|| anyhow!("{node_type} has no parameter '{name}'"))?;
            let value = codec::value_from_json(&def, &json)?;
            block.set(name, value)
        })?;
    }
    session.bake(node, output, width, height)?;
    println!("saved: {}", output.display());
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let argv: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli(&argv)?;
    let config = load_config(&cli)?;

    match cli.command.clone() {
        Some(Command::ListNodes) => list_nodes(&config),
        Some(Command::CheckShaders) => check_shaders(&config),
        Some(Command::BakeNode { node_type }) => bake_node(&cli, &config, &node_type),
        None => {
            eprintln!("{USAGE}");
            Ok(())
        }
    }
}
