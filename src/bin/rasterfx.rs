use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use rasterfx::{
    BackendOptions, CapabilityProbe, ContextKind, FilterBackend, RasterSurface,
    SoftwareContextFactory, capability_probe,
};

#[derive(Parser, Debug)]
#[command(name = "rasterfx", version)]
struct Cli {
    /// Backend options JSON.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the tile size (backing surface and readback limit).
    #[arg(long, global = true)]
    tile_size: Option<u32>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report graphics capabilities.
    Probe(ProbeArgs),
    /// Round-trip an image through the backend with an empty filter chain.
    Copy(CopyArgs),
}

#[derive(Parser, Debug)]
struct ProbeArgs {
    /// Context family to probe.
    #[arg(long, value_enum)]
    backend: Option<BackendChoice>,
}

#[derive(Parser, Debug)]
struct CopyArgs {
    /// Input image.
    #[arg(long = "in")]
    in_path: PathBuf,

    /// Output PNG path.
    #[arg(long)]
    out: PathBuf,

    /// Working width (defaults to the image width).
    #[arg(long)]
    width: Option<u32>,

    /// Working height (defaults to the image height).
    #[arg(long)]
    height: Option<u32>,

    /// Context family to use.
    #[arg(long, value_enum)]
    backend: Option<BackendChoice>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendChoice {
    Software,
    Headless,
}

impl From<BackendChoice> for ContextKind {
    fn from(value: BackendChoice) -> Self {
        match value {
            BackendChoice::Software => ContextKind::Software,
            BackendChoice::Headless => ContextKind::Headless,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let options = load_options(cli.config.as_deref(), cli.tile_size)?;
    match cli.cmd {
        Command::Probe(args) => cmd_probe(options, args),
        Command::Copy(args) => cmd_copy(options, args),
    }
}

fn load_options(path: Option<&Path>, tile_size: Option<u32>) -> anyhow::Result<BackendOptions> {
    let mut options = match path {
        Some(path) => {
            let s = std::fs::read_to_string(path)
                .with_context(|| format!("read config '{}'", path.display()))?;
            BackendOptions::from_json_str(&s)
                .with_context(|| format!("parse config '{}'", path.display()))?
        }
        None => BackendOptions::default(),
    };
    if let Some(tile_size) = tile_size {
        options.tile_size = tile_size;
    }
    options.validate()?;
    Ok(options)
}

fn cmd_probe(mut options: BackendOptions, args: ProbeArgs) -> anyhow::Result<()> {
    if let Some(backend) = args.backend {
        options.context = backend.into();
    }

    let software;
    let probe: &CapabilityProbe = match options.context {
        ContextKind::Software => {
            software = CapabilityProbe::from_factory(SoftwareContextFactory::default());
            &software
        }
        ContextKind::Headless | ContextKind::Attached => capability_probe(),
    };

    println!("context: {:?}", options.context);
    match probe.capabilities() {
        Some(caps) => {
            println!("max_texture_size: {}", caps.max_texture_size);
            match caps.precision {
                Some(p) => println!("precision: {p}"),
                None => println!("precision: none"),
            }
            println!(
                "tile_size {} supported: {}",
                options.tile_size,
                probe.is_supported(options.tile_size)
            );
        }
        None => {
            println!("no graphics context available");
            return Ok(());
        }
    }

    let mut backend = FilterBackend::new(options)?;
    let info = backend.capture_gpu_info();
    if !info.renderer.is_empty() {
        println!("renderer: {}", info.renderer);
        println!("vendor: {}", info.vendor);
    }
    Ok(())
}

fn cmd_copy(mut options: BackendOptions, args: CopyArgs) -> anyhow::Result<()> {
    if let Some(backend) = args.backend {
        options.context = backend.into();
    }

    let img = image::open(&args.in_path)
        .with_context(|| format!("open image '{}'", args.in_path.display()))?
        .to_rgba8();
    let width = args.width.unwrap_or(img.width());
    let height = args.height.unwrap_or(img.height());
    if width > options.tile_size || height > options.tile_size {
        anyhow::bail!(
            "{width}x{height} exceeds tile size {}; pass --tile-size",
            options.tile_size
        );
    }

    let mut backend = FilterBackend::new(options)?;
    if !backend.has_context() {
        anyhow::bail!("no graphics context available for {:?}", backend.options().context);
    }

    let mut target = RasterSurface::new(0, 0);
    backend
        .apply_filters(&[], &img, width, height, &mut target, None)
        .context("run empty filter chain")?;

    if let Some(parent) = args.out.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create output dir '{}'", parent.display()))?;
    }
    target
        .to_rgba_image()?
        .save(&args.out)
        .with_context(|| format!("write png '{}'", args.out.display()))?;
    println!("wrote {}", args.out.display());
    Ok(())
}
